// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Transport-agnostic bridge behavior: channel-set diff exchange, serial-based cycle
//! suppression, and message/group-event forwarding. A concrete transport (`PipeBridge`,
//! `TcpBridge`, ...) owns the byte stream and feeds decoded frames in via `handle_frame`;
//! outbound frames leave through the transport's `FrameSink`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};

use crate::bus::{LocalBus, SerialOutcome};
use crate::codec::wire::{self, BridgeMessage, ChannelOp};
use crate::ids::{ChannelId, SenderId, SerialId};
use crate::listener::{ChannelFilter, ChannelMonitor, Listener, ListenerHandle, MonitorHandle};
use crate::message::Message;

/// Where a bridge writes its outbound frames; implemented by each transport.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Fresh,
    Handshaking,
    Active,
    Resuming,
    Closed,
}

struct State {
    machine: BridgeState,
    cur_channels: Vec<ChannelId>,
    chan_hash: u64,
    cycle_detected: bool,
    last_sent_serial: SerialId,
    session_id: Option<String>,
}

pub struct BridgeCore {
    bus: LocalBus,
    sink: Mutex<Arc<dyn FrameSink>>,
    filter: Option<Arc<dyn ChannelFilter>>,
    weak_self: Weak<BridgeCore>,
    state: Mutex<State>,
}

impl BridgeCore {
    pub fn new(bus: LocalBus, sink: Arc<dyn FrameSink>, filter: Option<Arc<dyn ChannelFilter>>) -> Arc<BridgeCore> {
        Arc::new_cyclic(|weak| BridgeCore {
            bus,
            sink: Mutex::new(sink),
            filter,
            weak_self: weak.clone(),
            state: Mutex::new(State {
                machine: BridgeState::Fresh,
                cur_channels: Vec::new(),
                chan_hash: 0,
                cycle_detected: false,
                last_sent_serial: SerialId::default(),
                session_id: None,
            }),
        })
    }

    fn handle(&self) -> ListenerHandle {
        self.weak_self.upgrade().expect("bridge core outlives its own Arc")
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("bridge state poisoned")
    }

    fn sink(&self) -> Arc<dyn FrameSink> {
        self.sink.lock().expect("bridge sink lock poisoned").clone()
    }

    /// Points this bridge at a new transport after a reconnect, keeping its bus subscriptions,
    /// serial state, and identity (the `Arc<BridgeCore>` used as the bus's `ListenerHandle`)
    /// intact across the gap — the point of session resumption.
    pub fn rebind_sink(&self, sink: Arc<dyn FrameSink>) {
        *self.sink.lock().expect("bridge sink lock poisoned") = sink;
    }

    pub fn bridge_state(&self) -> BridgeState {
        self.state().machine
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    pub fn set_session_id(&self, id: Option<String>) {
        self.state().session_id = id;
    }

    /// Registers this bridge as a channel-set monitor. Call once, after construction.
    pub fn attach(self: &Arc<Self>) {
        let monitor: MonitorHandle = self.clone();
        self.bus.register_monitor(monitor);
    }

    /// Unregisters the monitor and drops every channel this bridge proxied for the peer.
    pub fn detach(self: &Arc<Self>) {
        let monitor: MonitorHandle = self.clone();
        self.bus.unregister_monitor(&monitor);
        self.bus.unsubscribe_all(self.handle());
    }

    pub fn on_connected(&self) {
        self.state().machine = BridgeState::Handshaking;
    }

    /// A fresh or resumed session became usable: reset peer-learned channels, move to
    /// Active, and announce ourselves.
    pub fn on_session_established(&self) {
        self.reset_peer_state();
        self.state().machine = BridgeState::Active;
        self.sink().send_frame(wire::encode_new_session(1));
    }

    pub fn on_disconnected(&self, session_resumable: bool) {
        self.state().machine = if session_resumable { BridgeState::Resuming } else { BridgeState::Closed };
    }

    /// Decodes one bridge-protocol frame and applies it. Call for every frame the transport
    /// hands over (already unwrapped from pipe or WebSocket framing).
    pub fn handle_frame(&self, frame: &[u8]) {
        if let Some(msg) = wire::decode(frame) {
            self.handle_message(msg);
        }
    }

    fn handle_message(&self, msg: BridgeMessage<'_>) {
        match msg {
            BridgeMessage::Message { conversation, sender, channel, content } => {
                let sender_id = SenderId::from(sender);
                if !sender_id.is_empty() {
                    self.bus.remember_return_path(sender_id.clone(), self.handle());
                }
                let delivered = self.bus.deliver_from_bridge(sender_id.clone(), &self.handle(), channel, content.to_vec(), conversation);
                if !delivered {
                    self.sink().send_frame(wire::encode_no_route(&sender_id, &ChannelId::from(channel)));
                }
            }
            BridgeMessage::Channels { op, list } => self.apply_channels(op, list),
            BridgeMessage::ChannelsReset => self.drop_all_proxied_channels(),
            BridgeMessage::NoRoute { sender, receiver } => {
                self.bus.clear_return_path(self.handle(), SenderId::from(sender), ChannelId::from(receiver));
            }
            BridgeMessage::AddToGroup { group, target } => {
                let _ = self.bus.add_to_group(self.handle(), ChannelId::from(group), target);
            }
            BridgeMessage::CloseGroup { group } => {
                let _ = self.bus.close_group(self.handle(), ChannelId::from(group));
            }
            BridgeMessage::GroupEmpty { .. } => {
                // Informational: the owning side already tore the group down via CloseGroup.
            }
            BridgeMessage::NewSession { .. } => self.on_session_established(),
            BridgeMessage::UpdateSerial { serial } => self.apply_serial(serial),
            BridgeMessage::UserMsg { .. } => {}
        }
    }

    fn apply_channels(&self, op: ChannelOp, list: Vec<&str>) {
        if self.state().cycle_detected {
            return;
        }

        let handle = self.handle();
        let names: Vec<ChannelId> = list
            .into_iter()
            .map(ChannelId::from)
            .filter(|c| self.filter.as_ref().map(|f| f.incoming(c)).unwrap_or(true))
            .collect();

        match op {
            ChannelOp::Replace => {
                let current = self.bus.get_subscribed_channels(&handle);
                for c in &current {
                    if !names.contains(c) {
                        self.bus.unsubscribe(handle.clone(), c.clone());
                    }
                }
                for c in &names {
                    self.bus.subscribe(handle.clone(), c.clone());
                }
            }
            ChannelOp::Add => {
                for c in names {
                    self.bus.subscribe(handle.clone(), c);
                }
            }
            ChannelOp::Erase => {
                for c in names {
                    self.bus.unsubscribe(handle.clone(), c);
                }
            }
        }
    }

    fn drop_all_proxied_channels(&self) {
        let handle = self.handle();
        for c in self.bus.get_subscribed_channels(&handle) {
            self.bus.unsubscribe(handle.clone(), c);
        }
    }

    fn reset_peer_state(&self) {
        self.drop_all_proxied_channels();
        {
            let mut state = self.state();
            state.cur_channels.clear();
            state.chan_hash = 0;
        }
        self.recompute_export();
    }

    fn apply_serial(&self, serial: &str) {
        let handle = self.handle();
        let outcome = self.bus.offer_serial(&handle, &SerialId::from(serial));
        self.state().cycle_detected = matches!(outcome, SerialOutcome::Loop);
        self.recompute_export();
    }

    /// Recomputes the exportable channel set for this peer and sends a `ChannelsReplace`
    /// (first computation) or an `Add`/`Erase` diff against the last advertised set.
    fn recompute_export(&self) {
        if self.state().cycle_detected {
            let had_export = self.state().chan_hash != 0;
            if had_export {
                let mut state = self.state();
                state.chan_hash = 0;
                state.cur_channels.clear();
                drop(state);
                self.sink().send_frame(wire::encode_channels(ChannelOp::Replace, &[]));
            }
            return;
        }

        let handle = self.handle();
        let mut exported = self.bus.get_active_channels(&handle);
        if let Some(filter) = &self.filter {
            exported.retain(|c| filter.outgoing(c, false));
        }
        exported.sort();
        exported.dedup();

        let hash = hash_channels(&exported);
        let is_first = {
            let state = self.state();
            if hash == state.chan_hash {
                return;
            }
            state.cur_channels.is_empty()
        };

        if is_first {
            let mut state = self.state();
            state.chan_hash = hash;
            state.cur_channels = exported.clone();
            drop(state);
            self.sink().send_frame(wire::encode_channels(ChannelOp::Replace, &exported));
        } else {
            let (added, removed) = {
                let state = self.state();
                let added: Vec<ChannelId> = exported.iter().filter(|c| !state.cur_channels.contains(c)).cloned().collect();
                let removed: Vec<ChannelId> = state.cur_channels.iter().filter(|c| !exported.contains(c)).cloned().collect();
                (added, removed)
            };
            {
                let mut state = self.state();
                state.chan_hash = hash;
                state.cur_channels = exported;
            }
            if !added.is_empty() {
                self.sink().send_frame(wire::encode_channels(ChannelOp::Add, &added));
            }
            if !removed.is_empty() {
                self.sink().send_frame(wire::encode_channels(ChannelOp::Erase, &removed));
            }
        }

        self.maybe_send_serial_update();
    }

    fn maybe_send_serial_update(&self) {
        let handle = self.handle();
        let current = self.bus.get_serial(&handle);
        let changed = {
            let mut state = self.state();
            if current == state.last_sent_serial {
                false
            } else {
                state.last_sent_serial = current.clone();
                true
            }
        };
        if changed {
            self.sink().send_frame(wire::encode_update_serial(current.as_str()));
        }
    }
}

fn hash_channels(sorted_unique: &[ChannelId]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for c in sorted_unique {
        c.as_str().hash(&mut hasher);
    }
    hasher.finish()
}

impl Listener for BridgeCore {
    /// Forwards every message the bus delivers to us, regardless of `pm`: private replies
    /// get forwarded too, relying on the return-path cache staying fresh hop by hop.
    fn on_message(&self, message: &Message, _pm: bool) {
        self.sink().send_frame(wire::encode_message(message));
    }

    fn on_clear_path(&self, sender: &ChannelId, receiver: &ChannelId) {
        self.sink().send_frame(wire::encode_no_route(&SenderId::from(sender.as_str()), receiver));
    }

    fn on_add_to_group(&self, group_name: &ChannelId, target_id: &ChannelId) {
        self.sink().send_frame(wire::encode_add_to_group(group_name, target_id));
    }

    fn on_close_group(&self, group_name: &ChannelId) {
        self.sink().send_frame(wire::encode_close_group(group_name));
    }

    fn on_group_empty(&self, group_name: &ChannelId) {
        self.sink().send_frame(wire::encode_group_empty(group_name));
    }
}

impl ChannelMonitor for BridgeCore {
    fn on_channels_update(&self) {
        self.recompute_export();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct CapturingSink {
        frames: StdMutex<Vec<Vec<u8>>>,
    }
    impl CapturingSink {
        fn new() -> Arc<Self> {
            Arc::new(CapturingSink { frames: StdMutex::new(Vec::new()) })
        }
        fn decoded(&self) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| format!("{:?}", wire::decode(f)))
                .collect()
        }
        fn raw_frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }
    }
    impl FrameSink for CapturingSink {
        fn send_frame(&self, frame: Vec<u8>) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    #[test]
    fn subscribing_locally_triggers_initial_replace_export() {
        let bus = LocalBus::new();
        let sink = CapturingSink::new();
        let bridge = BridgeCore::new(bus.clone(), sink.clone(), None);
        bridge.attach();

        struct Noop;
        impl Listener for Noop {
            fn on_message(&self, _m: &Message, _pm: bool) {}
        }
        bus.subscribe(Arc::new(Noop), ChannelId::from("reverse"));

        let frames = sink.decoded();
        assert!(frames.iter().any(|f| f.contains("Channels") && f.contains("Replace") && f.contains("reverse")));
    }

    #[test]
    fn local_broadcast_is_forwarded_as_message_frame() {
        let bus = LocalBus::new();
        let sink = CapturingSink::new();
        let bridge = BridgeCore::new(bus.clone(), sink.clone(), None);
        bridge.attach();

        let handle: ListenerHandle = bridge.clone();
        bus.subscribe(handle, ChannelId::from("reverse"));
        bus.send_message(None, "reverse", b"ahoj".to_vec(), 0);

        let forwarded = sink.raw_frames().iter().any(|f| match wire::decode(f) {
            Some(wire::BridgeMessage::Message { channel, content, .. }) => channel == "reverse" && content == b"ahoj",
            _ => false,
        });
        assert!(forwarded);
    }

    #[test]
    fn inbound_channels_replace_subscribes_bridge_locally() {
        let bus = LocalBus::new();
        let sink = CapturingSink::new();
        let bridge = BridgeCore::new(bus.clone(), sink, None);
        bridge.attach();

        let frame = wire::encode_channels(ChannelOp::Replace, &[ChannelId::from("reverse")]);
        bridge.handle_frame(&frame);

        assert!(bus.is_channel(&ChannelId::from("reverse")));
    }

    #[test]
    fn inbound_message_with_unknown_destination_gets_no_route_reply() {
        let bus = LocalBus::new();
        let sink = CapturingSink::new();
        let bridge = BridgeCore::new(bus, sink.clone(), None);
        bridge.attach();

        let frame = wire::encode_message(&Message::new(
            SenderId::from("peer-mbx-1"),
            ChannelId::from("nobody-home"),
            b"hi".to_vec(),
            0,
        ));
        bridge.handle_frame(&frame);

        assert!(sink.decoded().iter().any(|f| f.contains("NoRoute")));
    }

    #[test]
    fn matching_serial_from_different_source_is_a_loop() {
        let bus = LocalBus::new();
        let sink_a = CapturingSink::new();
        let bridge_a = BridgeCore::new(bus.clone(), sink_a, None);
        bridge_a.attach();

        let offered = SerialId::from("000-authoritative");
        bridge_a.handle_frame(&wire::encode_update_serial(offered.as_str()));
        assert_eq!(bridge_a.bridge_state(), BridgeState::Fresh);

        let sink_b = CapturingSink::new();
        let bridge_b = BridgeCore::new(bus, sink_b, None);
        bridge_b.attach();
        bridge_b.handle_frame(&wire::encode_update_serial(offered.as_str()));

        // bridge_b offered the same serial bridge_a already installed from a different
        // source: that closes a loop, so bridge_b must suppress its export.
        assert!(bridge_b.state().cycle_detected);
    }
}
