// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! An in-process bridge joining two `LocalBus` instances with no transport at all: each
//! side's outbound frame is handed straight to the other side's `handle_frame`. Used for
//! testing the bridge protocol itself, and as the degenerate case other transports reduce to
//! once framing is stripped away.

use std::sync::{Arc, Mutex, Weak};

use crate::bridge::core::{BridgeCore, FrameSink};
use crate::bus::LocalBus;
use crate::listener::ChannelFilter;

struct Relay {
    peer: Mutex<Weak<BridgeCore>>,
}

impl FrameSink for Relay {
    fn send_frame(&self, frame: Vec<u8>) {
        if let Some(peer) = self.peer.lock().expect("relay lock poisoned").upgrade() {
            peer.handle_frame(&frame);
        }
    }
}

/// A live point-to-point bridge between two local buses. Dropping it detaches both sides.
pub struct DirectBridge {
    left: Arc<BridgeCore>,
    right: Arc<BridgeCore>,
}

impl DirectBridge {
    pub fn new(left_bus: LocalBus, right_bus: LocalBus) -> DirectBridge {
        Self::with_filters(left_bus, None, right_bus, None)
    }

    pub fn with_filters(
        left_bus: LocalBus,
        left_filter: Option<Arc<dyn ChannelFilter>>,
        right_bus: LocalBus,
        right_filter: Option<Arc<dyn ChannelFilter>>,
    ) -> DirectBridge {
        let left_relay = Arc::new(Relay { peer: Mutex::new(Weak::new()) });
        let right_relay = Arc::new(Relay { peer: Mutex::new(Weak::new()) });

        let left = BridgeCore::new(left_bus, left_relay.clone(), left_filter);
        let right = BridgeCore::new(right_bus, right_relay.clone(), right_filter);

        *left_relay.peer.lock().unwrap() = Arc::downgrade(&right);
        *right_relay.peer.lock().unwrap() = Arc::downgrade(&left);

        left.attach();
        right.attach();
        left.on_connected();
        right.on_connected();
        left.on_session_established();
        right.on_session_established();

        DirectBridge { left, right }
    }
}

impl Drop for DirectBridge {
    fn drop(&mut self) {
        self.left.detach();
        self.right.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ChannelId;
    use crate::listener::Listener;
    use crate::message::Message;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Recorder {
        received: StdMutex<Vec<String>>,
    }
    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder { received: StdMutex::new(Vec::new()) })
        }
    }
    impl Listener for Recorder {
        fn on_message(&self, message: &Message, _pm: bool) {
            self.received.lock().unwrap().push(message.content_str().into_owned());
        }
    }

    struct Reverser {
        bus: LocalBus,
    }
    impl Listener for Reverser {
        fn on_message(&self, message: &Message, _pm: bool) {
            let reversed: String = message.content_str().chars().rev().collect();
            self.bus.send_message(None, message.sender().as_str(), reversed.into_bytes(), message.conversation());
        }
    }

    fn wait_for_channel(bus: &LocalBus, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if bus.is_channel(&ChannelId::from(name)) {
                return true;
            }
            thread::yield_now();
        }
        bus.is_channel(&ChannelId::from(name))
    }

    #[test]
    fn two_bus_bridge_relays_a_reversed_reply() {
        let m = LocalBus::new();
        let s = LocalBus::new();
        let _bridge = DirectBridge::new(m.clone(), s.clone());

        let reverser: Arc<dyn Listener> = Arc::new(Reverser { bus: m.clone() });
        m.subscribe(reverser, ChannelId::from("reverse"));

        assert!(wait_for_channel(&s, "reverse", Duration::from_secs(2)));

        let client = Recorder::new();
        let client_handle: Arc<dyn Listener> = client.clone();
        s.send_message(Some(client_handle), "reverse", b"ahoj svete".to_vec(), 1);

        assert_eq!(client.received.lock().unwrap().as_slice(), ["etevs joha".to_string()]);
    }

    #[test]
    fn triangle_of_bridges_suppresses_duplicate_delivery() {
        let m = LocalBus::new();
        let s1 = LocalBus::new();
        let s2 = LocalBus::new();

        let _b1 = DirectBridge::new(m.clone(), s1.clone());
        let _b2 = DirectBridge::new(m.clone(), s2.clone());
        let _b3 = DirectBridge::new(s1.clone(), s2.clone());

        let reverser: Arc<dyn Listener> = Arc::new(Reverser { bus: s1.clone() });
        s1.subscribe(reverser, ChannelId::from("reverse"));

        assert!(wait_for_channel(&s2, "reverse", Duration::from_secs(2)));

        let client = Recorder::new();
        let client_handle: Arc<dyn Listener> = client.clone();
        s2.send_message(Some(client_handle), "reverse", b"ahoj svete".to_vec(), 1);

        assert_eq!(client.received.lock().unwrap().as_slice(), ["etevs joha".to_string()]);
    }
}
