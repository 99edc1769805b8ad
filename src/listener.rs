// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Capability traits a participant in the bus implements.
//!
//! A plain subscriber only needs `on_message`; a bridge additionally reacts to
//! `on_clear_path`/`on_add_to_group`/`on_close_group`/`on_group_empty` so it can forward
//! those events across its transport. `ChannelMonitor` is a wholly separate registration,
//! used by bridges to learn when the exportable channel set changed.

use std::sync::Arc;

use crate::ids::ChannelId;
use crate::message::Message;

/// A message recipient. All callbacks are declared non-failing: a panic inside one is
/// undefined behavior from the bus's point of view.
pub trait Listener: Send + Sync {
    /// `pm` is true when the message was delivered to this listener's private mailbox or
    /// through a return-path entry; in that case the message's channel field carries the
    /// mailbox id rather than a meaningful channel name.
    fn on_message(&self, message: &Message, pm: bool);

    /// Called when the route to `receiver` should be considered stale, propagating from
    /// receiver back towards `sender`.
    fn on_clear_path(&self, _sender: &ChannelId, _receiver: &ChannelId) {}

    /// Called when this listener has been added to `group_name` under id `target_id`.
    fn on_add_to_group(&self, _group_name: &ChannelId, _target_id: &ChannelId) {}

    /// Called when `group_name` has been closed and this listener removed from it.
    fn on_close_group(&self, _group_name: &ChannelId) {}

    /// Called on the group owner when the last member left.
    fn on_group_empty(&self, _group_name: &ChannelId) {}
}

pub type ListenerHandle = Arc<dyn Listener>;

/// Registered independently of `Listener`; notifies a bridge that the bus's exportable
/// channel set may have changed so it can recompute its diff.
pub trait ChannelMonitor: Send + Sync {
    fn on_channels_update(&self);
}

pub type MonitorHandle = Arc<dyn ChannelMonitor>;

/// Optional per-bridge filter restricting which channel names may cross the bridge in
/// either direction.
pub trait ChannelFilter: Send + Sync {
    /// Allow an externally-originated message addressed to `id` to be routed locally.
    fn incoming(&self, id: &ChannelId) -> bool {
        let _ = id;
        true
    }

    /// Allow `id` to be exported to the peer (or, when `return_path` is set, allow a reply
    /// addressed back along the return path).
    fn outgoing(&self, id: &ChannelId, return_path: bool) -> bool {
        let _ = (id, return_path);
        true
    }
}
