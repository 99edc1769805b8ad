// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A named multicast destination. With an `owner` it is a closed group: only the owner may
//! add members or close it, and it is never exported by a bridge.

use std::sync::RwLock;

use crate::ids::ChannelId;
use crate::listener::ListenerHandle;

pub struct Channel {
    name: ChannelId,
    owner: Option<ListenerHandle>,
    listeners: RwLock<Vec<ListenerHandle>>,
}

impl Channel {
    pub fn new(name: ChannelId, owner: Option<ListenerHandle>) -> Self {
        Channel { name, owner, listeners: RwLock::new(Vec::new()) }
    }

    pub fn name(&self) -> &ChannelId {
        &self.name
    }

    pub fn owner(&self) -> Option<&ListenerHandle> {
        self.owner.as_ref()
    }

    pub fn is_group(&self) -> bool {
        self.owner.is_some()
    }

    /// True if `listener` wasn't already subscribed.
    pub fn add(&self, listener: ListenerHandle) -> bool {
        let mut guard = self.listeners.write().expect("channel lock poisoned");
        if guard.iter().any(|l| std::sync::Arc::ptr_eq(l, &listener)) {
            return false;
        }
        guard.push(listener);
        true
    }

    /// True if `listener` was present and removed.
    pub fn remove(&self, listener: &ListenerHandle) -> bool {
        let mut guard = self.listeners.write().expect("channel lock poisoned");
        let before = guard.len();
        guard.retain(|l| !std::sync::Arc::ptr_eq(l, listener));
        guard.len() != before
    }

    pub fn contains(&self, listener: &ListenerHandle) -> bool {
        self.listeners.read().expect("channel lock poisoned").iter().any(|l| std::sync::Arc::ptr_eq(l, listener))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().expect("channel lock poisoned").len()
    }

    pub fn snapshot(&self) -> Vec<ListenerHandle> {
        self.listeners.read().expect("channel lock poisoned").clone()
    }

    /// A channel with no owner and no listeners is dead weight and must be dropped by the
    /// registry that owns it.
    pub fn is_empty_and_ownerless(&self) -> bool {
        self.owner.is_none() && self.listener_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    struct Noop;
    impl crate::listener::Listener for Noop {
        fn on_message(&self, _m: &Message, _pm: bool) {}
    }

    fn listener() -> ListenerHandle {
        std::sync::Arc::new(Noop)
    }

    #[test]
    fn add_is_idempotent() {
        let ch = Channel::new(ChannelId::from("reverse"), None);
        let l = listener();
        assert!(ch.add(l.clone()));
        assert!(!ch.add(l.clone()));
        assert_eq!(ch.listener_count(), 1);
    }

    #[test]
    fn empty_ownerless_channel_is_reclaimable() {
        let ch = Channel::new(ChannelId::from("reverse"), None);
        assert!(ch.is_empty_and_ownerless());
        let l = listener();
        ch.add(l.clone());
        assert!(!ch.is_empty_and_ownerless());
        ch.remove(&l);
        assert!(ch.is_empty_and_ownerless());
    }

    #[test]
    fn group_with_owner_is_never_ownerless() {
        let owner = listener();
        let ch = Channel::new(ChannelId::from("g"), Some(owner));
        assert!(ch.is_group());
        assert!(!ch.is_empty_and_ownerless());
    }
}
