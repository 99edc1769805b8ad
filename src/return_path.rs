// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Bounded LRU mapping `sender id -> listener`, used for ad-hoc reply routing when no public
//! channel exists between the two ends. Implemented as a hash index plus an intrusive
//! doubly-linked list over a slab, avoiding pointer chasing while keeping O(1) touch/evict.

use std::collections::HashMap;

use crate::ids::SenderId;
use crate::listener::ListenerHandle;

const DEFAULT_LIMIT: usize = 128;

struct Entry {
    sender: SenderId,
    listener: ListenerHandle,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct ReturnPathCache {
    limit: usize,
    index: HashMap<SenderId, usize>,
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    head: Option<usize>, // most recently used
    tail: Option<usize>, // least recently used
}

impl ReturnPathCache {
    pub fn new(limit: usize) -> Self {
        ReturnPathCache {
            limit,
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.slots[idx].as_ref().unwrap();
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let e = self.slots[idx].as_mut().unwrap();
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn evict_tail(&mut self) {
        if let Some(idx) = self.tail {
            self.detach(idx);
            let e = self.slots[idx].take().unwrap();
            self.index.remove(&e.sender);
            self.free.push(idx);
        }
    }

    /// Records (or refreshes) `sender -> listener`, promoting to most-recently-used,
    /// evicting the tail if the cache would exceed `limit`.
    pub fn store(&mut self, sender: SenderId, listener: ListenerHandle) {
        if let Some(&idx) = self.index.get(&sender) {
            self.slots[idx].as_mut().unwrap().listener = listener;
            self.promote(idx);
            return;
        }

        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(Entry { sender: sender.clone(), listener, prev: None, next: None });
                i
            }
            None => {
                self.slots.push(Some(Entry { sender: sender.clone(), listener, prev: None, next: None }));
                self.slots.len() - 1
            }
        };
        self.index.insert(sender, idx);
        self.push_front(idx);

        while self.index.len() > self.limit {
            self.evict_tail();
        }
    }

    /// Erases the entry for `sender`, if any.
    pub fn remove(&mut self, sender: &SenderId) {
        if let Some(idx) = self.index.remove(sender) {
            self.detach(idx);
            self.slots[idx] = None;
            self.free.push(idx);
        }
    }

    pub fn find(&self, sender: &SenderId) -> Option<ListenerHandle> {
        self.index.get(sender).and_then(|&idx| self.slots[idx].as_ref()).map(|e| e.listener.clone())
    }

    /// Removes every entry routed through `listener`, called on `unsubscribe_all`.
    pub fn remove_listener(&mut self, listener: &ListenerHandle) {
        let dead: Vec<SenderId> = self
            .slots
            .iter()
            .filter_map(|s| s.as_ref())
            .filter(|e| std::sync::Arc::ptr_eq(&e.listener, listener))
            .map(|e| e.sender.clone())
            .collect();
        for s in dead {
            self.remove(&s);
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Default for ReturnPathCache {
    fn default() -> Self {
        ReturnPathCache::new(DEFAULT_LIMIT)
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
    fn store_and_find_roundtrips() {
        let mut cache = ReturnPathCache::new(4);
        let l = listener();
        cache.store(SenderId::from("a"), l.clone());
        assert!(cache.find(&SenderId::from("a")).is_some());
        assert!(cache.find(&SenderId::from("b")).is_none());
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let mut cache = ReturnPathCache::new(2);
        let l = listener();
        cache.store(SenderId::from("a"), l.clone());
        cache.store(SenderId::from("b"), l.clone());
        cache.store(SenderId::from("c"), l.clone());

        assert_eq!(cache.len(), 2);
        assert!(cache.find(&SenderId::from("a")).is_none());
        assert!(cache.find(&SenderId::from("b")).is_some());
        assert!(cache.find(&SenderId::from("c")).is_some());
    }

    #[test]
    fn touching_promotes_to_head() {
        let mut cache = ReturnPathCache::new(2);
        let l = listener();
        cache.store(SenderId::from("a"), l.clone());
        cache.store(SenderId::from("b"), l.clone());
        // touch "a" so "b" becomes the LRU victim
        cache.store(SenderId::from("a"), l.clone());
        cache.store(SenderId::from("c"), l.clone());

        assert!(cache.find(&SenderId::from("a")).is_some());
        assert!(cache.find(&SenderId::from("b")).is_none());
        assert!(cache.find(&SenderId::from("c")).is_some());
    }

    #[test]
    fn remove_listener_purges_all_its_entries() {
        let mut cache = ReturnPathCache::new(8);
        let l1 = listener();
        let l2 = listener();
        cache.store(SenderId::from("a"), l1.clone());
        cache.store(SenderId::from("b"), l2.clone());
        cache.store(SenderId::from("c"), l1.clone());

        cache.remove_listener(&l1);

        assert!(cache.find(&SenderId::from("a")).is_none());
        assert!(cache.find(&SenderId::from("c")).is_none());
        assert!(cache.find(&SenderId::from("b")).is_some());
    }
}
