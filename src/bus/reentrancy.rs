// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Thread-local reentrancy discipline.
//!
//! A listener callback may call back into the bus mid-dispatch. Rather than taking a
//! recursive lock, a nested call is diverted into one of two per-thread queues and returns
//! immediately; the outermost call drains them once its own work is done, so "all observable
//! state changes commit before the next broadcast" holds without ever re-entering the
//! registry mutex.
//!
//! Keyed by `key: usize` (a bus's `Arc` address) so two independent `LocalBus` instances
//! driven from the same thread — as tests routinely do — don't share a running flag.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

type Op = Box<dyn FnOnce()>;

#[derive(Default)]
struct FrameState {
    running: bool,
    listener_queue: VecDeque<Op>,
    message_queue: VecDeque<Op>,
}

thread_local! {
    static FRAMES: RefCell<HashMap<usize, FrameState>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// This call is the outermost frame; caller must invoke `leave` when its own direct work
    /// is done.
    Outermost,
    /// A bus operation is already running on this thread for this key; the caller's work has
    /// been diverted to a queue and it must return without doing anything else.
    Nested,
}

/// Marks entry into a (possibly nested) bus operation.
pub fn enter(key: usize) -> Entry {
    FRAMES.with(|f| {
        let mut map = f.borrow_mut();
        let state = map.entry(key).or_default();
        if state.running {
            Entry::Nested
        } else {
            state.running = true;
            Entry::Outermost
        }
    })
}

pub fn is_running(key: usize) -> bool {
    FRAMES.with(|f| f.borrow().get(&key).map(|s| s.running).unwrap_or(false))
}

pub fn queue_listener_op(key: usize, op: Op) {
    FRAMES.with(|f| f.borrow_mut().entry(key).or_default().listener_queue.push_back(op));
}

pub fn queue_message_op(key: usize, op: Op) {
    FRAMES.with(|f| f.borrow_mut().entry(key).or_default().message_queue.push_back(op));
}

/// Drains the listener-change queue fully, then pops and runs one message op (which may
/// enqueue more listener ops, drained before the next message), repeating until both queues
/// are empty, then clears the running flag. Call only from the outermost frame.
pub fn leave(key: usize) {
    loop {
        let listener_op = FRAMES.with(|f| f.borrow_mut().get_mut(&key).and_then(|s| s.listener_queue.pop_front()));
        if let Some(op) = listener_op {
            op();
            continue;
        }

        let message_op = FRAMES.with(|f| f.borrow_mut().get_mut(&key).and_then(|s| s.message_queue.pop_front()));
        match message_op {
            Some(op) => {
                op();
                continue;
            }
            None => break,
        }
    }
    FRAMES.with(|f| {
        if let Some(s) = f.borrow_mut().get_mut(&key) {
            s.running = false;
        }
    });
}

/// Drops the per-thread bookkeeping for `key`; call when a bus is dropped to avoid an
/// unbounded thread-local map on long-lived threads that churn through many buses.
pub fn forget(key: usize) {
    FRAMES.with(|f| {
        f.borrow_mut().remove(&key);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn nested_enter_is_diverted() {
        let key = 1usize;
        assert_eq!(enter(key), Entry::Outermost);
        assert_eq!(enter(key), Entry::Nested);
        leave(key);
        forget(key);
    }

    #[test]
    fn listener_queue_drains_before_message_queue() {
        let key = 2usize;
        let order: Rc<StdRefCell<Vec<&'static str>>> = Rc::new(StdRefCell::new(Vec::new()));

        assert_eq!(enter(key), Entry::Outermost);
        let o = order.clone();
        queue_message_op(key, Box::new(move || o.borrow_mut().push("message")));
        let o = order.clone();
        queue_listener_op(key, Box::new(move || o.borrow_mut().push("listener")));
        leave(key);

        assert_eq!(*order.borrow(), vec!["listener", "message"]);
        forget(key);
    }

    #[test]
    fn message_execution_can_enqueue_more_listener_ops_drained_first() {
        let key = 3usize;
        let order: Rc<StdRefCell<Vec<&'static str>>> = Rc::new(StdRefCell::new(Vec::new()));

        assert_eq!(enter(key), Entry::Outermost);
        let o1 = order.clone();
        queue_message_op(
            key,
            Box::new(move || {
                o1.borrow_mut().push("message-1");
                let o2 = o1.clone();
                queue_listener_op(key, Box::new(move || o2.borrow_mut().push("listener-from-message")));
            }),
        );
        leave(key);

        assert_eq!(*order.borrow(), vec!["message-1", "listener-from-message"]);
        forget(key);
    }

    #[test]
    fn two_keys_do_not_interfere() {
        assert_eq!(enter(10), Entry::Outermost);
        assert_eq!(enter(20), Entry::Outermost);
        assert_eq!(enter(10), Entry::Nested);
        leave(10);
        leave(20);
        forget(10);
        forget(20);
    }
}
