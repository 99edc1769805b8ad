// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Black-box coverage of the bus's headline behaviors, driven entirely through the public
//! crate API. Cross-process transports (pipe, TCP) get their own scenario tests alongside the
//! code that implements them, since standing one up needs helpers private to those modules.

use std::sync::{Arc, Mutex};

use zerobus::{ChannelId, Listener, ListenerHandle, Message};

struct Recorder {
    received: Mutex<Vec<(String, bool)>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Recorder { received: Mutex::new(Vec::new()) })
    }
}

impl Listener for Recorder {
    fn on_message(&self, message: &Message, pm: bool) {
        self.received.lock().unwrap().push((message.content_str().into_owned(), pm));
    }
}

struct Reverser {
    bus: zerobus::LocalBus,
}

impl Listener for Reverser {
    fn on_message(&self, message: &Message, _pm: bool) {
        let reversed: String = message.content_str().chars().rev().collect();
        self.bus.send_message(None, message.sender().as_str(), reversed.into_bytes(), message.conversation());
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn local_echo_reverses_and_replies_privately() {
    init_logging();

    let bus = zerobus::LocalBus::new();
    let reverser: ListenerHandle = Arc::new(Reverser { bus: bus.clone() });
    bus.subscribe(reverser, ChannelId::from("reverse"));

    let client = Recorder::new();
    let client_handle: ListenerHandle = client.clone();
    assert!(bus.send_message(Some(client_handle), "reverse", b"ahoj svete".to_vec(), 1));

    assert_eq!(client.received.lock().unwrap().as_slice(), [("etevs joha".to_string(), true)]);
}

#[test]
fn group_lifecycle_adds_notifies_and_closes() {
    init_logging();

    let bus = zerobus::LocalBus::new();

    struct Owner {
        empties: Mutex<Vec<String>>,
    }
    impl Listener for Owner {
        fn on_message(&self, _m: &Message, _pm: bool) {}
        fn on_group_empty(&self, group: &ChannelId) {
            self.empties.lock().unwrap().push(group.to_string());
        }
    }

    struct Member {
        added: Mutex<Vec<String>>,
        closed: Mutex<Vec<String>>,
        received: Mutex<Vec<(String, bool)>>,
    }
    impl Listener for Member {
        fn on_message(&self, message: &Message, pm: bool) {
            self.received.lock().unwrap().push((message.content_str().into_owned(), pm));
        }
        fn on_add_to_group(&self, group: &ChannelId, _target: &ChannelId) {
            self.added.lock().unwrap().push(group.to_string());
        }
        fn on_close_group(&self, group: &ChannelId) {
            self.closed.lock().unwrap().push(group.to_string());
        }
    }

    let owner: Arc<Owner> = Arc::new(Owner { empties: Mutex::new(Vec::new()) });
    let member: Arc<Member> =
        Arc::new(Member { added: Mutex::new(Vec::new()), closed: Mutex::new(Vec::new()), received: Mutex::new(Vec::new()) });
    let owner_handle: ListenerHandle = owner.clone();
    let member_handle: ListenerHandle = member.clone();
    let group = ChannelId::from("team");

    struct IdCapture {
        id: Mutex<Option<String>>,
    }
    impl Listener for IdCapture {
        fn on_message(&self, message: &Message, _pm: bool) {
            *self.id.lock().unwrap() = Some(message.sender().to_string());
        }
    }
    let capture = Arc::new(IdCapture { id: Mutex::new(None) });
    bus.subscribe(capture.clone() as ListenerHandle, ChannelId::from("scratch"));
    bus.send_message(Some(member_handle.clone()), "scratch", b"hello".to_vec(), 0);
    let member_mailbox_id = capture.id.lock().unwrap().clone().expect("mailbox id observed");

    assert!(bus.add_to_group(owner_handle.clone(), group.clone(), &member_mailbox_id).expect("add to group"));
    assert_eq!(member.added.lock().unwrap().as_slice(), [group.to_string()]);

    assert!(bus.send_message(None, "team", b"standup".to_vec(), 0));
    assert_eq!(member.received.lock().unwrap().last(), Some(&("standup".to_string(), false)));

    bus.close_group(owner_handle, group.clone()).expect("close group");
    assert_eq!(member.closed.lock().unwrap().as_slice(), [group.to_string()]);
    assert_eq!(owner.empties.lock().unwrap().as_slice(), [group.to_string()]);
}

#[test]
fn websocket_client_frame_round_trips_through_server_parser() {
    init_logging();

    use zerobus::codec::ws::{Builder, FrameType, Parser, WsMessage};

    let payload: Vec<u8> = (0u8..125).collect();
    let msg = WsMessage { payload: payload.clone(), frame_type: FrameType::Binary, code: 0, fin: true };

    let mut builder = Builder::new(true);
    let mut frame = Vec::new();
    assert!(builder.build(&msg, &mut frame));

    let mut parser = Parser::new(false);
    assert!(parser.push_data(&frame));
    let parsed = parser.get_message();
    assert_eq!(parsed.frame_type, FrameType::Binary);
    assert!(parsed.fin);
    assert_eq!(parsed.payload, payload);
}
