// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! An in-process message bus that can be federated across processes and machines.
//!
//! A [`bus::LocalBus`] is the thing application code actually talks to: channels, private
//! mailboxes, groups, all dispatched synchronously and reentrantly from any thread. A
//! [`bridge`] attaches to a `LocalBus` as an ordinary listener and carries its channel
//! subscriptions and messages across some transport to a peer bus elsewhere, so two or more
//! processes can look like one bus from the application's point of view. `bridge::direct`
//! joins two buses with no transport at all (useful for tests), `bridge::pipe` carries the
//! bridge protocol over any byte stream, and `bridge::tcp` carries it over a WebSocket-framed
//! TCP connection with reconnect and session resumption.
//!
//! The wire formats live in [`codec`]: a small tagged varuint encoding for bridge messages
//! ([`codec::wire`]) and an RFC 6455 implementation for the TCP transport ([`codec::ws`]).
//! [`net`] and [`http`] are the reactor and HTTP-upgrade collaborators an embedder can plug
//! into its own event loop rather than using `bridge::tcp`'s standalone thread-per-connection
//! implementation directly.

pub mod bridge;
pub mod bus;
pub mod codec;
pub mod error;
pub mod http;
pub mod ids;
pub mod listener;
pub mod mailbox;
pub mod message;
pub mod net;
pub mod return_path;

pub use bus::LocalBus;
pub use error::{BusError, BusResult};
pub use ids::{ChannelId, ConversationId, MailboxId, SenderId, SerialId};
pub use listener::{ChannelFilter, ChannelMonitor, Listener, ListenerHandle};
pub use message::Message;
