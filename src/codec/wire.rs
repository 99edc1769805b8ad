// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Tagged wire codec for the bridge protocol.
//!
//! The variable-length unsigned integer packs the count of extra big-endian bytes into the
//! high 3 bits of the first byte (0..7 extra bytes), leaving the low 5 bits as the most
//! significant bits of the value; values 0..31 fit in a single byte. Strings are
//! `varuint(len) || bytes`. The encoder is total and reuses a thread-local buffer; the
//! decoder borrows from the caller's frame.

use std::cell::RefCell;

use crate::ids::{ChannelId, ConversationId, SenderId};
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Message = 0xFF,
    ChannelsReplace = 0xFE,
    ChannelsAdd = 0xFD,
    ChannelsErase = 0xFC,
    ChannelsReset = 0xFB,
    NoRoute = 0xFA,
    AddToGroup = 0xF9,
    CloseGroup = 0xF8,
    GroupEmpty = 0xF7,
    NewSession = 0xF6,
    UpdateSerial = 0xF5,
}

/// Whether a `ChannelsReplace`/`ChannelsAdd`/`ChannelsErase` frame should replace the peer's
/// whole known set or be applied incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOp {
    Replace,
    Add,
    Erase,
}

/// A decoded bridge-protocol frame. Borrows string data from the input buffer where
/// possible; owns `Vec`s only for the channel-list variants since those are built
/// incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage<'a> {
    Message { conversation: ConversationId, sender: &'a str, channel: &'a str, content: &'a [u8] },
    Channels { op: ChannelOp, list: Vec<&'a str> },
    ChannelsReset,
    NoRoute { sender: &'a str, receiver: &'a str },
    AddToGroup { group: &'a str, target: &'a str },
    CloseGroup { group: &'a str },
    GroupEmpty { group: &'a str },
    NewSession { version: u64 },
    UpdateSerial { serial: &'a str },
    /// Any other leading byte: opaque pass-through for a frame kind this decoder doesn't
    /// know about.
    UserMsg { kind: u8, payload: &'a [u8] },
}

/// Reads a varuint from the front of `buf`, returning the value and the remaining slice.
/// A truncated varuint (not enough trailing bytes) yields 0 for the missing bytes rather
/// than erroring, tolerating a short read.
pub fn read_varuint(buf: &[u8]) -> (u64, &[u8]) {
    if buf.is_empty() {
        return (0, buf);
    }
    let first = buf[0];
    let mut rest = &buf[1..];
    let extra = (first >> 5) as usize;
    let mut value: u64 = (first & 0x1F) as u64;
    let take = extra.min(rest.len());
    for &b in &rest[..take] {
        value = (value << 8) | b as u64;
    }
    rest = &rest[take..];
    (value, rest)
}

/// Reads a length-prefixed string (UTF-8 assumed invalid bytes are dropped via lossy
/// decode only at call sites that need `&str`; here we keep the raw byte slice and let the
/// caller validate). A truncated string yields whatever bytes remain rather than erroring.
pub fn read_bytes(buf: &[u8]) -> (&[u8], &[u8]) {
    let (len, rest) = read_varuint(buf);
    let len = (len as usize).min(rest.len());
    (&rest[..len], &rest[len..])
}

fn read_str(buf: &[u8]) -> (&str, &[u8]) {
    let (bytes, rest) = read_bytes(buf);
    (std::str::from_utf8(bytes).unwrap_or(""), rest)
}

/// The 3-bit extra-byte count caps this at 7 extra bytes on top of the first, so values above
/// `2^61 - 1` lose the high bits of the length field (`extra` truncates mod 8 when packed into
/// 3 bits). Every call site in this codec only ever writes lengths and counters well under
/// that range.
pub fn write_varuint(out: &mut Vec<u8>, value: u64) {
    let mut extra = 0u32;
    let mut tmp = value;
    while tmp > 0x1F {
        extra += 1;
        tmp >>= 8;
    }
    let first = (tmp as u8) | ((extra as u8) << 5);
    out.push(first);
    for i in (0..extra).rev() {
        out.push(((value >> (i * 8)) & 0xFF) as u8);
    }
}

pub fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_varuint(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_bytes(out, s.as_bytes());
}

/// Decodes a single bridge-protocol frame. Returns `None` for an empty frame.
pub fn decode(frame: &[u8]) -> Option<BridgeMessage<'_>> {
    if frame.is_empty() {
        return None;
    }
    let tag = frame[0];
    let body = &frame[1..];

    Some(match tag {
        t if t == Tag::Message as u8 => {
            let (conversation, rest) = read_varuint(body);
            let (sender, rest) = read_str(rest);
            let (channel, rest) = read_str(rest);
            let (content, _) = read_bytes(rest);
            BridgeMessage::Message { conversation: conversation as u32, sender, channel, content }
        }
        t if t == Tag::ChannelsReplace as u8 || t == Tag::ChannelsAdd as u8 || t == Tag::ChannelsErase as u8 => {
            let op = if t == Tag::ChannelsReplace as u8 {
                ChannelOp::Replace
            } else if t == Tag::ChannelsAdd as u8 {
                ChannelOp::Add
            } else {
                ChannelOp::Erase
            };
            let (count, mut rest) = read_varuint(body);
            let mut list = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (s, r) = read_str(rest);
                list.push(s);
                rest = r;
            }
            BridgeMessage::Channels { op, list }
        }
        t if t == Tag::ChannelsReset as u8 => BridgeMessage::ChannelsReset,
        t if t == Tag::NoRoute as u8 => {
            let (sender, rest) = read_str(body);
            let (receiver, _) = read_str(rest);
            BridgeMessage::NoRoute { sender, receiver }
        }
        t if t == Tag::AddToGroup as u8 => {
            let (group, rest) = read_str(body);
            let (target, _) = read_str(rest);
            BridgeMessage::AddToGroup { group, target }
        }
        t if t == Tag::CloseGroup as u8 => {
            let (group, _) = read_str(body);
            BridgeMessage::CloseGroup { group }
        }
        t if t == Tag::GroupEmpty as u8 => {
            let (group, _) = read_str(body);
            BridgeMessage::GroupEmpty { group }
        }
        t if t == Tag::NewSession as u8 => {
            let (version, _) = read_varuint(body);
            BridgeMessage::NewSession { version }
        }
        t if t == Tag::UpdateSerial as u8 => {
            let (serial, _) = read_str(body);
            BridgeMessage::UpdateSerial { serial }
        }
        other => BridgeMessage::UserMsg { kind: other, payload: body },
    })
}

thread_local! {
    static ENCODE_BUF: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` with exclusive access to the thread-local encode buffer, returning a freshly
/// allocated `Vec<u8>` with the buffer's contents, so callers are free to hold on to the
/// result past the next `with_encode_buffer` call.
fn with_encode_buffer(f: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    ENCODE_BUF.with(|cell| {
        let mut buf = cell.borrow_mut();
        buf.clear();
        f(&mut buf);
        buf.clone()
    })
}

pub fn encode_message(msg: &Message) -> Vec<u8> {
    with_encode_buffer(|out| {
        out.push(Tag::Message as u8);
        write_varuint(out, msg.conversation() as u64);
        write_str(out, msg.sender().as_str());
        write_str(out, msg.channel().as_str());
        write_bytes(out, msg.content());
    })
}

pub fn encode_channels(op: ChannelOp, list: &[ChannelId]) -> Vec<u8> {
    with_encode_buffer(|out| {
        let tag = match op {
            ChannelOp::Replace => Tag::ChannelsReplace,
            ChannelOp::Add => Tag::ChannelsAdd,
            ChannelOp::Erase => Tag::ChannelsErase,
        };
        out.push(tag as u8);
        write_varuint(out, list.len() as u64);
        for c in list {
            write_str(out, c.as_str());
        }
    })
}

pub fn encode_channels_reset() -> Vec<u8> {
    with_encode_buffer(|out| out.push(Tag::ChannelsReset as u8))
}

pub fn encode_no_route(sender: &SenderId, receiver: &ChannelId) -> Vec<u8> {
    with_encode_buffer(|out| {
        out.push(Tag::NoRoute as u8);
        write_str(out, sender.as_str());
        write_str(out, receiver.as_str());
    })
}

pub fn encode_add_to_group(group: &ChannelId, target: &ChannelId) -> Vec<u8> {
    with_encode_buffer(|out| {
        out.push(Tag::AddToGroup as u8);
        write_str(out, group.as_str());
        write_str(out, target.as_str());
    })
}

pub fn encode_close_group(group: &ChannelId) -> Vec<u8> {
    with_encode_buffer(|out| {
        out.push(Tag::CloseGroup as u8);
        write_str(out, group.as_str());
    })
}

pub fn encode_group_empty(group: &ChannelId) -> Vec<u8> {
    with_encode_buffer(|out| {
        out.push(Tag::GroupEmpty as u8);
        write_str(out, group.as_str());
    })
}

pub fn encode_new_session(version: u64) -> Vec<u8> {
    with_encode_buffer(|out| {
        out.push(Tag::NewSession as u8);
        write_varuint(out, version);
    })
}

pub fn encode_update_serial(serial: &str) -> Vec<u8> {
    with_encode_buffer(|out| {
        out.push(Tag::UpdateSerial as u8);
        write_str(out, serial);
    })
}

pub fn encode_user_msg(kind: u8, payload: &[u8]) -> Vec<u8> {
    with_encode_buffer(|out| {
        out.push(kind);
        out.extend_from_slice(payload);
    })
}
