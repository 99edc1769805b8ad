// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! RFC 6455 WebSocket framing: a byte-at-a-time `Parser` state machine and a stateful
//! `Builder`, plus the handshake key derivation.

use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use sha1::{Digest, Sha1};

const WS_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OPCODE_CONT: u8 = 0;
const OPCODE_TEXT: u8 = 1;
const OPCODE_BINARY: u8 = 2;
const OPCODE_CLOSE: u8 = 8;
const OPCODE_PING: u8 = 9;
const OPCODE_PONG: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Unknown,
    Text,
    Binary,
    ConnClose,
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsMessage {
    pub payload: Vec<u8>,
    pub frame_type: FrameType,
    pub code: u16,
    pub fin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FirstByte,
    SecondByte,
    PayloadLen,
    Masking,
    Payload,
    Complete,
}

/// Incremental frame parser. Owns no payload storage of its own beyond the caller-supplied
/// accumulation buffer; `get_unused_data` exposes bytes beyond the frame boundary so the
/// caller can feed them into the next parse after `reset`.
pub struct Parser {
    state: State,
    state_len: usize,
    payload_len: u64,
    mask_cntr: usize,
    cur_message: Vec<u8>,
    need_fragmented: bool,
    fin: bool,
    masked: bool,
    opcode: u8,
    masking: [u8; 4],
    final_type: FrameType,
    unused_len: usize,
}

impl Parser {
    pub fn new(need_fragmented: bool) -> Self {
        Parser {
            state: State::FirstByte,
            state_len: 0,
            payload_len: 0,
            mask_cntr: 0,
            cur_message: Vec::new(),
            need_fragmented,
            fin: false,
            masked: false,
            opcode: 0,
            masking: [0; 4],
            final_type: FrameType::Unknown,
            unused_len: 0,
        }
    }

    /// Feeds `data` to the parser. Returns `true` once a full message is available (call
    /// `get_message`); `false` means more data is needed.
    pub fn push_data(&mut self, data: &[u8]) -> bool {
        let mut i = 0;
        let mut done = false;
        while i < data.len() && !done {
            let c = data[i];
            match self.state {
                State::FirstByte => {
                    self.fin = (c & 0x80) != 0;
                    self.opcode = c & 0x0F;
                    self.state = State::SecondByte;
                }
                State::SecondByte => {
                    self.masked = (c & 0x80) != 0;
                    let len7 = c & 0x7F;
                    if len7 == 127 {
                        self.state = State::PayloadLen;
                        self.state_len = 8;
                        self.payload_len = 0;
                    } else if len7 == 126 {
                        self.state = State::PayloadLen;
                        self.state_len = 2;
                        self.payload_len = 0;
                    } else if self.masked {
                        self.payload_len = len7 as u64;
                        self.state = State::Masking;
                        self.state_len = 4;
                    } else if len7 != 0 {
                        self.payload_len = len7 as u64;
                        self.state_len = len7 as usize;
                        self.state = State::Payload;
                    } else {
                        done = true;
                    }
                }
                State::PayloadLen => {
                    self.payload_len = (self.payload_len << 8) | c as u64;
                    self.state_len -= 1;
                    if self.state_len == 0 {
                        if self.masked {
                            self.state = State::Masking;
                            self.state_len = 4;
                        } else if self.payload_len != 0 {
                            self.state_len = self.payload_len as usize;
                            self.state = State::Payload;
                        } else {
                            done = true;
                        }
                    }
                }
                State::Masking => {
                    self.masking[4 - self.state_len] = c;
                    self.state_len -= 1;
                    if self.state_len == 0 {
                        if self.payload_len != 0 {
                            self.state_len = self.payload_len as usize;
                            self.state = State::Payload;
                            self.mask_cntr = 0;
                        } else {
                            done = true;
                        }
                    }
                }
                State::Payload => {
                    let unmasked = if self.masked { c ^ self.masking[self.mask_cntr] } else { c };
                    self.cur_message.push(unmasked);
                    self.mask_cntr = (self.mask_cntr + 1) & 0x3;
                    self.state_len -= 1;
                    if self.state_len == 0 {
                        done = true;
                    }
                }
                State::Complete => {
                    self.unused_len = data.len() - i;
                    return true;
                }
            }
            i += 1;
        }
        if done {
            self.unused_len = data.len() - i;
            self.finalize(&data[i..]);
            true
        } else {
            false
        }
    }

    fn finalize(&mut self, unused: &[u8]) {
        self.state = State::Complete;
        self.final_type = match self.opcode {
            OPCODE_CONT => self.final_type, // continuation: type carried from the fragment start
            OPCODE_CLOSE => FrameType::ConnClose,
            OPCODE_BINARY => FrameType::Binary,
            OPCODE_TEXT => FrameType::Text,
            OPCODE_PING => FrameType::Ping,
            OPCODE_PONG => FrameType::Pong,
            _ => FrameType::Unknown,
        };

        if !self.fin && self.need_fragmented {
            // emit the partial frame as-is; caller must reset and keep accumulating
            return;
        }
        if !self.fin && !self.need_fragmented {
            // merge continuation frames into one logical message: re-enter the state
            // machine on the unused tail, keeping the accumulated payload.
            let unused = unused.to_vec();
            self.reset_state();
            self.push_data(&unused);
        }
    }

    fn reset_state(&mut self) {
        self.state = State::FirstByte;
        self.masking = [0; 4];
        self.fin = false;
        self.masked = false;
        self.payload_len = 0;
        self.state_len = 0;
        self.unused_len = 0;
    }

    /// Discards the current message and any parser state, ready for the next frame.
    pub fn reset(&mut self) {
        self.reset_state();
        self.cur_message.clear();
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Only meaningful once `is_complete()` is true.
    pub fn get_message(&self) -> WsMessage {
        if self.final_type == FrameType::ConnClose {
            let mut code = 0u16;
            let mut message = Vec::new();
            if self.cur_message.len() >= 2 {
                code = BigEndian::read_u16(&self.cur_message[0..2]);
            }
            if self.cur_message.len() > 2 {
                message = self.cur_message[2..].to_vec();
            }
            WsMessage { payload: message, frame_type: self.final_type, code, fin: self.fin }
        } else {
            WsMessage { payload: self.cur_message.clone(), frame_type: self.final_type, code: 0, fin: self.fin }
        }
    }

    pub fn get_unused_data<'a>(&self, last_pushed: &'a [u8]) -> &'a [u8] {
        if self.is_complete() {
            &last_pushed[last_pushed.len() - self.unused_len..]
        } else {
            &[]
        }
    }

    /// `reset()` followed by re-parsing the unused tail of the previous `push_data` call.
    pub fn reset_parse_next(&mut self, last_pushed: &[u8]) -> bool {
        let tail = self.get_unused_data(last_pushed).to_vec();
        self.reset();
        self.push_data(&tail)
    }
}

/// Stateful frame builder; tracks fragmentation so continuation frames use opcode 0 until
/// `fin`. Client role masks with a random key; server role sends unmasked.
pub struct Builder {
    client: bool,
    fragmented: bool,
}

impl Builder {
    pub fn new(client: bool) -> Self {
        Builder { client, fragmented: false }
    }

    pub fn build(&mut self, msg: &WsMessage, output: &mut Vec<u8>) -> bool {
        let mut tmp;
        let payload: &[u8] = if msg.frame_type == FrameType::ConnClose {
            tmp = Vec::with_capacity(2 + msg.payload.len());
            tmp.push((msg.code >> 8) as u8);
            tmp.push((msg.code & 0xFF) as u8);
            tmp.extend_from_slice(&msg.payload);
            &tmp
        } else {
            &msg.payload
        };

        let opcode = if self.fragmented {
            OPCODE_CONT
        } else {
            match msg.frame_type {
                FrameType::Unknown => return false,
                FrameType::Text => OPCODE_TEXT,
                FrameType::Binary => OPCODE_BINARY,
                FrameType::Ping => OPCODE_PING,
                FrameType::Pong => OPCODE_PONG,
                FrameType::ConnClose => OPCODE_CLOSE,
            }
        };
        self.fragmented = !msg.fin;

        output.push(((msg.fin as u8) << 7) | opcode);

        let len = payload.len() as u64;
        let mask_bit = if self.client { 0x80 } else { 0 };
        if len < 126 {
            output.push(mask_bit | len as u8);
        } else if len < 65536 {
            output.push(mask_bit | 126);
            output.push((len >> 8) as u8);
            output.push((len & 0xFF) as u8);
        } else {
            output.push(mask_bit | 127);
            for i in (0..8).rev() {
                output.push(((len >> (i * 8)) & 0xFF) as u8);
            }
        }

        let masking_key = if self.client {
            let mut rng = rand::thread_rng();
            let key: [u8; 4] = rng.gen();
            output.extend_from_slice(&key);
            key
        } else {
            [0u8; 4]
        };

        for (idx, &b) in payload.iter().enumerate() {
            output.push(b ^ masking_key[idx & 0x3]);
        }
        true
    }
}

/// `accept = base64(SHA1(key || magic))` (RFC 6455 §1.3).
pub fn calculate_ws_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// 16 random bytes, base64-encoded, per RFC 6455's `Sec-WebSocket-Key` generation.
pub fn generate_ws_key() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
