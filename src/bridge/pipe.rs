// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A bridge over any bidirectional byte stream: each frame is `varuint(len) || bytes(len)`.
//! A background thread drains the read half and feeds complete frames to the `BridgeCore`;
//! the write half is behind a mutex since application threads call the bus (and therefore
//! `FrameSink::send_frame`) from anywhere.

use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::bridge::core::{BridgeCore, FrameSink};
use crate::bus::LocalBus;
use crate::codec::wire;

struct Writer<W: Write + Send + 'static>(Mutex<W>);

impl<W: Write + Send + 'static> FrameSink for Writer<W> {
    fn send_frame(&self, frame: Vec<u8>) {
        let mut out = Vec::with_capacity(frame.len() + 5);
        wire::write_bytes(&mut out, &frame);
        let mut w = self.0.lock().expect("pipe bridge writer lock poisoned");
        if let Err(e) = w.write_all(&out).and_then(|_| w.flush()) {
            log::warn!("[pipe bridge] write failed: {e}");
        }
    }
}

/// Extracts the first complete `varuint(len) || bytes` frame at the front of `buf`, returning
/// the consumed byte count and the frame payload. `None` means more data is needed.
fn try_extract_frame(buf: &[u8]) -> Option<(usize, &[u8])> {
    if buf.is_empty() {
        return None;
    }
    let header_len = 1 + (buf[0] >> 5) as usize;
    if buf.len() < header_len {
        return None;
    }
    let (len, _) = wire::read_varuint(&buf[..header_len]);
    let total = header_len + len as usize;
    if buf.len() < total {
        return None;
    }
    Some((total, &buf[header_len..total]))
}

fn pump_reader<R: Read>(mut reader: R, core: Arc<BridgeCore>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => {
                log::debug!("[pipe bridge] read EOF, disconnecting");
                core.on_disconnected(false);
                return;
            }
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                loop {
                    match try_extract_frame(&buf) {
                        Some((consumed, _)) => {
                            let frame = buf[..consumed].to_vec();
                            let (_, payload) = try_extract_frame(&frame).expect("just validated");
                            core.handle_frame(payload);
                            buf.drain(..consumed);
                        }
                        None => break,
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("[pipe bridge] read failed: {e}");
                core.on_disconnected(false);
                return;
            }
        }
    }
}

/// A running bridge over a byte stream. The reader thread is detached rather than joined on
/// drop: waiting for it would deadlock when two bridges share a socketpair and are torn down
/// in the same scope, since each side's EOF depends on the other side's write half closing
/// first. Dropping just detaches the core from its bus; the reader thread exits on its own
/// once the stream actually closes.
pub struct PipeBridge {
    core: Arc<BridgeCore>,
    child: Mutex<Option<Child>>,
}

impl PipeBridge {
    /// `reader`/`writer` are typically the two halves of the same duplex stream (a Unix
    /// socketpair, a named pipe, or a spawned child's stdio).
    pub fn new<R, W>(bus: LocalBus, reader: R, writer: W) -> Arc<PipeBridge>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let sink: Arc<dyn FrameSink> = Arc::new(Writer(Mutex::new(writer)));
        let core = BridgeCore::new(bus, sink, None);
        core.attach();
        core.on_connected();
        core.on_session_established();

        let reader_core = core.clone();
        thread::spawn(move || pump_reader(reader, reader_core));

        Arc::new(PipeBridge { core, child: Mutex::new(None) })
    }

    pub fn core(&self) -> &Arc<BridgeCore> {
        &self.core
    }

    /// Spawns `cmdline` with its stdin/stdout wired to a bridge over the current bus, and a
    /// monitor thread that calls `exit_cb` once the child terminates.
    pub fn connect_process(
        bus: LocalBus,
        cmdline: &str,
        exit_cb: impl FnOnce(io::Result<std::process::ExitStatus>) + Send + 'static,
    ) -> io::Result<Arc<PipeBridge>> {
        let mut parts = cmdline.split_whitespace();
        let program = parts.next().ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let bridge = PipeBridge::new(bus, stdout, stdin);
        bridge.core.set_session_id(Some(cmdline.to_string()));

        thread::spawn(move || {
            let status = child.wait();
            exit_cb(status);
        });

        Ok(bridge)
    }
}

impl Drop for PipeBridge {
    fn drop(&mut self) {
        self.core.detach();
        if let Some(mut child) = self.child.lock().expect("pipe bridge lock poisoned").take() {
            let _ = child.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ChannelId;
    use crate::listener::Listener;
    use crate::message::Message;
    use std::sync::Mutex as StdMutex;
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
            thread::sleep(Duration::from_millis(5));
        }
        bus.is_channel(&ChannelId::from(name))
    }

    #[test]
    fn frame_extraction_waits_for_full_payload() {
        let mut frame = Vec::new();
        wire::write_bytes(&mut frame, b"hello");
        assert!(try_extract_frame(&frame[..2]).is_none());
        let (consumed, payload) = try_extract_frame(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(payload, b"hello");
    }

    #[cfg(unix)]
    #[test]
    fn two_buses_bridged_over_a_unix_socket_pair_relay_a_reply() {
        use std::os::unix::net::UnixStream;

        let (m_sock, s_sock) = UnixStream::pair().expect("create socket pair");
        let m_write = m_sock.try_clone().expect("clone socket");
        let s_write = s_sock.try_clone().expect("clone socket");

        let m = LocalBus::new();
        let s = LocalBus::new();
        let _bridge_m = PipeBridge::new(m.clone(), m_sock, m_write);
        let _bridge_s = PipeBridge::new(s.clone(), s_sock, s_write);

        let reverser: Arc<dyn Listener> = Arc::new(Reverser { bus: m.clone() });
        m.subscribe(reverser, ChannelId::from("reverse"));

        assert!(wait_for_channel(&s, "reverse", Duration::from_secs(2)));

        let client = Recorder::new();
        let client_handle: Arc<dyn Listener> = client.clone();
        s.send_message(Some(client_handle), "reverse", b"ahoj svete".to_vec(), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while client.received.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(client.received.lock().unwrap().as_slice(), ["etevs joha".to_string()]);
    }
}
