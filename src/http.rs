// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The optional `HttpHandler` collaborator: when a `TcpBridgeServer` receives a request
//! outside its mount path, ownership of the connection transfers to whichever implementation
//! is configured here instead of the bridge replying `400`.

use std::collections::HashMap;
use std::net::TcpStream;

/// The parsed request line and headers handed to a handler, ahead of any body bytes already
/// read off the wire while probing for the WebSocket upgrade.
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Parses a `GET /path HTTP/1.1\r\nHeader: value\r\n...\r\n\r\n` head. `raw` must contain at
/// least the full head; anything past the blank line is returned as leftover body bytes.
pub fn parse_request_head(raw: &[u8]) -> Option<(RequestHead, &[u8])> {
    let head_end = find_double_crlf(raw)?;
    let head_text = std::str::from_utf8(&raw[..head_end]).ok()?;
    let mut lines = head_text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let body_start = head_end + 4;
    Some((RequestHead { method, path, version, headers }, &raw[body_start..]))
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Hook for requests outside the bridge's own mount path. `on_request` takes ownership of
/// `stream`: the bridge does not read from or write to it again afterward.
pub trait HttpHandler: Send + Sync {
    fn on_request(&self, stream: TcpStream, head: RequestHead, initial_body: &[u8]);
}

/// An `HttpHandler` that serves a fixed response body for any request, e.g. a health check or
/// a static landing page parked next to the bridge's mount.
pub struct StaticResponder {
    pub status_line: &'static str,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl StaticResponder {
    pub fn render(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status_line,
            self.content_type,
            self.body.len(),
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

impl HttpHandler for StaticResponder {
    fn on_request(&self, mut stream: TcpStream, _head: RequestHead, _initial_body: &[u8]) {
        use std::io::Write;
        let _ = stream.write_all(&self.render());
    }
}
