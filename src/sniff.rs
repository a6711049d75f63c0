// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! HTTP framing sniffer for intercepted tunnels.
//!
//! The sniffer observes the plaintext client-to-server byte stream of a
//! TLS-intercepted tunnel. It never gates forwarding: bytes reach the
//! upstream whether or not they parse, and the sniffer reassembles request
//! frames out of whatever has accumulated so far.

use crate::record::{
    body_preview, method_carries_preview, response_preview, HeaderMultiMap, RequestRecord,
};

/// Byte offset of the first `\r\n\r\n` in `buf`, if present.
pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// One parsed message head: the start line plus its header fields.
pub struct MessageHead {
    pub start_line: String,
    pub headers: HeaderMultiMap,
}

impl MessageHead {
    /// `Content-Length` of the message, defaulting to zero. Chunked transfer
    /// is out of scope; a request without a length is treated as body-less.
    pub fn content_length(&self) -> usize {
        self.headers
            .first("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Parse a header block (everything before the `\r\n\r\n` terminator).
pub fn parse_message_head(block: &[u8]) -> MessageHead {
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split("\r\n");
    let start_line = lines.next().unwrap_or("").trim().to_string();

    let mut headers = HeaderMultiMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.append(name, value.trim());
        }
    }

    MessageHead { start_line, headers }
}

/// Reassembles request frames from the client-to-server direction of one
/// tunnel and turns each complete request into a [`RequestRecord`].
///
/// State per request: scanning for the header terminator, then waiting for
/// `Content-Length` body bytes, then emit and continue with the remainder
/// (keep-alive and pipelining preserved).
pub struct RequestSniffer {
    host: String,
    watched: bool,
    verbose: bool,
    buf: Vec<u8>,
}

impl RequestSniffer {
    pub fn new(host: &str, watched: bool, verbose: bool) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            watched,
            verbose,
            buf: Vec::new(),
        }
    }

    /// Feed bytes that just flowed toward the upstream. Returns a record for
    /// every request whose head and body are now complete, in wire order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RequestRecord> {
        self.buf.extend_from_slice(chunk);

        let mut records = Vec::new();
        loop {
            let Some(terminator) = find_header_end(&self.buf) else {
                break;
            };
            let head = parse_message_head(&self.buf[..terminator]);
            let content_length = head.content_length();
            let body_start = terminator + 4;
            if self.buf.len() < body_start + content_length {
                // Body still in flight; wait for more bytes.
                break;
            }

            let body = &self.buf[body_start..body_start + content_length];
            records.push(self.record_for(&head, body));
            self.buf.drain(..body_start + content_length);
        }
        records
    }

    fn record_for(&self, head: &MessageHead, body: &[u8]) -> RequestRecord {
        let mut tokens = head.start_line.split_whitespace();
        let (method, path) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(method), Some(target), Some(_version)) => (method, target),
            _ => ("UNKNOWN", "/"),
        };

        let mut record = RequestRecord::new(method, &self.host, path, self.watched);
        if self.verbose && !head.headers.is_empty() {
            record.headers = Some(head.headers.clone());
        }
        if self.watched && method_carries_preview(method) && !body.is_empty() {
            record.body_preview = Some(body_preview(body));
        }
        record
    }
}

/// A response status spotted on the server-to-client direction.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub code: u16,
    pub reason: String,
    /// Whatever decodable body bytes arrived alongside the header block.
    pub preview: Option<String>,
}

/// Scans the server-to-client direction for response status lines.
///
/// Parsing here is best-effort: the buffer is discarded after each header
/// block, so a response whose head is split from its body keeps flowing to
/// the client but yields an empty preview.
pub struct ResponseScanner {
    buf: Vec<u8>,
}

impl ResponseScanner {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StatusEvent> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        if let Some(terminator) = find_header_end(&self.buf) {
            if self.buf.starts_with(b"HTTP/") {
                let head = parse_message_head(&self.buf[..terminator]);
                if let Some(event) = status_event(&head, &self.buf[terminator + 4..]) {
                    events.push(event);
                }
            }
            self.buf.clear();
        }
        events
    }
}

impl Default for ResponseScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn status_event(head: &MessageHead, body: &[u8]) -> Option<StatusEvent> {
    let mut tokens = head.start_line.splitn(3, ' ');
    let _version = tokens.next()?;
    let code: u16 = tokens.next()?.trim().parse().ok()?;
    let reason = tokens.next().unwrap_or("").trim().to_string();
    Some(StatusEvent {
        code,
        reason,
        preview: response_preview(body).filter(|p| !p.is_empty()),
    })
}
