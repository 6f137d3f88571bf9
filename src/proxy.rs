/*
 * Copyright (C) 2026 Picket Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The backend (reverse-proxy) path: a handler that owns an upstream
//! connection, relays the client request to it, and streams the upstream
//! response back verbatim, honoring fixed-length, chunked, and
//! close-delimited framing.

use crate::connection::{Connection, Stage};
use crate::handler::{Handler, Respond, StaticResponse};
use crate::request::Request;
use crate::response::Responder;
use crate::transport::{BackendTransport, Transport};
use log::{debug, warn};
use std::io::Write;
use std::net::SocketAddr;

const BACKEND_RING_CAPACITY: usize = 16384;
const RELAY_READ_MAX: usize = 2048;
const MAX_UPSTREAM_LINE: usize = 8192;

/// How the upstream said its response body ends.
#[derive(Debug, PartialEq, Clone, Copy)]
enum UpstreamFraming {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

enum ProxyState {
    // upstream connect (and TLS-free handshake) in progress
    Connecting,

    SendingRequest { sent: usize },

    // collect the upstream status line + headers verbatim
    ReadingHead,

    ForwardingHead { sent: usize },

    RelayingFixed { left: u64 },

    RelayingUntilClose,

    // chunked relay tracks the frame protocol to find the end but
    // forwards every byte untouched
    RelayingChunkSize,
    RelayingChunkPayload { left: u64 },
    RelayingChunkEnd,
    RelayingTrailers,

    // upstream failed before anything was committed to the client
    Failing,

    Done,
}

enum UpstreamLine {
    Done { line: Vec<u8>, raw: Vec<u8> },
    Blocked,
    Eof,
    TooLong,
}

fn read_upstream_line(backend: &mut Connection) -> UpstreamLine {
    let mut buf = [0u8; MAX_UPSTREAM_LINE + 1];

    let n = match backend.recv(&mut buf) {
        Ok(0) => return UpstreamLine::Eof,
        Ok(n) => n,
        Err(_) => return UpstreamLine::Blocked,
    };

    for i in 0..n {
        if buf[i] == b'\n' {
            backend.putback_read(n - (i + 1));

            let end = if i > 0 && buf[i - 1] == b'\r' { i - 1 } else { i };

            return UpstreamLine::Done {
                line: buf[..end].to_vec(),
                raw: buf[..(i + 1)].to_vec(),
            };
        }
    }

    if n == buf.len() {
        return UpstreamLine::TooLong;
    }

    backend.putback_read(n);

    UpstreamLine::Blocked
}

/// Relays one request to an upstream server. The upstream connection is
/// private to this handler and closed after the exchange (no pooling);
/// the client response is forwarded byte-for-byte so the upstream's
/// framing headers stay authoritative.
pub struct ProxyHandler {
    upstream: Option<SocketAddr>,
    injected: Option<Box<dyn Transport>>,
    backend: Option<Connection>,

    method: String,
    target: String,
    host: String,
    content_type: Option<String>,
    fwd_headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
    body_done: bool,

    upstream_request: Vec<u8>,
    resp_head: Vec<u8>,
    resp_code: u16,
    framing: UpstreamFraming,

    state: ProxyState,
    failure: Option<StaticResponse>,
}

impl ProxyHandler {
    pub fn new(upstream: SocketAddr) -> Self {
        Self::build(Some(upstream), None)
    }

    /// Relays over an already-built transport instead of dialing; lets
    /// tests and benches run the whole path over in-memory pipes.
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self::build(None, Some(transport))
    }

    fn build(upstream: Option<SocketAddr>, injected: Option<Box<dyn Transport>>) -> Self {
        Self {
            upstream,
            injected,
            backend: None,
            method: String::new(),
            target: String::new(),
            host: String::new(),
            content_type: None,
            fwd_headers: Vec::new(),
            body: Vec::new(),
            body_done: false,
            upstream_request: Vec::new(),
            resp_head: Vec::new(),
            resp_code: 0,
            framing: UpstreamFraming::None,
            state: ProxyState::Connecting,
            failure: None,
        }
    }

    fn fail(&mut self, why: &str) {
        debug!("proxy: {}", why);

        self.failure = Some(StaticResponse::new(
            502,
            "Bad Gateway",
            "text/plain",
            b"upstream failure\n",
        ));
        self.state = ProxyState::Failing;
    }

    fn build_upstream_request(&mut self) {
        let mut msg = Vec::with_capacity(256 + self.body.len());

        write!(&mut msg, "{} {} HTTP/1.1\r\n", self.method, self.target)
            .expect("writing to a vec cannot fail");
        write!(&mut msg, "Host: {}\r\n", self.host).expect("writing to a vec cannot fail");

        for (name, value) in self.fwd_headers.iter() {
            write!(&mut msg, "{}: ", name).expect("writing to a vec cannot fail");
            msg.extend_from_slice(value);
            msg.extend_from_slice(b"\r\n");
        }

        if let Some(ct) = &self.content_type {
            write!(&mut msg, "Content-Type: {}\r\n", ct).expect("writing to a vec cannot fail");
        }

        if !self.body.is_empty() {
            write!(&mut msg, "Content-Length: {}\r\n", self.body.len())
                .expect("writing to a vec cannot fail");
        }

        // one upstream connection per exchange
        msg.extend_from_slice(b"Connection: close\r\n\r\n");
        msg.extend_from_slice(&self.body);

        self.upstream_request = msg;
    }

    /// Parses one upstream header line just enough to learn the framing;
    /// the bytes themselves are forwarded untouched.
    fn note_upstream_header(&mut self, line: &[u8]) {
        let colon = match line.iter().position(|&b| b == b':') {
            Some(p) => p,
            None => return,
        };

        let name = &line[..colon];
        let mut value = &line[(colon + 1)..];
        while value.first() == Some(&b' ') {
            value = &value[1..];
        }

        if name.eq_ignore_ascii_case(b"Content-Length") {
            if let Some(len) = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse().ok())
            {
                self.framing = UpstreamFraming::ContentLength(len);
            }
        } else if name.eq_ignore_ascii_case(b"Transfer-Encoding") {
            let chunked = std::str::from_utf8(value)
                .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
                .unwrap_or(false);

            if chunked {
                self.framing = UpstreamFraming::Chunked;
            }
        }
    }

    fn upstream_body_framing(&self) -> UpstreamFraming {
        // responses that never carry a body
        if self.method == "HEAD"
            || (100..=199).contains(&self.resp_code)
            || self.resp_code == 204
            || self.resp_code == 304
        {
            return UpstreamFraming::None;
        }

        match self.framing {
            UpstreamFraming::None => UpstreamFraming::CloseDelimited,
            framing => framing,
        }
    }

    /// Copies up to `limit` upstream bytes into the client's output ring.
    /// Returns (bytes moved, upstream eof seen, blocked).
    fn relay_bytes(
        backend: &mut Connection,
        out: &mut Responder,
        limit: u64,
    ) -> (u64, bool, bool) {
        let avail = out.write_avail();

        if avail == 0 {
            return (0, false, true);
        }

        let take = limit.min(RELAY_READ_MAX as u64).min(avail as u64) as usize;
        let mut buf = [0u8; RELAY_READ_MAX];

        match backend.recv(&mut buf[..take]) {
            Ok(0) => (0, true, false),
            Ok(n) => {
                let written = out.write(&buf[..n]);
                debug_assert_eq!(written, n);

                (n as u64, false, false)
            }
            Err(_) => (0, false, true),
        }
    }
}

impl Handler for ProxyHandler {
    fn header(&mut self, name: &str, value: &[u8]) {
        self.fwd_headers.push((name.to_string(), value.to_vec()));
    }

    fn accept_request(&mut self, req: &Request) -> bool {
        self.method = req.method().to_string();
        self.target = req.target().to_string();
        self.host = req.host().unwrap_or("").to_string();
        self.content_type = req.content_type().map(|s| s.to_string());

        let transport: Box<dyn Transport> = match self.injected.take() {
            Some(t) => t,
            None => {
                let addr = match self.upstream {
                    Some(addr) => addr,
                    None => return false,
                };

                match BackendTransport::connect(addr) {
                    Ok(t) => Box::new(t),
                    Err(e) => {
                        warn!("proxy: upstream connect failed: {}", e);
                        self.fail("connect failed");

                        return true;
                    }
                }
            }
        };

        match Connection::new(req.id(), transport, BACKEND_RING_CAPACITY) {
            Ok(backend) => {
                self.backend = Some(backend);

                true
            }
            Err(e) => {
                warn!("proxy: backend setup failed: {}", e);

                false
            }
        }
    }

    fn request_body(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            self.body_done = true;
            self.build_upstream_request();
        } else {
            self.body.extend_from_slice(chunk);
        }
    }

    fn respond(&mut self, out: &mut Responder) -> Respond {
        if !self.body_done {
            return Respond::Choked;
        }

        if let Some(failure) = &mut self.failure {
            return failure.respond(out);
        }

        let mut wrote = false;

        loop {
            match self.state {
                ProxyState::Connecting => {
                    let backend = self.backend.as_mut().expect("backend built at accept");

                    if backend.stage() == Stage::Accepted {
                        backend.drive_accept();
                    }

                    match backend.stage() {
                        Stage::Secured => {
                            self.state = ProxyState::SendingRequest { sent: 0 };
                        }
                        Stage::Accepted => {
                            if backend.should_destroy() {
                                self.fail("upstream connect failed");
                                continue;
                            }

                            return if wrote { Respond::Continue } else { Respond::Choked };
                        }
                        Stage::Complete => {
                            self.fail("upstream closed during connect");
                            continue;
                        }
                    }
                }
                ProxyState::SendingRequest { sent } => {
                    let backend = self.backend.as_mut().expect("backend built at accept");

                    let n = backend.send(&self.upstream_request[sent..]);
                    let sent = sent + n;

                    if backend.flush().is_err() {
                        self.fail("upstream write failed");
                        continue;
                    }

                    if sent == self.upstream_request.len() {
                        self.state = ProxyState::ReadingHead;
                    } else {
                        self.state = ProxyState::SendingRequest { sent };

                        if n == 0 {
                            return if wrote { Respond::Continue } else { Respond::Choked };
                        }
                    }
                }
                ProxyState::ReadingHead => {
                    let backend = self.backend.as_mut().expect("backend built at accept");

                    match read_upstream_line(backend) {
                        UpstreamLine::Done { line, raw } => {
                            if self.resp_head.is_empty() {
                                // status line: the code decides body rules
                                let code = line
                                    .split(|&b| b == b' ')
                                    .nth(1)
                                    .and_then(|t| std::str::from_utf8(t).ok())
                                    .and_then(|t| t.parse().ok());

                                match code {
                                    Some(code) => self.resp_code = code,
                                    None => {
                                        self.fail("malformed upstream status line");
                                        continue;
                                    }
                                }
                            } else if line.is_empty() {
                                self.resp_head.extend_from_slice(&raw);
                                self.state = ProxyState::ForwardingHead { sent: 0 };
                                continue;
                            } else {
                                self.note_upstream_header(&line);
                            }

                            self.resp_head.extend_from_slice(&raw);
                        }
                        UpstreamLine::Blocked => {
                            return if wrote { Respond::Continue } else { Respond::Choked };
                        }
                        UpstreamLine::Eof => {
                            self.fail("upstream closed before response head");
                            continue;
                        }
                        UpstreamLine::TooLong => {
                            self.fail("upstream header line too long");
                            continue;
                        }
                    }
                }
                ProxyState::ForwardingHead { sent } => {
                    let n = out.write(&self.resp_head[sent..]);
                    let sent = sent + n;

                    if n > 0 {
                        wrote = true;
                    }

                    if sent < self.resp_head.len() {
                        self.state = ProxyState::ForwardingHead { sent };

                        return if wrote { Respond::Continue } else { Respond::Choked };
                    }

                    self.state = match self.upstream_body_framing() {
                        UpstreamFraming::None => ProxyState::Done,
                        UpstreamFraming::ContentLength(len) => {
                            ProxyState::RelayingFixed { left: len }
                        }
                        UpstreamFraming::Chunked => ProxyState::RelayingChunkSize,
                        UpstreamFraming::CloseDelimited => {
                            // the body ends when the upstream closes, so
                            // the client connection must close too
                            out.close_after_response();

                            ProxyState::RelayingUntilClose
                        }
                    };
                }
                ProxyState::RelayingFixed { left } => {
                    if left == 0 {
                        self.state = ProxyState::Done;
                        continue;
                    }

                    let backend = self.backend.as_mut().expect("backend built at accept");
                    let (n, eof, blocked) = Self::relay_bytes(backend, out, left);

                    if eof {
                        // truncated upstream body; nothing honest to add
                        out.close_after_response();
                        self.state = ProxyState::Done;
                        continue;
                    }

                    if n > 0 {
                        wrote = true;
                        self.state = ProxyState::RelayingFixed { left: left - n };
                    } else if blocked {
                        return if wrote { Respond::Continue } else { Respond::Choked };
                    }
                }
                ProxyState::RelayingUntilClose => {
                    let backend = self.backend.as_mut().expect("backend built at accept");
                    let (n, eof, blocked) = Self::relay_bytes(backend, out, u64::MAX);

                    if eof {
                        self.state = ProxyState::Done;
                        continue;
                    }

                    if n > 0 {
                        wrote = true;
                    } else if blocked {
                        return if wrote { Respond::Continue } else { Respond::Choked };
                    }
                }
                ProxyState::RelayingChunkSize => {
                    let backend = self.backend.as_mut().expect("backend built at accept");

                    match read_upstream_line(backend) {
                        UpstreamLine::Done { line, raw } => {
                            let size = std::str::from_utf8(&line)
                                .ok()
                                .and_then(|s| u64::from_str_radix(s.trim(), 16).ok());

                            let size = match size {
                                Some(size) => size,
                                None => {
                                    out.close_after_response();
                                    self.state = ProxyState::Done;
                                    continue;
                                }
                            };

                            if !out.write_all_or_none(&raw) {
                                backend.putback_read(raw.len());

                                return if wrote { Respond::Continue } else { Respond::Choked };
                            }

                            wrote = true;

                            self.state = if size == 0 {
                                ProxyState::RelayingTrailers
                            } else {
                                ProxyState::RelayingChunkPayload { left: size }
                            };
                        }
                        UpstreamLine::Blocked => {
                            return if wrote { Respond::Continue } else { Respond::Choked };
                        }
                        UpstreamLine::Eof | UpstreamLine::TooLong => {
                            out.close_after_response();
                            self.state = ProxyState::Done;
                            continue;
                        }
                    }
                }
                ProxyState::RelayingChunkPayload { left } => {
                    if left == 0 {
                        self.state = ProxyState::RelayingChunkEnd;
                        continue;
                    }

                    let backend = self.backend.as_mut().expect("backend built at accept");
                    let (n, eof, blocked) = Self::relay_bytes(backend, out, left);

                    if eof {
                        out.close_after_response();
                        self.state = ProxyState::Done;
                        continue;
                    }

                    if n > 0 {
                        wrote = true;
                        self.state = ProxyState::RelayingChunkPayload { left: left - n };
                    } else if blocked {
                        return if wrote { Respond::Continue } else { Respond::Choked };
                    }
                }
                ProxyState::RelayingChunkEnd => {
                    let backend = self.backend.as_mut().expect("backend built at accept");

                    let mut buf = [0u8; 2];
                    let n = match backend.recv(&mut buf) {
                        Ok(0) => {
                            out.close_after_response();
                            self.state = ProxyState::Done;
                            continue;
                        }
                        Ok(n) => n,
                        Err(_) => {
                            return if wrote { Respond::Continue } else { Respond::Choked };
                        }
                    };

                    let consumed = match buf[0] {
                        b'\n' => 1,
                        b'\r' => {
                            if n < 2 {
                                backend.putback_read(n);

                                return if wrote { Respond::Continue } else { Respond::Choked };
                            }

                            if buf[1] != b'\n' {
                                out.close_after_response();
                                self.state = ProxyState::Done;
                                continue;
                            }

                            2
                        }
                        _ => {
                            out.close_after_response();
                            self.state = ProxyState::Done;
                            continue;
                        }
                    };

                    backend.putback_read(n - consumed);

                    if !out.write_all_or_none(&buf[..consumed]) {
                        backend.putback_read(consumed);

                        return if wrote { Respond::Continue } else { Respond::Choked };
                    }

                    wrote = true;
                    self.state = ProxyState::RelayingChunkSize;
                }
                ProxyState::RelayingTrailers => {
                    let backend = self.backend.as_mut().expect("backend built at accept");

                    match read_upstream_line(backend) {
                        UpstreamLine::Done { line, raw } => {
                            if !out.write_all_or_none(&raw) {
                                backend.putback_read(raw.len());

                                return if wrote { Respond::Continue } else { Respond::Choked };
                            }

                            wrote = true;

                            if line.is_empty() {
                                self.state = ProxyState::Done;
                            }
                        }
                        UpstreamLine::Blocked => {
                            return if wrote { Respond::Continue } else { Respond::Choked };
                        }
                        UpstreamLine::Eof | UpstreamLine::TooLong => {
                            out.close_after_response();
                            self.state = ProxyState::Done;
                            continue;
                        }
                    }
                }
                ProxyState::Failing => {
                    let failure = self.failure.as_mut().expect("failure response set");

                    return failure.respond(out);
                }
                ProxyState::Done => return Respond::Finished,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{RouteDecision, RouteTarget};
    use crate::server::{drive_connection, ServerContext};
    use crate::transport::{DuplexPipe, DuplexTransport};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct ProxyRig {
        ctx: ServerContext,
        conn: Connection,
        client: Rc<RefCell<DuplexPipe>>,
        backend: Rc<RefCell<DuplexPipe>>,
    }

    impl ProxyRig {
        fn new() -> Self {
            let backend = DuplexPipe::new();

            let transport_slot: Rc<RefCell<Option<Box<dyn Transport>>>> = Rc::new(RefCell::new(
                Some(Box::new(DuplexTransport::new(&backend)) as Box<dyn Transport>),
            ));

            let mut ctx = ServerContext::new();

            ctx.register_hook(Box::new(move |_rt: &RouteTarget| {
                let transport = transport_slot
                    .borrow_mut()
                    .take()
                    .expect("one request per rig");

                RouteDecision::Accept(Box::new(ProxyHandler::with_transport(transport)))
            }));

            let client = DuplexPipe::new();
            let conn = Connection::new(
                1,
                Box::new(DuplexTransport::new(&client)),
                16384,
            )
            .unwrap();

            Self {
                ctx,
                conn,
                client,
                backend,
            }
        }

        fn drive(&mut self) {
            drive_connection(&self.ctx, &mut self.conn);
        }
    }

    #[test]
    fn test_head_serialization_and_fixed_relay() {
        let mut rig = ProxyRig::new();

        rig.client
            .borrow_mut()
            .feed(b"GET /api/items HTTP/1.1\r\nHost: internal\r\nX-Trace: abc\r\n\r\n");
        rig.drive();

        // the upstream request went out with our connection policy
        let sent = rig.backend.borrow_mut().take_written();
        assert_eq!(
            sent,
            b"GET /api/items HTTP/1.1\r\nHost: internal\r\nX-Trace: abc\r\nConnection: close\r\n\r\n".to_vec()
        );

        let upstream = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Up: 1\r\n\r\nhello";
        rig.backend.borrow_mut().feed(upstream);
        rig.drive();

        // forwarded verbatim
        assert_eq!(rig.client.borrow_mut().take_written(), upstream.to_vec());

        assert_eq!(rig.conn.requests_in_process(), 0);
        assert_eq!(rig.conn.stage(), Stage::Secured);
    }

    #[test]
    fn test_request_body_forwarded_with_length() {
        let mut rig = ProxyRig::new();

        rig.client
            .borrow_mut()
            .feed(b"POST /submit HTTP/1.1\r\nHost: internal\r\nContent-Length: 4\r\n\r\nping");
        rig.drive();

        let sent = rig.backend.borrow_mut().take_written();
        assert_eq!(
            sent,
            b"POST /submit HTTP/1.1\r\nHost: internal\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping"
                .to_vec()
        );
    }

    #[test]
    fn test_close_delimited_relay_closes_client() {
        let mut rig = ProxyRig::new();

        rig.client
            .borrow_mut()
            .feed(b"GET / HTTP/1.1\r\nHost: internal\r\n\r\n");
        rig.drive();

        {
            let backend = &mut *rig.backend.borrow_mut();
            backend.feed(b"HTTP/1.1 200 OK\r\n\r\nstreaming until close");
            backend.finish();
        }
        rig.drive();

        assert_eq!(
            rig.client.borrow_mut().take_written(),
            b"HTTP/1.1 200 OK\r\n\r\nstreaming until close".to_vec()
        );

        // close-delimited toward the client as well
        assert!(rig.conn.should_destroy());
    }

    #[test]
    fn test_chunked_relay_verbatim() {
        let mut rig = ProxyRig::new();

        rig.client
            .borrow_mut()
            .feed(b"GET / HTTP/1.1\r\nHost: internal\r\n\r\n");
        rig.drive();

        let upstream =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        rig.backend.borrow_mut().feed(upstream);
        rig.drive();

        assert_eq!(rig.client.borrow_mut().take_written(), upstream.to_vec());

        // chunked framing is self-terminating; the client stays open
        assert_eq!(rig.conn.requests_in_process(), 0);
        assert_eq!(rig.conn.stage(), Stage::Secured);
    }

    #[test]
    fn test_upstream_eof_before_head_yields_502() {
        let mut rig = ProxyRig::new();

        rig.client
            .borrow_mut()
            .feed(b"GET / HTTP/1.1\r\nHost: internal\r\n\r\n");
        rig.drive();

        rig.backend.borrow_mut().finish();
        rig.drive();

        let wire = rig.client.borrow_mut().take_written();
        let head = std::str::from_utf8(&wire).unwrap();
        assert!(head.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", head);
    }
}
