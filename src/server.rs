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

//! The server context, the idle driver, and the readiness loop.
//!
//! The idle driver owns the suspension/resumption protocol: for a ready
//! connection it alternates the read and write state machines and the
//! flush until all of them report "would block", then tells the poller
//! which readiness event to wait for next via the connection's
//! `wants_read`/`wants_write` flags.

use crate::config::Config;
use crate::connection::{Connection, Stage};
use crate::handler::{RouteDecision, RouteHook, RouteTarget};
use crate::parser;
use crate::request::MAX_FIELD_LENGTH;
use crate::response;
use crate::tls::TlsAcceptor;
use crate::transport::{CleartextTransport, Transport};
use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const EVENTS_MAX: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("tls setup failed: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Shared per-process state, passed by reference into connection and
/// request construction instead of living in globals: the ordered route
/// hooks and the id counters.
pub struct ServerContext {
    hooks: Vec<Box<dyn RouteHook>>,
    next_request_id: Cell<u64>,
    next_connection_id: Cell<u64>,
}

impl ServerContext {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            next_request_id: Cell::new(1),
            next_connection_id: Cell::new(1),
        }
    }

    /// Appends a route hook; hooks are evaluated in registration order.
    pub fn register_hook(&mut self, hook: Box<dyn RouteHook>) {
        self.hooks.push(hook);
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        let id = self.next_request_id.get();
        self.next_request_id.set(id + 1);

        id
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        let id = self.next_connection_id.get();
        self.next_connection_id.set(id + 1);

        id
    }

    pub(crate) fn route(&self, method: &str, target: &str) -> RouteDecision {
        let rt = RouteTarget { method, target };

        for hook in self.hooks.iter() {
            match hook.route(&rt) {
                RouteDecision::Decline => continue,
                decision => return decision,
            }
        }

        RouteDecision::Decline
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one ready connection as far as it will go: handshake first,
/// then alternating read/write/flush passes until nothing progresses,
/// then shutdown once `Complete`. On return the connection's wants flags
/// say which readiness event to wait for; `should_destroy` says the slot
/// can be reaped.
pub fn drive_connection(ctx: &ServerContext, conn: &mut Connection) {
    conn.reset_wants();

    if conn.stage() == Stage::Accepted {
        conn.drive_accept();

        if conn.stage() != Stage::Secured {
            return;
        }
    }

    loop {
        if conn.should_destroy() {
            return;
        }

        match conn.stage() {
            Stage::Secured => {
                let read_progress = parser::drive_read(ctx, conn);
                let write_progress = response::drive_write(conn);

                let flush_progress = match conn.flush() {
                    Ok(n) => n > 0,
                    Err(_) => return,
                };

                if conn.stage() == Stage::Complete {
                    continue;
                }

                if !read_progress && !write_progress && !flush_progress {
                    return;
                }
            }
            Stage::Complete => {
                if conn.flush().is_err() {
                    return;
                }

                if conn.has_unflushed_output() {
                    // wait for writability, then flush the remainder
                    return;
                }

                if conn.drive_shutdown() {
                    conn.should_destroy = true;
                }

                return;
            }
            Stage::Accepted => return,
        }
    }
}

/// Accepting loop over a mio poller: boundary glue between the OS
/// readiness events and the protocol drivers.
pub struct Server {
    ctx: ServerContext,
    config: Config,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    conns: Slab<Connection>,
    stopping: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: Config, ctx: ServerContext) -> Result<Self, ServerError> {
        if config.ring_capacity <= MAX_FIELD_LENGTH {
            return Err(ServerError::InvalidConfig(
                "ring capacity must exceed the largest header field",
            ));
        }

        let addr = config
            .listen
            .parse()
            .map_err(|_| ServerError::InvalidConfig("unparseable listen address"))?;

        let mut listener = TcpListener::bind(addr)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let tls = if config.wants_tls() {
            let cert = config.tls_cert.as_ref().expect("checked by wants_tls");
            let key = config.tls_key.as_ref().expect("checked by wants_tls");

            Some(TlsAcceptor::new(cert, key)?)
        } else {
            None
        };

        Ok(Self {
            ctx,
            config,
            poll,
            events: Events::with_capacity(EVENTS_MAX),
            listener,
            tls,
            conns: Slab::new(),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn context_mut(&mut self) -> &mut ServerContext {
        &mut self.ctx
    }

    /// Flag another thread (e.g. a signal handler) can set to stop `run`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopping)
    }

    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        info!("listening on {}", self.config.listen);

        let tick = Duration::from_secs(1);
        let mut last_housekeep = Instant::now();

        while !self.stopping.load(Ordering::Relaxed) {
            self.step(Some(tick))?;

            if last_housekeep.elapsed() >= tick {
                self.housekeep();
                last_housekeep = Instant::now();
            }
        }

        info!("stopping");

        Ok(())
    }

    /// One poll iteration: wait for readiness, accept, drive the ready
    /// connections, reap the dead.
    pub fn step(&mut self, timeout: Option<Duration>) -> Result<(), ServerError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();

        for token in tokens {
            if token == LISTENER_TOKEN {
                self.accept_pending();
            } else {
                self.drive_slot(token.0);
            }
        }

        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept failed: {}", e);

                    return;
                }
            };

            if self.conns.len() >= self.config.max_connections {
                warn!("connection limit reached, dropping {}", peer);

                continue;
            }

            let transport: Box<dyn Transport> = match &self.tls {
                Some(tls) => match tls.accept(stream) {
                    Ok(t) => Box::new(t),
                    Err(e) => {
                        warn!("tls accept failed: {}", e);

                        continue;
                    }
                },
                None => Box::new(CleartextTransport::new(stream)),
            };

            let conn = match Connection::new(
                self.ctx.next_connection_id(),
                transport,
                self.config.ring_capacity,
            ) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("connection setup failed: {}", e);

                    continue;
                }
            };

            debug!("conn {}: accepted from {}", conn.id(), peer);

            let key = self.conns.insert(conn);

            {
                let conn = &mut self.conns[key];

                if let Some(src) = conn.transport.event_source() {
                    if let Err(e) = self.poll.registry().register(
                        src,
                        Token(key),
                        Interest::READABLE.add(Interest::WRITABLE),
                    ) {
                        warn!("conn registration failed: {}", e);
                        self.conns.remove(key);

                        continue;
                    }
                }
            }

            self.drive_slot(key);
        }
    }

    fn drive_slot(&mut self, key: usize) {
        let conn = match self.conns.get_mut(key) {
            Some(conn) => conn,
            None => return,
        };

        drive_connection(&self.ctx, conn);

        if conn.should_destroy() {
            let mut conn = self.conns.remove(key);

            if let Some(src) = conn.transport.event_source() {
                let _ = self.poll.registry().deregister(src);
            }

            debug!("conn {}: destroyed", conn.id());

            return;
        }

        let interest = if conn.wants_read() && conn.wants_write() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else if conn.wants_write() {
            Interest::WRITABLE
        } else {
            // always watch readability: new requests and peer close
            Interest::READABLE
        };

        if let Some(src) = conn.transport.event_source() {
            let _ = self.poll.registry().reregister(src, Token(key), interest);
        }
    }

    /// Periodic pass: re-drive completed-but-unflushed connections and
    /// expire idle ones. (The core parser enforces no timeouts itself;
    /// this is where stalled clients get cut off.)
    pub fn housekeep(&mut self) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();

        let mut stale: Vec<usize> = Vec::new();
        let mut parked: Vec<usize> = Vec::new();

        for (key, conn) in self.conns.iter() {
            if now.duration_since(conn.last_activity()) > idle_timeout {
                stale.push(key);
            } else if conn.stage() == Stage::Complete
                || conn.has_unflushed_output()
                || conn.requests_in_process() > 0
            {
                // includes requests waiting on backend progress, which is
                // not surfaced through this poller
                parked.push(key);
            }
        }

        for key in stale {
            if let Some(conn) = self.conns.get_mut(key) {
                debug!("conn {}: idle timeout", conn.id());
                conn.complete();
            }

            self.drive_slot(key);
        }

        for key in parked {
            self.drive_slot(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, Respond, StaticResponse};
    use crate::request::ReadStage;
    use crate::response::Responder;
    use crate::transport::{DuplexPipe, DuplexTransport};
    use crate::websocket::{apply_mask, write_frame_header, Opcode, HEADER_SIZE_MAX};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorded {
        accepted: Vec<(String, String, Option<String>)>,
        headers: Vec<(String, Vec<u8>)>,
        body_chunks: Vec<Vec<u8>>,
        body_ended: bool,
        ws_data: Vec<(Opcode, Vec<u8>, bool)>,
        ws_closings: Vec<(u16, Vec<u8>)>,
        destroyed: Vec<String>,
    }

    struct RecordingHandler {
        rec: Rc<RefCell<Recorded>>,
        label: String,
        response: StaticResponse,
        respond_after_body: bool,
    }

    impl RecordingHandler {
        fn new(rec: &Rc<RefCell<Recorded>>, label: &str, body: &[u8]) -> Self {
            Self {
                rec: Rc::clone(rec),
                label: label.to_string(),
                response: StaticResponse::new(200, "OK", "text/plain", body),
                respond_after_body: false,
            }
        }

        fn after_body(mut self) -> Self {
            self.respond_after_body = true;
            self
        }
    }

    impl Handler for RecordingHandler {
        fn header(&mut self, name: &str, value: &[u8]) {
            self.rec
                .borrow_mut()
                .headers
                .push((name.to_string(), value.to_vec()));
        }

        fn accept_request(&mut self, req: &crate::request::Request) -> bool {
            self.rec.borrow_mut().accepted.push((
                req.method().to_string(),
                req.target().to_string(),
                req.host().map(|h| h.to_string()),
            ));

            true
        }

        fn request_body(&mut self, chunk: &[u8]) {
            let rec = &mut *self.rec.borrow_mut();

            if chunk.is_empty() {
                rec.body_ended = true;
            } else {
                rec.body_chunks.push(chunk.to_vec());
            }
        }

        fn respond(&mut self, out: &mut Responder) -> Respond {
            if self.respond_after_body && !self.rec.borrow().body_ended {
                return Respond::Choked;
            }

            self.response.respond(out)
        }

        fn ws_data(&mut self, opcode: Opcode, chunk: &[u8], fin: bool) {
            self.rec
                .borrow_mut()
                .ws_data
                .push((opcode, chunk.to_vec(), fin));
        }

        fn ws_closing(&mut self, code: u16, reason: &[u8]) {
            self.rec
                .borrow_mut()
                .ws_closings
                .push((code, reason.to_vec()));
        }
    }

    impl Drop for RecordingHandler {
        fn drop(&mut self) {
            self.rec.borrow_mut().destroyed.push(self.label.clone());
        }
    }

    struct Rig {
        ctx: ServerContext,
        conn: Connection,
        pipe: Rc<RefCell<DuplexPipe>>,
        rec: Rc<RefCell<Recorded>>,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_body_gate(false)
        }

        fn with_body_gate(respond_after_body: bool) -> Self {
            let rec: Rc<RefCell<Recorded>> = Rc::new(RefCell::new(Recorded::default()));

            let mut ctx = ServerContext::new();

            let hook_rec = Rc::clone(&rec);
            ctx.register_hook(Box::new(move |rt: &RouteTarget| {
                let body = format!("served {}", rt.target);
                let mut handler =
                    RecordingHandler::new(&hook_rec, rt.target, body.as_bytes());

                if respond_after_body {
                    handler = handler.after_body();
                }

                RouteDecision::Accept(Box::new(handler))
            }));

            let pipe = DuplexPipe::new();
            let conn = Connection::new(
                ctx.next_connection_id(),
                Box::new(DuplexTransport::new(&pipe)),
                16384,
            )
            .unwrap();

            Self {
                ctx,
                conn,
                pipe,
                rec,
            }
        }

        fn feed(&mut self, bytes: &[u8]) {
            self.pipe.borrow_mut().feed(bytes);
        }

        fn drive(&mut self) {
            drive_connection(&self.ctx, &mut self.conn);
        }

        fn output(&mut self) -> Vec<u8> {
            self.pipe.borrow_mut().take_written()
        }
    }

    fn parse_response(wire: &[u8]) -> (u16, Vec<(String, Vec<u8>)>, Vec<u8>, usize) {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut resp = httparse::Response::new(&mut headers);

        let head_len = match resp.parse(wire).unwrap() {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => panic!("incomplete response"),
        };

        let code = resp.code.unwrap();

        let parsed_headers: Vec<(String, Vec<u8>)> = resp
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect();

        let content_length: usize = parsed_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, v)| std::str::from_utf8(v).unwrap().parse().unwrap())
            .unwrap_or(0);

        let body = wire[head_len..(head_len + content_length)].to_vec();

        (code, parsed_headers, body, head_len + content_length)
    }

    fn masked_frame(opcode: Opcode, payload: &[u8], mask: [u8; 4], fin: bool) -> Vec<u8> {
        let mut header = [0u8; HEADER_SIZE_MAX];
        let hlen =
            write_frame_header(fin, opcode, payload.len() as u64, Some(mask), &mut header);

        let mut frame = header[..hlen].to_vec();

        let mut masked = payload.to_vec();
        apply_mask(&mut masked, mask, 0);
        frame.extend_from_slice(&masked);

        frame
    }

    #[test_log::test]
    fn test_simple_get() {
        let mut rig = Rig::new();

        rig.feed(b"GET /hello HTTP/1.1\r\nHost: localhost:8080\r\n\r\n");
        rig.drive();

        let wire = rig.output();
        let (code, _, body, _) = parse_response(&wire);

        assert_eq!(code, 200);
        assert_eq!(body, b"served /hello");

        // keep-alive: the request is gone, the connection is not
        assert_eq!(rig.conn.requests_in_process(), 0);
        assert_eq!(rig.conn.stage(), Stage::Secured);
        assert_eq!(rig.rec.borrow().destroyed, vec!["/hello"]);
    }

    #[test]
    fn test_parser_incremental_equivalence() {
        let request = b"GET / HTTP/1.1\r\nHost: localhost:8080\r\n\r\n";

        // one shot
        let mut rig = Rig::new();
        rig.feed(request);
        rig.drive();

        let one_shot = rig.rec.borrow().accepted.clone();

        // byte at a time, driving between every byte
        let mut rig = Rig::new();
        for &b in request.iter() {
            rig.feed(&[b]);
            rig.drive();
        }

        let dribbled = rig.rec.borrow().accepted.clone();

        assert_eq!(one_shot, dribbled);
        assert_eq!(
            one_shot,
            vec![(
                "GET".to_string(),
                "/".to_string(),
                Some("localhost:8080".to_string())
            )]
        );
        assert_eq!(rig.conn.requests_in_process(), 0);
    }

    #[test]
    fn test_line_ending_tolerance() {
        let variants: &[&[u8]] = &[
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
            b"GET / HTTP/1.1\nHost: x\n\n",
            b"GET / HTTP/1.1\r\nHost: x\n\r\n",
        ];

        for &req in variants {
            let mut rig = Rig::new();
            rig.feed(req);
            rig.drive();

            let accepted = rig.rec.borrow().accepted.clone();
            assert_eq!(
                accepted,
                vec![("GET".to_string(), "/".to_string(), Some("x".to_string()))],
                "variant: {:?}",
                std::str::from_utf8(req)
            );
        }
    }

    #[test]
    fn test_missing_method_kills_connection() {
        let mut rig = Rig::new();

        rig.feed(b"HTTP/1.1\r\nHost: x\r\n\r\n");
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert!(rig.rec.borrow().accepted.is_empty());

        let req = rig.conn.requests.back().unwrap();
        assert_ne!(req.read_stage, ReadStage::DoneReading);
        assert!(req.kill_reason.is_some());
    }

    #[test]
    fn test_missing_host_kills_connection() {
        let mut rig = Rig::new();

        rig.feed(b"GET / HTTP/1.1\r\n\r\n");
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert!(rig.rec.borrow().accepted.is_empty());
        assert_eq!(
            rig.conn.requests.back().unwrap().kill_reason,
            Some("missing host header")
        );
    }

    #[test]
    fn test_conflicting_framing_kills_connection() {
        let mut rig = Rig::new();

        rig.feed(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert_eq!(
            rig.conn.requests.back().unwrap().kill_reason,
            Some("conflicting body framing")
        );
    }

    #[test]
    fn test_forbidden_header_byte_kills_connection() {
        let mut rig = Rig::new();

        rig.feed(b"GET / HTTP/1.1\r\nHost: x\r\nX-Weird: a{b}\r\n\r\n");
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert_eq!(
            rig.conn.requests.back().unwrap().kill_reason,
            Some("forbidden character in header")
        );
    }

    #[test]
    fn test_unrecognized_headers_reach_handler() {
        let mut rig = Rig::new();

        rig.feed(b"GET / HTTP/1.1\r\nHost: x\r\nX-Custom: some value\r\n\r\n");
        rig.drive();

        let rec = rig.rec.borrow();
        assert_eq!(rec.headers.len(), 1);
        assert_eq!(rec.headers[0].0, "X-Custom");
        assert_eq!(rec.headers[0].1, b"some value");
    }

    #[test]
    fn test_fixed_length_body() {
        let mut rig = Rig::new();

        rig.feed(b"POST /in HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world");
        rig.drive();

        let rec = rig.rec.borrow();
        let total: Vec<u8> = rec.body_chunks.iter().flatten().copied().collect();
        assert_eq!(total, b"hello world");
        assert!(rec.body_ended);
    }

    #[test]
    fn test_chunked_round_trip() {
        let mut rig = Rig::new();

        rig.feed(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
        rig.feed(b"8\r\nNo time!\r\n0\r\n\r\n");
        rig.drive();

        let rec = rig.rec.borrow();
        assert_eq!(rec.body_chunks, vec![b"No time!".to_vec()]);
        assert!(rec.body_ended);
        assert_eq!(rig.conn.requests_in_process(), 0);
    }

    #[test]
    fn test_chunked_trailers_reach_handler() {
        let mut rig = Rig::new();

        rig.feed(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
        rig.feed(b"3\r\nabc\r\n0\r\nX-Trail: yes\r\n\r\n");
        rig.drive();

        let rec = rig.rec.borrow();
        assert_eq!(rec.body_chunks, vec![b"abc".to_vec()]);
        assert!(rec.body_ended);
        assert!(rec
            .headers
            .iter()
            .any(|(n, v)| n == "X-Trail" && v == b"yes"));
    }

    #[test]
    fn test_bad_chunk_size_kills_connection() {
        let mut rig = Rig::new();

        rig.feed(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
        rig.feed(b"zz\r\n");
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert_eq!(
            rig.conn.requests.back().unwrap().kill_reason,
            Some("invalid chunk size")
        );
    }

    #[test]
    fn test_pipelined_requests_fifo() {
        let mut rig = Rig::new();

        // both requests submitted before any response could be flushed
        rig.feed(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");
        rig.drive();

        let wire = rig.output();

        let (code_a, _, body_a, used) = parse_response(&wire);
        assert_eq!(code_a, 200);
        assert_eq!(body_a, b"served /a");

        let (code_b, _, body_b, _) = parse_response(&wire[used..]);
        assert_eq!(code_b, 200);
        assert_eq!(body_b, b"served /b");

        assert_eq!(rig.conn.requests_in_process(), 0);
        assert_eq!(rig.rec.borrow().destroyed, vec!["/a", "/b"]);
        assert_eq!(rig.conn.stage(), Stage::Secured);
    }

    #[test]
    fn test_sequential_keep_alive_requests() {
        let mut rig = Rig::new();

        rig.feed(b"GET /first HTTP/1.1\r\nHost: x\r\n\r\n");
        rig.drive();
        let (_, _, body, _) = parse_response(&rig.output());
        assert_eq!(body, b"served /first");

        rig.feed(b"GET /second HTTP/1.1\r\nHost: x\r\n\r\n");
        rig.drive();
        let (_, _, body, _) = parse_response(&rig.output());
        assert_eq!(body, b"served /second");

        assert_eq!(rig.conn.stage(), Stage::Secured);
    }

    #[test]
    fn test_connection_close_completes_after_response() {
        let mut rig = Rig::new();

        rig.feed(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
        rig.drive();

        let (code, _, _, _) = parse_response(&rig.output());
        assert_eq!(code, 200);
        assert!(rig.conn.should_destroy());
    }

    #[test]
    fn test_expect_100_continue_pause_and_resume() {
        let mut rig = Rig::with_body_gate(true);

        rig.feed(
            b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n",
        );
        rig.drive();

        // the interim response went out and reading resumed
        let interim = rig.output();
        assert_eq!(interim, b"HTTP/1.1 100 Continue\r\n\r\n");
        assert_eq!(
            rig.conn.requests.front().unwrap().read_stage,
            ReadStage::ReadingBody
        );

        rig.feed(b"hello");
        rig.drive();

        let rec_body = rig.rec.borrow().body_chunks.clone();
        assert_eq!(rec_body, vec![b"hello".to_vec()]);

        let (code, _, body, _) = parse_response(&rig.output());
        assert_eq!(code, 200);
        assert_eq!(body, b"served /up");
        assert_eq!(rig.conn.requests_in_process(), 0);
    }

    #[test]
    fn test_absolute_form_target_rewritten() {
        let mut rig = Rig::new();

        rig.feed(b"GET https://example.com/path?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        rig.drive();

        let accepted = rig.rec.borrow().accepted.clone();
        assert_eq!(
            accepted,
            vec![(
                "GET".to_string(),
                "/path?q=1".to_string(),
                Some("example.com".to_string())
            )]
        );
    }

    #[test]
    fn test_absolute_form_plain_http_rejected() {
        let mut rig = Rig::new();

        rig.feed(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n");
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert_eq!(
            rig.conn.requests.back().unwrap().kill_reason,
            Some("plain http target rejected")
        );
    }

    #[test]
    fn test_absolute_form_host_mismatch_rejected() {
        let mut rig = Rig::new();

        rig.feed(b"GET https://example.com/ HTTP/1.1\r\nHost: other.com\r\n\r\n");
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert_eq!(
            rig.conn.requests.back().unwrap().kill_reason,
            Some("host mismatch")
        );
    }

    fn upgrade_rig() -> Rig {
        let mut rig = Rig::new();

        rig.feed(
            b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );
        rig.drive();

        rig
    }

    #[test]
    fn test_websocket_upgrade_response() {
        let mut rig = upgrade_rig();

        let wire = rig.output();
        let head = std::str::from_utf8(&wire).unwrap();

        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Upgrade: websocket\r\n"));
        assert!(head.contains("Connection: Upgrade\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        assert_eq!(
            rig.conn.requests.front().unwrap().read_stage,
            ReadStage::Websocket
        );
        assert_eq!(rig.conn.stage(), Stage::Secured);
    }

    #[test]
    fn test_websocket_upgrade_missing_key_killed() {
        let mut rig = Rig::new();

        rig.feed(
            b"GET /chat HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        );
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert_eq!(
            rig.conn.requests.back().unwrap().kill_reason,
            Some("bad websocket upgrade request")
        );
    }

    #[test]
    fn test_websocket_data_frames_keep_connection_open() {
        let mut rig = upgrade_rig();
        rig.output(); // discard the 101

        let mask = [0x11, 0x22, 0x33, 0x44];

        for i in 0..10 {
            let payload = format!("message {}", i);
            rig.feed(&masked_frame(Opcode::Text, payload.as_bytes(), mask, true));
            rig.drive();

            assert_eq!(rig.conn.stage(), Stage::Secured, "frame {}", i);
        }

        let rec = rig.rec.borrow();
        assert_eq!(rec.ws_data.len(), 10);

        for (i, (opcode, data, fin)) in rec.ws_data.iter().enumerate() {
            assert_eq!(*opcode, Opcode::Text);
            assert_eq!(data, format!("message {}", i).as_bytes());
            assert!(fin);
        }
    }

    #[test]
    fn test_websocket_ping_gets_pong() {
        let mut rig = upgrade_rig();
        rig.output();

        rig.feed(&masked_frame(Opcode::Ping, b"hi", [9, 8, 7, 6], true));
        rig.drive();

        // unmasked pong echo with the identical payload
        assert_eq!(rig.output(), vec![0x8a, 0x02, b'h', b'i']);
        assert_eq!(rig.conn.stage(), Stage::Secured);
    }

    #[test_log::test]
    fn test_websocket_close_completes_connection() {
        let mut rig = upgrade_rig();
        rig.output();

        let close_payload = 1000u16.to_be_bytes();
        rig.feed(&masked_frame(
            Opcode::Close,
            &close_payload,
            [1, 2, 3, 4],
            true,
        ));
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);

        // the close echo went out before shutdown
        assert_eq!(rig.output(), vec![0x88, 0x02, 0x03, 0xe8]);

        let rec = rig.rec.borrow();
        assert_eq!(rec.ws_closings, vec![(1000, Vec::new())]);
    }

    #[test]
    fn test_websocket_reserved_bits_fatal() {
        let mut rig = upgrade_rig();
        rig.output();

        // text frame with rsv1 set
        rig.feed(&[0x80 | 0x40 | 0x01, 0x00]);
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert_eq!(
            rig.conn.requests.back().unwrap().kill_reason,
            Some("reserved frame bits set")
        );
    }

    #[test]
    fn test_write_backpressure_resumes() {
        let mut rig = Rig::new();

        rig.pipe.borrow_mut().limit_write(10);

        rig.feed(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n");
        rig.drive();

        // only part of the response could be flushed
        assert!(rig.conn.wants_write());
        assert!(rig.conn.has_unflushed_output());

        rig.pipe.borrow_mut().allow_write(4096);
        rig.drive();

        let (code, _, body, _) = parse_response(&rig.output());
        assert_eq!(code, 200);
        assert_eq!(body, b"served /x");
        assert_eq!(rig.conn.requests_in_process(), 0);
    }

    #[test]
    fn test_eof_with_no_requests_completes() {
        let mut rig = Rig::new();

        rig.pipe.borrow_mut().finish();
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert!(rig.conn.should_destroy());
    }

    #[test]
    fn test_eof_mid_request_kills() {
        let mut rig = Rig::new();

        rig.feed(b"GET / HT");
        rig.pipe.borrow_mut().finish();
        rig.drive();

        assert_eq!(rig.conn.stage(), Stage::Complete);
        assert_eq!(
            rig.conn.requests.back().unwrap().kill_reason,
            Some("unexpected end of stream")
        );
    }
}
