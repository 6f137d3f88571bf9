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

//! Incremental request parsing.
//!
//! Every read here is speculative: a sub-parser asks the connection for up
//! to a bounded maximum, scans for its terminator, consumes exactly what
//! it understood and puts back the rest. When the terminator has not
//! arrived yet, everything is put back and the same state is retried on
//! the next driver pass, so the parser is recoverable across any number
//! of partial reads.

use crate::connection::{Connection, Stage};
use crate::handler::RouteDecision;
use crate::request::{
    BodyFraming, ReadStage, Request, WriteStage, MAX_FIELD_LENGTH, MAX_METHOD_LENGTH,
    MAX_TARGET_LENGTH,
};
use crate::server::ServerContext;
use crate::websocket;
use arrayvec::ArrayString;
use log::debug;
use std::str;
use url::Url;

const MAX_VERSION_LENGTH: usize = 8; // "HTTP/1.1"
const MAX_CHUNK_SIZE_LINE: usize = 16;
const BODY_READ_MAX: usize = 2048;

pub(crate) const WEBSOCKET_VERSION: u8 = 13;

/// Outcome of one sub-parser step. `Blocked` means no further progress is
/// possible until new bytes arrive (or the write side advances).
#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Step {
    Progress,
    Blocked,
}

/// Kills the request being read: records the reason and forces the
/// connection into orderly shutdown.
pub(crate) fn kill(conn: &mut Connection, reason: &'static str) -> Step {
    debug!("conn {}: killing request: {}", conn.id, reason);

    if let Some(req) = conn.requests.back_mut() {
        req.kill_reason = Some(reason);
    }

    conn.complete();

    Step::Progress
}

/// Drives the read state machine until it can make no further progress.
/// Returns true if anything advanced.
pub fn drive_read(ctx: &ServerContext, conn: &mut Connection) -> bool {
    let mut progress = false;

    loop {
        if conn.stage != Stage::Secured || conn.should_destroy {
            return progress;
        }

        let reading = matches!(conn.requests.back(), Some(r) if r.still_reading());

        if !reading {
            // probe for the next pipelined request
            let mut b = [0u8; 1];

            match conn.recv(&mut b) {
                Ok(0) => {
                    // end of stream between requests: orderly close once
                    // nothing is left in flight
                    if conn.requests.is_empty() {
                        conn.complete();
                        progress = true;
                    }

                    return progress;
                }
                Ok(_) => {
                    conn.putback_read(1);

                    let mut req = Request::new(ctx.next_request_id());
                    req.read_stage = ReadStage::ReadingMethod;
                    conn.requests.push_back(req);

                    progress = true;
                }
                Err(_) => return progress,
            }
        }

        let stage = conn.requests.back().expect("reading request exists").read_stage;

        let step = match stage {
            ReadStage::Fresh | ReadStage::ReadingMethod => read_method(conn),
            ReadStage::PastMethod => skip_spaces(conn, ReadStage::ReadingTarget),
            ReadStage::ReadingTarget => read_target(conn),
            ReadStage::PastTarget => skip_spaces(conn, ReadStage::ReadingVersion),
            ReadStage::ReadingVersion => read_version(ctx, conn),
            ReadStage::ReadingField => read_field(conn),
            ReadStage::AwaitingContinueWrite | ReadStage::AwaitingUpgradeWrite => Step::Blocked,
            ReadStage::ReadingBody => read_body(conn),
            ReadStage::ReadingChunkSize => read_chunk_size(conn),
            ReadStage::ReadingChunkBody => read_chunk_body(conn),
            ReadStage::ReadingTrailer => read_trailer(conn),
            ReadStage::Websocket => websocket::drive_read(conn),
            ReadStage::DoneReading => unreachable!("done requests are not driven"),
        };

        match step {
            Step::Progress => progress = true,
            Step::Blocked => {
                // a sub-parser waiting for bytes that can never arrive:
                // the buffered partial can't complete after end of stream
                let waiting_on_write = matches!(
                    stage,
                    ReadStage::AwaitingContinueWrite | ReadStage::AwaitingUpgradeWrite
                );

                if conn.end_of_stream && !waiting_on_write {
                    kill(conn, "unexpected end of stream");
                    progress = true;

                    continue;
                }

                return progress;
            }
        }
    }
}

/// Scan result for one speculative line read.
enum Line {
    /// Terminator found: `end` is the line length (terminator excluded),
    /// `consumed` includes it.
    Done { end: usize, consumed: usize },
    Incomplete,
    TooLong,
}

/// Finds an LF in `buf[..n]`, honoring the lenient line policy: both CRLF
/// and bare LF terminate; a lone trailing CR means "wait for more".
fn scan_line(buf: &[u8], n: usize) -> Line {
    for i in 0..n {
        if buf[i] == b'\n' {
            let end = if i > 0 && buf[i - 1] == b'\r' { i - 1 } else { i };

            return Line::Done {
                end,
                consumed: i + 1,
            };
        }
    }

    if n == buf.len() {
        Line::TooLong
    } else {
        Line::Incomplete
    }
}

fn forbidden_header_byte(b: u8) -> bool {
    b <= 0x1f
        || b == 0x7f
        || matches!(
            b,
            b'<' | b'>' | b'#' | b'%' | b'"' | b'{' | b'}' | b'|' | b'\\' | b'^' | b'[' | b']'
        )
}

fn valid_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

/// Splits a comma-separated header value and checks for a token,
/// case-insensitively.
fn value_has_token(value: &[u8], token: &str) -> bool {
    value.split(|&b| b == b',').any(|part| {
        match str::from_utf8(part) {
            Ok(part) => part.trim().eq_ignore_ascii_case(token),
            Err(_) => false,
        }
    })
}

fn read_method(conn: &mut Connection) -> Step {
    let mut buf = [0u8; MAX_METHOD_LENGTH + 1];

    let n = match conn.recv(&mut buf) {
        Ok(0) => return kill(conn, "unexpected end of stream"),
        Ok(n) => n,
        Err(_) => return Step::Blocked,
    };

    for i in 0..n {
        match buf[i] {
            b' ' => {
                if i == 0 {
                    return kill(conn, "malformed request line");
                }

                conn.putback_read(n - (i + 1));

                if !buf[..i].iter().all(|&b| valid_token_byte(b)) {
                    return kill(conn, "malformed request line");
                }

                let method = str::from_utf8(&buf[..i]).expect("token bytes are ascii");

                let req = conn.requests.back_mut().expect("reading request exists");
                req.method = ArrayString::from(method).expect("bounded by read buffer");
                req.read_stage = ReadStage::PastMethod;

                return Step::Progress;
            }
            b'\r' | b'\n' => return kill(conn, "malformed request line"),
            _ => {}
        }
    }

    if n == buf.len() {
        return kill(conn, "method too long");
    }

    conn.putback_read(n);

    Step::Blocked
}

/// Consumes the run of spaces between request-line tokens, putting back
/// the first byte that is not a space.
fn skip_spaces(conn: &mut Connection, next: ReadStage) -> Step {
    loop {
        let mut b = [0u8; 1];

        match conn.recv(&mut b) {
            Ok(0) => return kill(conn, "unexpected end of stream"),
            Ok(_) => {
                if b[0] == b' ' {
                    continue;
                }

                conn.putback_read(1);

                conn.requests
                    .back_mut()
                    .expect("reading request exists")
                    .read_stage = next;

                return Step::Progress;
            }
            Err(_) => return Step::Blocked,
        }
    }
}

fn read_target(conn: &mut Connection) -> Step {
    let mut buf = [0u8; MAX_TARGET_LENGTH + 1];

    let n = match conn.recv(&mut buf) {
        Ok(0) => return kill(conn, "unexpected end of stream"),
        Ok(n) => n,
        Err(_) => return Step::Blocked,
    };

    for i in 0..n {
        match buf[i] {
            b' ' => {
                conn.putback_read(n - (i + 1));

                let target = match str::from_utf8(&buf[..i]) {
                    Ok(s) => s,
                    Err(_) => return kill(conn, "invalid request target"),
                };

                if let Err(reason) = apply_target(
                    conn.requests.back_mut().expect("reading request exists"),
                    target,
                ) {
                    return kill(conn, reason);
                }

                conn.requests
                    .back_mut()
                    .expect("reading request exists")
                    .read_stage = ReadStage::PastTarget;

                return Step::Progress;
            }
            b'\r' | b'\n' => return kill(conn, "malformed request line"),
            b if b <= 0x1f || b == 0x7f => return kill(conn, "forbidden character in target"),
            _ => {}
        }
    }

    if n == buf.len() {
        return kill(conn, "target too long");
    }

    conn.putback_read(n);

    Step::Blocked
}

/// Stores the request target. Origin-form passes through; absolute-form
/// must use the https scheme (plain http is rejected) and is rewritten in
/// place to origin-form, remembering its host for the end-of-headers
/// agreement check.
fn apply_target(req: &mut Request, target: &str) -> Result<(), &'static str> {
    if target.is_empty() {
        return Err("malformed request line");
    }

    if target.starts_with('/') {
        req.target = target.to_owned();

        return Ok(());
    }

    let url = Url::parse(target).map_err(|_| "invalid request target")?;

    match url.scheme() {
        "https" => {}
        "http" => return Err("plain http target rejected"),
        _ => return Err("unsupported target scheme"),
    }

    let host = url.host_str().ok_or("invalid request target")?;

    let mut authority = host.to_ascii_lowercase();
    if let Some(port) = url.port() {
        authority.push(':');
        authority.push_str(&port.to_string());
    }
    req.target_host = Some(authority);

    let mut origin = url.path().to_owned();
    if origin.is_empty() {
        origin.push('/');
    }
    if let Some(q) = url.query() {
        origin.push('?');
        origin.push_str(q);
    }
    req.target = origin;

    Ok(())
}

fn read_version(ctx: &ServerContext, conn: &mut Connection) -> Step {
    // "HTTP/1.1" + CRLF, plus one byte so an overlong line is detectable
    let mut buf = [0u8; MAX_VERSION_LENGTH + 3];

    let n = match conn.recv(&mut buf) {
        Ok(0) => return kill(conn, "unexpected end of stream"),
        Ok(n) => n,
        Err(_) => return Step::Blocked,
    };

    match scan_line(&buf, n) {
        Line::Done { end, consumed } => {
            conn.putback_read(n - consumed);

            if buf[..end] != b"HTTP/1.1"[..] {
                return kill(conn, "unsupported protocol version");
            }

            conn.requests
                .back_mut()
                .expect("reading request exists")
                .read_stage = ReadStage::ReadingField;

            dispatch_hooks(ctx, conn)
        }
        Line::TooLong => kill(conn, "malformed request line"),
        Line::Incomplete => {
            conn.putback_read(n);

            Step::Blocked
        }
    }
}

/// Runs the route hooks, once per request, as soon as the request line is
/// complete. The installed handler then receives the header events that
/// follow. When no hook claims the request, the built-in 404 handler is
/// installed so the client still gets a response.
fn dispatch_hooks(ctx: &ServerContext, conn: &mut Connection) -> Step {
    let decision = {
        let req = conn.requests.back().expect("reading request exists");

        ctx.route(&req.method, &req.target)
    };

    let req = conn.requests.back_mut().expect("reading request exists");

    match decision {
        RouteDecision::Accept(h) => {
            req.handler = Some(h);

            Step::Progress
        }
        RouteDecision::AcceptAndClose(h) => {
            req.handler = Some(h);
            req.close_requested = true;

            Step::Progress
        }
        RouteDecision::Close => kill(conn, "closed by route hook"),
        RouteDecision::Decline => {
            req.handler = Some(crate::handler::not_found_handler());

            Step::Progress
        }
    }
}

fn read_field(conn: &mut Connection) -> Step {
    let mut buf = [0u8; MAX_FIELD_LENGTH + 1];

    let n = match conn.recv(&mut buf) {
        Ok(0) => return kill(conn, "unexpected end of stream"),
        Ok(n) => n,
        Err(_) => return Step::Blocked,
    };

    match scan_line(&buf, n) {
        Line::Done { end, consumed } => {
            conn.putback_read(n - consumed);

            if end == 0 {
                return finish_headers(conn);
            }

            process_header_line(conn, &buf[..end])
        }
        Line::TooLong => kill(conn, "header line too long"),
        Line::Incomplete => {
            conn.putback_read(n);

            Step::Blocked
        }
    }
}

fn process_header_line(conn: &mut Connection, line: &[u8]) -> Step {
    if line.iter().any(|&b| forbidden_header_byte(b)) {
        return kill(conn, "forbidden character in header");
    }

    let colon = match line.iter().position(|&b| b == b':') {
        Some(p) if p > 0 => p,
        _ => return kill(conn, "malformed header line"),
    };

    let name = &line[..colon];

    if !name.iter().all(|&b| valid_token_byte(b)) {
        return kill(conn, "malformed header name");
    }

    let name = str::from_utf8(name).expect("token bytes are ascii");

    let mut value = &line[(colon + 1)..];
    while value.first() == Some(&b' ') {
        value = &value[1..];
    }

    interpret_header(conn, name, value)
}

fn utf8_value<'a>(
    conn: &mut Connection,
    value: &'a [u8],
) -> Result<&'a str, Step> {
    match str::from_utf8(value) {
        Ok(s) => Ok(s),
        Err(_) => Err(kill(conn, "malformed header value")),
    }
}

fn interpret_header(conn: &mut Connection, name: &str, value: &[u8]) -> Step {
    if name.eq_ignore_ascii_case("Content-Length") {
        let req = conn.requests.back_mut().expect("reading request exists");

        if req.framing.is_some() {
            return kill(conn, "conflicting body framing");
        }

        let len = match str::from_utf8(value).ok().and_then(|s| s.parse().ok()) {
            Some(len) => len,
            None => return kill(conn, "invalid content length"),
        };

        req.framing = Some(BodyFraming::ContentLength(len));
    } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
        let chunked = str::from_utf8(value)
            .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);

        if !chunked {
            return kill(conn, "unsupported transfer encoding");
        }

        let req = conn.requests.back_mut().expect("reading request exists");

        if req.framing.is_some() {
            return kill(conn, "conflicting body framing");
        }

        req.framing = Some(BodyFraming::Chunked);
    } else if name.eq_ignore_ascii_case("Host") {
        let host = match utf8_value(conn, value) {
            Ok(s) => s.to_owned(),
            Err(step) => return step,
        };

        let req = conn.requests.back_mut().expect("reading request exists");

        if req.host.is_some() {
            return kill(conn, "duplicate host header");
        }

        req.host = Some(host);
    } else if name.eq_ignore_ascii_case("Connection") {
        let req = conn.requests.back_mut().expect("reading request exists");

        if value_has_token(value, "close") {
            req.close_requested = true;
        }

        if value_has_token(value, "upgrade") {
            req.upgrade_requested = true;
        }
        // keep-alive is the HTTP/1.1 default; nothing to record
    } else if name.eq_ignore_ascii_case("Expect") {
        if value_has_token(value, "100-continue") {
            conn.requests
                .back_mut()
                .expect("reading request exists")
                .expect_100 = true;
        }
    } else if name.eq_ignore_ascii_case("Content-Type") {
        let ct = match utf8_value(conn, value) {
            Ok(s) => s.to_owned(),
            Err(step) => return step,
        };

        conn.requests
            .back_mut()
            .expect("reading request exists")
            .content_type = Some(ct);
    } else if name.eq_ignore_ascii_case("Upgrade") {
        if value_has_token(value, "websocket") {
            conn.requests
                .back_mut()
                .expect("reading request exists")
                .ws_upgrade = true;
        }
    } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
        let key = match utf8_value(conn, value) {
            Ok(s) => s.to_owned(),
            Err(step) => return step,
        };

        conn.requests
            .back_mut()
            .expect("reading request exists")
            .ws_key = Some(key);
    } else if name.eq_ignore_ascii_case("Sec-WebSocket-Version") {
        let version = str::from_utf8(value).ok().and_then(|s| s.trim().parse().ok());

        conn.requests
            .back_mut()
            .expect("reading request exists")
            .ws_version = version;
    } else {
        // unrecognized: forward to the active handler
        let mut handler = conn
            .requests
            .back_mut()
            .expect("reading request exists")
            .handler
            .take();

        if let Some(h) = &mut handler {
            h.header(name, value);
        }

        conn.requests
            .back_mut()
            .expect("reading request exists")
            .handler = handler;
    }

    Step::Progress
}

fn finish_headers(conn: &mut Connection) -> Step {
    // host reconciliation: origin-form requires a Host header;
    // absolute-form carries its own and the two must agree
    {
        let req = conn.requests.back_mut().expect("reading request exists");

        match (req.target_host.take(), &req.host) {
            (Some(th), Some(h)) => {
                if !th.eq_ignore_ascii_case(h) {
                    return kill(conn, "host mismatch");
                }
            }
            (Some(th), None) => req.host = Some(th),
            (None, Some(_)) => {}
            (None, None) => return kill(conn, "missing host header"),
        }
    }

    // the handler's accept decision
    {
        let mut handler = conn
            .requests
            .back_mut()
            .expect("reading request exists")
            .handler
            .take()
            .expect("handler installed at routing");

        let req = conn.requests.back_mut().expect("reading request exists");
        let accepted = handler.accept_request(req);
        req.handler = Some(handler);

        if !accepted {
            return kill(conn, "request declined by handler");
        }
    }

    // websocket upgrade
    let wants_upgrade = {
        let req = conn.requests.back().expect("reading request exists");

        req.upgrade_requested && req.ws_upgrade
    };

    if wants_upgrade {
        let req = conn.requests.back_mut().expect("reading request exists");

        let key_ok = req.ws_key.as_deref().map_or(false, |k| !k.is_empty());
        let version_ok = req.ws_version == Some(WEBSOCKET_VERSION);
        let body_ok = match req.framing {
            None | Some(BodyFraming::ContentLength(0)) => true,
            _ => false,
        };

        if !key_ok || !version_ok || !body_ok || req.method.as_str() != "GET" {
            return kill(conn, "bad websocket upgrade request");
        }

        let key = req.ws_key.as_deref().expect("checked above");

        let accept = match websocket::calculate_accept(key.as_bytes()) {
            Ok(accept) => accept,
            Err(()) => return kill(conn, "bad websocket upgrade request"),
        };

        req.ws_accept = Some(accept);
        req.read_stage = ReadStage::AwaitingUpgradeWrite;
        req.write_stage = WriteStage::WritingUpgrade;

        return Step::Progress;
    }

    let req = conn.requests.back_mut().expect("reading request exists");

    if req.expect_100 && req.framing.is_some() {
        req.read_stage = ReadStage::AwaitingContinueWrite;
        req.write_stage = WriteStage::WritingContinue;

        return Step::Progress;
    }

    req.write_stage = WriteStage::WritingResponse;

    begin_body(conn)
}

/// Enters the body-reading state that matches the framing headers, or
/// completes the body immediately when there is none.
pub(crate) fn begin_body(conn: &mut Connection) -> Step {
    let req = conn.requests.back_mut().expect("reading request exists");

    match req.framing {
        Some(BodyFraming::ContentLength(len)) if len > 0 => {
            req.content_len = len;
            req.read_stage = ReadStage::ReadingBody;
        }
        Some(BodyFraming::Chunked) => {
            req.read_stage = ReadStage::ReadingChunkSize;
        }
        _ => {
            req.read_stage = ReadStage::DoneReading;
            deliver_body(conn, &[]);
        }
    }

    Step::Progress
}

/// Forwards a body chunk to the handler; an empty chunk marks the end of
/// the body.
fn deliver_body(conn: &mut Connection, chunk: &[u8]) {
    let mut handler = conn
        .requests
        .back_mut()
        .expect("reading request exists")
        .handler
        .take();

    if let Some(h) = &mut handler {
        h.request_body(chunk);
    }

    conn.requests
        .back_mut()
        .expect("reading request exists")
        .handler = handler;
}

fn read_body(conn: &mut Connection) -> Step {
    let remaining = conn
        .requests
        .back()
        .expect("reading request exists")
        .content_len;

    let take = remaining.min(BODY_READ_MAX as u64) as usize;
    let mut buf = [0u8; BODY_READ_MAX];

    let n = match conn.recv(&mut buf[..take]) {
        Ok(0) => return kill(conn, "unexpected end of stream"),
        Ok(n) => n,
        Err(_) => return Step::Blocked,
    };

    {
        let req = conn.requests.back_mut().expect("reading request exists");
        req.content_len -= n as u64;
        req.total_content_len += n as u64;
    }

    deliver_body(conn, &buf[..n]);

    let req = conn.requests.back_mut().expect("reading request exists");

    if req.content_len == 0 {
        req.read_stage = ReadStage::DoneReading;
        deliver_body(conn, &[]);
    }

    Step::Progress
}

fn read_chunk_size(conn: &mut Connection) -> Step {
    let mut buf = [0u8; MAX_CHUNK_SIZE_LINE + 1];

    let n = match conn.recv(&mut buf) {
        Ok(0) => return kill(conn, "unexpected end of stream"),
        Ok(n) => n,
        Err(_) => return Step::Blocked,
    };

    match scan_line(&buf, n) {
        Line::Done { end, consumed } => {
            conn.putback_read(n - consumed);

            let line = &buf[..end];

            if line.is_empty() || !line.iter().all(|b| b.is_ascii_hexdigit()) {
                return kill(conn, "invalid chunk size");
            }

            let line = str::from_utf8(line).expect("hex digits are ascii");

            let size = match u64::from_str_radix(line, 16) {
                Ok(size) => size,
                Err(_) => return kill(conn, "invalid chunk size"),
            };

            let req = conn.requests.back_mut().expect("reading request exists");
            req.chunk_size = size;

            if size == 0 {
                req.read_stage = ReadStage::ReadingTrailer;
            } else {
                req.content_len = size;
                req.read_stage = ReadStage::ReadingChunkBody;
            }

            Step::Progress
        }
        Line::TooLong => kill(conn, "invalid chunk size"),
        Line::Incomplete => {
            conn.putback_read(n);

            Step::Blocked
        }
    }
}

fn read_chunk_body(conn: &mut Connection) -> Step {
    let remaining = conn
        .requests
        .back()
        .expect("reading request exists")
        .content_len;

    if remaining > 0 {
        let take = remaining.min(BODY_READ_MAX as u64) as usize;
        let mut buf = [0u8; BODY_READ_MAX];

        let n = match conn.recv(&mut buf[..take]) {
            Ok(0) => return kill(conn, "unexpected end of stream"),
            Ok(n) => n,
            Err(_) => return Step::Blocked,
        };

        {
            let req = conn.requests.back_mut().expect("reading request exists");
            req.content_len -= n as u64;
            req.total_content_len += n as u64;
        }

        deliver_body(conn, &buf[..n]);

        return Step::Progress;
    }

    // chunk payload done; a CRLF (or bare LF) terminator must follow
    let mut buf = [0u8; 2];

    let n = match conn.recv(&mut buf) {
        Ok(0) => return kill(conn, "unexpected end of stream"),
        Ok(n) => n,
        Err(_) => return Step::Blocked,
    };

    match buf[0] {
        b'\n' => {
            conn.putback_read(n - 1);
        }
        b'\r' => {
            if n < 2 {
                conn.putback_read(n);

                return Step::Blocked;
            }

            if buf[1] != b'\n' {
                return kill(conn, "invalid chunk terminator");
            }
        }
        _ => return kill(conn, "invalid chunk terminator"),
    }

    conn.requests
        .back_mut()
        .expect("reading request exists")
        .read_stage = ReadStage::ReadingChunkSize;

    Step::Progress
}

/// Trailer headers after the zero-size chunk reuse the header-line
/// grammar. They are forwarded to the handler; framing headers are not
/// re-interpreted here.
fn read_trailer(conn: &mut Connection) -> Step {
    let mut buf = [0u8; MAX_FIELD_LENGTH + 1];

    let n = match conn.recv(&mut buf) {
        Ok(0) => return kill(conn, "unexpected end of stream"),
        Ok(n) => n,
        Err(_) => return Step::Blocked,
    };

    match scan_line(&buf, n) {
        Line::Done { end, consumed } => {
            conn.putback_read(n - consumed);

            if end == 0 {
                conn.requests
                    .back_mut()
                    .expect("reading request exists")
                    .read_stage = ReadStage::DoneReading;

                deliver_body(conn, &[]);

                return Step::Progress;
            }

            let line = &buf[..end];

            if line.iter().any(|&b| forbidden_header_byte(b)) {
                return kill(conn, "forbidden character in header");
            }

            let colon = match line.iter().position(|&b| b == b':') {
                Some(p) if p > 0 => p,
                _ => return kill(conn, "malformed header line"),
            };

            let name = &line[..colon];

            if !name.iter().all(|&b| valid_token_byte(b)) {
                return kill(conn, "malformed header name");
            }

            let name = str::from_utf8(name).expect("token bytes are ascii").to_owned();

            let mut value = &line[(colon + 1)..];
            while value.first() == Some(&b' ') {
                value = &value[1..];
            }

            let mut handler = conn
                .requests
                .back_mut()
                .expect("reading request exists")
                .handler
                .take();

            if let Some(h) = &mut handler {
                h.header(&name, value);
            }

            conn.requests
                .back_mut()
                .expect("reading request exists")
                .handler = handler;

            Step::Progress
        }
        Line::TooLong => kill(conn, "header line too long"),
        Line::Incomplete => {
            conn.putback_read(n);

            Step::Blocked
        }
    }
}
