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

//! WebSocket framing (RFC 6455 subset): header encode/decode, masking,
//! inline control-frame handling, and incremental data-frame streaming
//! layered on the connection's byte primitives.

use crate::buffer::RingBuffer;
use crate::connection::Connection;
use crate::handler::Respond;
use crate::parser::{kill, Step};
use crate::request::Request;
use arrayvec::{ArrayString, ArrayVec};
use log::debug;
use sha1::{Digest, Sha1};
use std::str;
use std::str::FromStr;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// base64_encode(sha1_hash) = 28 bytes
pub const WS_ACCEPT_MAX: usize = 28;
const WS_HASH_INPUT_MAX: usize = 256;

// 1 byte flags + 9 bytes payload size + 4 bytes mask
pub const HEADER_SIZE_MAX: usize = 14;

pub const CONTROL_FRAME_PAYLOAD_MAX: usize = 125;
const CLOSE_REASON_MAX: usize = CONTROL_FRAME_PAYLOAD_MAX - 2;

const PSIZE_2BYTE: u64 = 126;
const PSIZE_8BYTE: u64 = 65536;

const DATA_READ_MAX: usize = 2048;

const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Continuation),
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            8 => Some(Self::Close),
            9 => Some(Self::Ping),
            10 => Some(Self::Pong),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0,
            Self::Text => 1,
            Self::Binary => 2,
            Self::Close => 8,
            Self::Ping => 9,
            Self::Pong => 10,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("reserved frame bits set")]
    ReservedBits,

    #[error("unknown frame opcode")]
    UnknownOpcode,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub header_len: usize,
    pub payload_len: u64,
}

pub fn header_size(payload_len: u64, masked: bool) -> usize {
    let size = if payload_len < PSIZE_2BYTE {
        2
    } else if payload_len < PSIZE_8BYTE {
        4
    } else {
        10
    };

    if masked {
        size + 4
    } else {
        size
    }
}

/// Decodes a frame header from the front of `buf`. `Ok(None)` means more
/// bytes are needed; any reserved bit or unassigned opcode is a protocol
/// error.
pub fn read_frame_header(buf: &[u8]) -> Result<Option<FrameInfo>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    if buf[0] & 0x70 != 0 {
        return Err(FrameError::ReservedBits);
    }

    let opcode = match Opcode::from_bits(buf[0] & 0x0f) {
        Some(opcode) => opcode,
        None => return Err(FrameError::UnknownOpcode),
    };

    let b1 = buf[1] & 0x7f;

    let (mut hsize, psize) = if u64::from(b1) < PSIZE_2BYTE {
        (2, u64::from(b1))
    } else if b1 == PSIZE_2BYTE as u8 {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut arr = [0; 2];
        arr.copy_from_slice(&buf[2..4]);
        (4, u64::from(u16::from_be_bytes(arr)))
    } else {
        if buf.len() < 10 {
            return Ok(None);
        }

        let mut arr = [0; 8];
        arr.copy_from_slice(&buf[2..10]);
        (10, u64::from_be_bytes(arr))
    };

    let mask = if buf[1] & 0x80 != 0 {
        if buf.len() < hsize + 4 {
            return Ok(None);
        }

        let mut mask = [0; 4];
        mask.copy_from_slice(&buf[hsize..(hsize + 4)]);
        hsize += 4;

        Some(mask)
    } else {
        None
    };

    Ok(Some(FrameInfo {
        fin: buf[0] & 0x80 != 0,
        opcode,
        mask,
        header_len: hsize,
        payload_len: psize,
    }))
}

/// Encodes a frame header into `buf`, which must hold `header_size`
/// bytes. Returns the header length.
pub fn write_frame_header(
    fin: bool,
    opcode: Opcode,
    payload_len: u64,
    mask: Option<[u8; 4]>,
    buf: &mut [u8],
) -> usize {
    let needed = header_size(payload_len, mask.is_some());
    assert!(buf.len() >= needed);

    let mut b0 = opcode.bits();
    if fin {
        b0 |= 0x80;
    }
    buf[0] = b0;

    let hsize = if payload_len < PSIZE_2BYTE {
        buf[1] = payload_len as u8;
        2
    } else if payload_len < PSIZE_8BYTE {
        buf[1] = PSIZE_2BYTE as u8;
        buf[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        4
    } else {
        buf[1] = 0x7f;
        buf[2..10].copy_from_slice(&payload_len.to_be_bytes());
        10
    };

    if let Some(mask) = mask {
        buf[1] |= 0x80;
        buf[hsize..(hsize + 4)].copy_from_slice(&mask);

        hsize + 4
    } else {
        hsize
    }
}

pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, c) in buf.iter_mut().enumerate() {
        *c ^= mask[(offset + i) % 4];
    }
}

/// The accept value sent back in the 101 response:
/// base64(SHA-1(nonce ++ RFC 6455 GUID)). The server does not verify
/// anything beyond well-formedness; the client is the checking side.
pub fn calculate_accept(key: &[u8]) -> Result<ArrayString<WS_ACCEPT_MAX>, ()> {
    let input_len = key.len() + WS_GUID.len();

    if input_len > WS_HASH_INPUT_MAX {
        return Err(());
    }

    let mut input = [0; WS_HASH_INPUT_MAX];

    input[..key.len()].copy_from_slice(key);
    input[key.len()..input_len].copy_from_slice(WS_GUID.as_bytes());

    let mut hasher = Sha1::new();
    hasher.update(&input[..input_len]);
    let digest = hasher.finalize();

    let mut output = [0; WS_ACCEPT_MAX];

    let size = base64::encode_config_slice(&digest, base64::STANDARD, &mut output);

    let output = match str::from_utf8(&output[..size]) {
        Ok(s) => s,
        Err(_) => return Err(()),
    };

    Ok(ArrayString::from_str(output).map_err(|_| ())?)
}

/// Per-connection websocket state, owned by the upgraded request's
/// handler-state slot.
pub struct WsSession {
    frame: Option<FrameInfo>,
    frame_read: u64,
    // data message in progress; continuation frames inherit its opcode
    message_opcode: Option<Opcode>,
    pending_pong: Option<ArrayVec<u8, CONTROL_FRAME_PAYLOAD_MAX>>,
    last_ping: Option<ArrayVec<u8, CONTROL_FRAME_PAYLOAD_MAX>>,
    close_recv: Option<u16>,
    close_send: Option<(u16, ArrayVec<u8, CLOSE_REASON_MAX>)>,
    close_sent: bool,
}

impl WsSession {
    pub(crate) fn new() -> Self {
        Self {
            frame: None,
            frame_read: 0,
            message_opcode: None,
            pending_pong: None,
            last_ping: None,
            close_recv: None,
            close_send: None,
            close_sent: false,
        }
    }
}

fn session_mut(req: &mut Request) -> &mut WsSession {
    req.ws.as_mut().expect("websocket session exists")
}

/// Encodes a complete unmasked frame into the output ring, all or
/// nothing. Control payloads are bounded; callers fragment data messages
/// into ring-sized frames with `fin: false` continuations.
fn send_frame_atomic(out: &mut RingBuffer, opcode: Opcode, payload: &[u8], fin: bool) -> bool {
    assert!(
        !opcode.is_control() || (payload.len() <= CONTROL_FRAME_PAYLOAD_MAX && fin),
        "control frames are small and unfragmented"
    );

    let mut header = [0u8; HEADER_SIZE_MAX];
    let header_len = write_frame_header(fin, opcode, payload.len() as u64, None, &mut header);

    if out.write_avail() < header_len + payload.len() {
        return false;
    }

    let n = out.write(&header[..header_len]);
    debug_assert_eq!(n, header_len);
    let n = out.write(payload);
    debug_assert_eq!(n, payload.len());

    true
}

fn deliver_ws_data(conn: &mut Connection, opcode: Opcode, chunk: &[u8], fin: bool) {
    let mut handler = conn
        .requests
        .back_mut()
        .expect("websocket request exists")
        .handler
        .take();

    if let Some(h) = &mut handler {
        h.ws_data(opcode, chunk, fin);
    }

    conn.requests
        .back_mut()
        .expect("websocket request exists")
        .handler = handler;
}

fn deliver_ws_closing(conn: &mut Connection, code: u16, reason: &[u8]) {
    let mut handler = conn
        .requests
        .back_mut()
        .expect("websocket request exists")
        .handler
        .take();

    if let Some(h) = &mut handler {
        h.ws_closing(code, reason);
    }

    conn.requests
        .back_mut()
        .expect("websocket request exists")
        .handler = handler;
}

/// One read step: decode a frame header, or consume (part of) the current
/// frame's payload. Control frames are buffered whole and handled inline;
/// data frames stream to the handler chunk by chunk.
pub(crate) fn drive_read(conn: &mut Connection) -> Step {
    let have_frame = session_mut(conn.requests.back_mut().expect("websocket request exists"))
        .frame
        .is_some();

    if !have_frame {
        let mut buf = [0u8; HEADER_SIZE_MAX];

        let n = match conn.recv(&mut buf) {
            Ok(0) => return kill(conn, "unexpected end of stream"),
            Ok(n) => n,
            Err(_) => return Step::Blocked,
        };

        let fi = match read_frame_header(&buf[..n]) {
            Ok(Some(fi)) => fi,
            Ok(None) => {
                conn.putback_read(n);

                return Step::Blocked;
            }
            Err(FrameError::ReservedBits) => return kill(conn, "reserved frame bits set"),
            Err(FrameError::UnknownOpcode) => return kill(conn, "unknown frame opcode"),
        };

        conn.putback_read(n - fi.header_len);

        if fi.opcode.is_control()
            && (fi.payload_len > CONTROL_FRAME_PAYLOAD_MAX as u64 || !fi.fin)
        {
            return kill(conn, "invalid control frame");
        }

        let session = session_mut(conn.requests.back_mut().expect("websocket request exists"));

        if !fi.opcode.is_control() {
            match (session.message_opcode, fi.opcode) {
                (None, Opcode::Continuation) => {
                    return kill(conn, "unexpected continuation frame")
                }
                (Some(_), Opcode::Text) | (Some(_), Opcode::Binary) => {
                    return kill(conn, "unexpected data frame")
                }
                _ => {}
            }
        }

        session.frame = Some(fi);
        session.frame_read = 0;

        return Step::Progress;
    }

    let fi = session_mut(conn.requests.back_mut().expect("websocket request exists"))
        .frame
        .expect("checked above");

    if fi.opcode.is_control() {
        read_control_frame(conn, fi)
    } else {
        read_data_frame(conn, fi)
    }
}

/// Control frames are fully buffered (bounded by the RFC's 125 bytes)
/// and handled inline.
fn read_control_frame(conn: &mut Connection, fi: FrameInfo) -> Step {
    let len = fi.payload_len as usize;
    let mut buf = [0u8; CONTROL_FRAME_PAYLOAD_MAX];

    if len > 0 {
        let n = match conn.recv(&mut buf[..len]) {
            Ok(0) => return kill(conn, "unexpected end of stream"),
            Ok(n) => n,
            Err(_) => return Step::Blocked,
        };

        if n < len {
            conn.putback_read(n);

            return Step::Blocked;
        }

        if let Some(mask) = fi.mask {
            apply_mask(&mut buf[..len], mask, 0);
        }
    }

    session_mut(conn.requests.back_mut().expect("websocket request exists")).frame = None;

    match fi.opcode {
        Opcode::Close => {
            let code = if len >= 2 {
                u16::from_be_bytes([buf[0], buf[1]])
            } else {
                CLOSE_NORMAL
            };
            let reason_start = len.min(2);

            debug!("conn {}: peer close, code {}", conn.id, code);

            deliver_ws_closing(conn, code, &buf[reason_start..len]);

            let both_closed = {
                let session =
                    session_mut(conn.requests.back_mut().expect("websocket request exists"));
                session.close_recv = Some(code);

                if session.close_sent {
                    true
                } else {
                    if session.close_send.is_none() {
                        // arm the close response echo
                        let mut reason = ArrayVec::new();
                        reason
                            .try_extend_from_slice(&buf[reason_start..len])
                            .expect("bounded by control payload max");
                        session.close_send = Some((code, reason));
                    }

                    false
                }
            };

            if both_closed {
                conn.complete();
            }
        }
        Opcode::Ping => {
            let mut payload = ArrayVec::new();
            payload
                .try_extend_from_slice(&buf[..len])
                .expect("bounded by control payload max");

            session_mut(conn.requests.back_mut().expect("websocket request exists"))
                .pending_pong = Some(payload);
        }
        Opcode::Pong => {
            let session =
                session_mut(conn.requests.back_mut().expect("websocket request exists"));

            match session.last_ping.take() {
                Some(sent) => {
                    if sent.as_slice() != &buf[..len] {
                        return kill(conn, "pong payload mismatch");
                    }
                }
                // unsolicited pong: permitted, ignored
                None => {}
            }
        }
        _ => unreachable!("data opcodes handled elsewhere"),
    }

    Step::Progress
}

/// Data frames are never fully buffered: each chunk is unmasked with the
/// running payload offset and streamed to the handler, so arbitrarily
/// large messages flow through the fixed rings.
fn read_data_frame(conn: &mut Connection, fi: FrameInfo) -> Step {
    let opcode = {
        let session = session_mut(conn.requests.back_mut().expect("websocket request exists"));

        match fi.opcode {
            Opcode::Continuation => session.message_opcode.expect("validated at frame start"),
            opcode => {
                session.message_opcode = Some(opcode);

                opcode
            }
        }
    };

    let frame_read = session_mut(conn.requests.back_mut().expect("websocket request exists"))
        .frame_read;
    let remaining = fi.payload_len - frame_read;

    if remaining > 0 {
        let take = remaining.min(DATA_READ_MAX as u64) as usize;
        let mut buf = [0u8; DATA_READ_MAX];

        let n = match conn.recv(&mut buf[..take]) {
            Ok(0) => return kill(conn, "unexpected end of stream"),
            Ok(n) => n,
            Err(_) => return Step::Blocked,
        };

        if let Some(mask) = fi.mask {
            apply_mask(&mut buf[..n], mask, frame_read as usize);
        }

        let frame_done = frame_read + n as u64 == fi.payload_len;

        session_mut(conn.requests.back_mut().expect("websocket request exists")).frame_read +=
            n as u64;

        deliver_ws_data(conn, opcode, &buf[..n], fi.fin && frame_done);
    } else {
        // zero-length frame: still observable by the handler
        deliver_ws_data(conn, opcode, &[], fi.fin);
    }

    let session = session_mut(conn.requests.back_mut().expect("websocket request exists"));

    if session.frame_read == fi.payload_len {
        session.frame = None;
        session.message_opcode = if fi.fin { None } else { Some(opcode) };
    }

    Step::Progress
}

/// Handler-facing frame writer for the websocket phase.
pub struct WsResponder<'a> {
    out: &'a mut RingBuffer,
    session: &'a mut WsSession,
}

impl<'a> WsResponder<'a> {
    /// Emits a complete frame, all or nothing. Returns false when the
    /// output ring cannot hold it right now. Large messages are sent as
    /// ring-sized fragments: `fin: false` frames followed by
    /// continuations.
    pub fn send_frame(&mut self, opcode: Opcode, payload: &[u8], fin: bool) -> bool {
        send_frame_atomic(self.out, opcode, payload, fin)
    }

    pub fn send_text(&mut self, text: &str, fin: bool) -> bool {
        self.send_frame(Opcode::Text, text.as_bytes(), fin)
    }

    pub fn send_binary(&mut self, data: &[u8], fin: bool) -> bool {
        self.send_frame(Opcode::Binary, data, fin)
    }

    pub fn send_continuation(&mut self, data: &[u8], fin: bool) -> bool {
        self.send_frame(Opcode::Continuation, data, fin)
    }

    /// Sends a ping and records its payload; the next pong must echo it.
    pub fn ping(&mut self, payload: &[u8]) -> bool {
        if !self.send_frame(Opcode::Ping, payload, true) {
            return false;
        }

        let mut sent = ArrayVec::new();
        sent.try_extend_from_slice(payload)
            .expect("bounded by control payload max");
        self.session.last_ping = Some(sent);

        true
    }

    /// Arms an outgoing close frame; the engine sends it on the next
    /// write pass and completes the connection once the peer answers.
    pub fn close(&mut self, code: u16, reason: &[u8]) {
        if self.session.close_send.is_none() && !self.session.close_sent {
            let mut r = ArrayVec::new();
            let take = reason.len().min(CLOSE_REASON_MAX);
            r.try_extend_from_slice(&reason[..take])
                .expect("bounded by close reason max");

            self.session.close_send = Some((code, r));
        }
    }
}

enum WriteAction {
    Pong,
    Close,
    Idle,
    Handler,
}

/// One write step of the websocket phase: queued pong first, then any
/// armed close frame, then the handler's own production.
pub(crate) fn drive_write(conn: &mut Connection) -> Step {
    let action = {
        let session = session_mut(conn.requests.front_mut().expect("websocket request exists"));

        if session.pending_pong.is_some() {
            WriteAction::Pong
        } else if session.close_send.is_some() {
            WriteAction::Close
        } else if session.close_sent {
            // close handshake in flight; nothing more to produce
            WriteAction::Idle
        } else {
            WriteAction::Handler
        }
    };

    match action {
        WriteAction::Pong => {
            let requests = &mut conn.requests;
            let output = &mut conn.output;

            let session = session_mut(requests.front_mut().expect("websocket request exists"));
            let pong = session.pending_pong.take().expect("checked above");

            if !send_frame_atomic(output, Opcode::Pong, &pong, true) {
                session.pending_pong = Some(pong);

                return Step::Blocked;
            }

            Step::Progress
        }
        WriteAction::Close => {
            let sent = {
                let requests = &mut conn.requests;
                let output = &mut conn.output;

                let session =
                    session_mut(requests.front_mut().expect("websocket request exists"));
                let (code, reason) = session.close_send.take().expect("checked above");

                let mut payload = [0u8; CONTROL_FRAME_PAYLOAD_MAX];
                payload[..2].copy_from_slice(&code.to_be_bytes());
                payload[2..(2 + reason.len())].copy_from_slice(&reason);

                if send_frame_atomic(output, Opcode::Close, &payload[..(2 + reason.len())], true)
                {
                    session.close_sent = true;

                    true
                } else {
                    session.close_send = Some((code, reason));

                    false
                }
            };

            if !sent {
                return Step::Blocked;
            }

            let both_closed = conn
                .requests
                .front()
                .expect("websocket request exists")
                .ws
                .as_ref()
                .expect("websocket session exists")
                .close_recv
                .is_some();

            if both_closed {
                conn.complete();
            }

            Step::Progress
        }
        WriteAction::Idle => Step::Blocked,
        WriteAction::Handler => {
            let requests = &mut conn.requests;
            let output = &mut conn.output;

            let req = requests.front_mut().expect("websocket request exists");
            let mut handler = req.handler.take().expect("handler installed at routing");

            let result = {
                let mut responder = WsResponder {
                    out: output,
                    session: req.ws.as_mut().expect("websocket session exists"),
                };

                handler.ws_respond(&mut responder)
            };

            req.handler = Some(handler);

            match result {
                Respond::Continue => Step::Progress,
                Respond::Choked => Step::Blocked,
                Respond::Finished => {
                    let session = req.ws.as_mut().expect("websocket session exists");

                    if session.close_send.is_none() && !session.close_sent {
                        session.close_send = Some((CLOSE_NORMAL, ArrayVec::new()));
                    }

                    Step::Progress
                }
            }
        }
    }
}
