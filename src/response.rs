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

//! Response production: the write state machine and the chunked-encoding
//! sub-machine.

use crate::buffer::{BufferError, RingBuffer};
use crate::connection::{Connection, Stage};
use crate::handler::Respond;
use crate::parser::{self, Step};
use crate::request::{ReadStage, WriteStage};
use crate::websocket::{self, WsSession};
use log::debug;
use std::io;
use std::io::Write;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Drives the write state machine for the front request until it can make
/// no further progress. Returns true if anything advanced.
pub fn drive_write(conn: &mut Connection) -> bool {
    let mut progress = false;

    loop {
        if conn.stage != Stage::Secured || conn.should_destroy {
            return progress;
        }

        let front_stage = match conn.requests.front() {
            Some(r) => r.write_stage,
            None => return progress,
        };

        let step = match front_stage {
            WriteStage::WriteAwaitingAccept => Step::Blocked,
            WriteStage::WritingContinue => write_continue(conn),
            WriteStage::WritingUpgrade => write_upgrade(conn),
            WriteStage::WritingResponse => match invoke_handler(conn) {
                Respond::Continue => {
                    // yield so the driver can flush before the next
                    // production pass
                    return true;
                }
                Respond::Finished => {
                    conn.requests
                        .front_mut()
                        .expect("front request exists")
                        .write_stage = WriteStage::DoneWriting;

                    Step::Progress
                }
                Respond::Choked => Step::Blocked,
            },
            WriteStage::WritingWebSocketResponse => websocket::drive_write(conn),
            WriteStage::DoneWriting => recycle(conn),
        };

        match step {
            Step::Progress => progress = true,
            Step::Blocked => return progress,
        }
    }
}

/// Emits the interim 100 Continue, atomically, then resumes body reading.
fn write_continue(conn: &mut Connection) -> Step {
    if !conn.send_all_or_none(CONTINUE_RESPONSE) {
        return Step::Blocked;
    }

    let req = conn.requests.front_mut().expect("front request exists");
    req.write_stage = WriteStage::WritingResponse;

    // a request paused on 100-continue is still the one being read, so
    // the read side resumes on the queue tail
    debug_assert_eq!(
        conn.requests.back().expect("request exists").read_stage,
        ReadStage::AwaitingContinueWrite
    );

    parser::begin_body(conn);

    Step::Progress
}

/// Emits the 101 upgrade response, atomically, then hands both sides of
/// the request over to the websocket codec.
fn write_upgrade(conn: &mut Connection) -> Step {
    let accept = *conn
        .requests
        .front()
        .expect("front request exists")
        .ws_accept
        .as_ref()
        .expect("upgrade requests carry an accept key");

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept
    );

    if !conn.send_all_or_none(response.as_bytes()) {
        return Step::Blocked;
    }

    let req = conn.requests.front_mut().expect("front request exists");
    req.write_stage = WriteStage::WritingWebSocketResponse;
    req.read_stage = ReadStage::Websocket;
    req.ws = Some(WsSession::new());

    debug!("conn {}: request {} upgraded to websocket", conn.id, req.id);

    Step::Progress
}

/// One `Respond` pass of the front request's handler.
fn invoke_handler(conn: &mut Connection) -> Respond {
    let Connection {
        requests, output, ..
    } = conn;

    let req = requests.front_mut().expect("front request exists");

    let mut handler = req
        .handler
        .take()
        .expect("handler installed at routing");

    let result = {
        let mut responder = Responder {
            out: output,
            close_requested: &mut req.close_requested,
        };

        handler.respond(&mut responder)
    };

    req.handler = Some(handler);

    result
}

/// Destroys the front request once it is fully written, read, and
/// flushed, recycling the connection to the next pipelined request.
fn recycle(conn: &mut Connection) -> Step {
    {
        let req = conn.requests.front().expect("front request exists");

        if req.read_stage != ReadStage::DoneReading {
            return Step::Blocked;
        }
    }

    if conn.has_unflushed_output() {
        return Step::Blocked;
    }

    let req = conn.requests.pop_front().expect("front request exists");

    debug!("conn {}: request {} finished", conn.id, req.id);

    let close = req.close_requested || conn.close_after_done;

    // dropping the request drops the handler, freeing handler-owned state
    drop(req);

    if close {
        conn.complete();
    }

    Step::Progress
}

/// Outcome of one chunk emission attempt.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ChunkWrite {
    /// This many payload bytes were framed into the output ring.
    Wrote(usize),

    /// The output ring cannot hold a chunk even after compaction.
    Choked,
}

/// Handler-facing view of the connection's output ring.
pub struct Responder<'a> {
    pub(crate) out: &'a mut RingBuffer,
    pub(crate) close_requested: &'a mut bool,
}

impl<'a> Responder<'a> {
    #[cfg(test)]
    pub(crate) fn over(out: &'a mut RingBuffer, close_requested: &'a mut bool) -> Self {
        Self {
            out,
            close_requested,
        }
    }

    /// Asks the engine to close the connection once this response has
    /// been flushed, e.g. when the response body is delimited by the
    /// connection closing.
    pub fn close_after_response(&mut self) {
        *self.close_requested = true;
    }

    /// Buffers bytes, possibly partially. Returns the count accepted.
    pub fn write(&mut self, src: &[u8]) -> usize {
        self.out.write(src)
    }

    pub fn write_avail(&self) -> usize {
        self.out.write_avail()
    }

    /// Buffers all of `bytes` or none of them, for pieces that must never
    /// be partially committed (status lines, chunk trailers).
    pub fn write_all_or_none(&mut self, bytes: &[u8]) -> bool {
        let n = self.out.write(bytes);

        if n < bytes.len() {
            self.out.putback_write(n);

            return false;
        }

        true
    }

    /// Frames one chunk from the staging ring into the output ring:
    /// `<hex-size>\r\n<payload>\r\n`, where the hex field width and the
    /// payload length are chosen together by `measure_chunk` so they
    /// always agree. When the only contiguous free run is too small for
    /// any chunk, the ring is compacted once and the attempt retried;
    /// continued insufficiency reports downstream-choked.
    pub fn write_chunk(&mut self, staging: &mut RingBuffer) -> ChunkWrite {
        let pending = staging.len();

        if pending == 0 {
            return ChunkWrite::Wrote(0);
        }

        {
            let slot = self.out.write_slot();
            let len = slot.len();
            self.out.putback_write(len);

            if len < MIN_CHUNK_SLOT {
                self.out.simplify();
            }
        }

        let slot = self.out.write_slot();
        let slot_len = slot.len();

        let (prefix_len, payload) = match measure_chunk(slot_len, pending) {
            Some(m) => m,
            None => {
                self.out.putback_write(slot_len);

                return ChunkWrite::Choked;
            }
        };

        {
            let mut c = io::Cursor::new(&mut slot[..prefix_len]);
            write!(&mut c, "{:x}\r\n", payload).expect("prefix fits measured width");
            assert_eq!(c.position() as usize, prefix_len);
        }

        let copied = staging.read(&mut slot[prefix_len..(prefix_len + payload)]);
        assert_eq!(copied, payload);

        slot[(prefix_len + payload)..(prefix_len + payload + 2)].copy_from_slice(b"\r\n");

        let used = prefix_len + payload + 2;

        self.out.putback_write(slot_len - used);

        ChunkWrite::Wrote(payload)
    }

    /// Emits the terminal `0\r\n\r\n` chunk, all or nothing.
    pub fn write_final_chunk(&mut self) -> bool {
        self.write_all_or_none(FINAL_CHUNK)
    }
}

// smallest workable chunk frame: 1 hex digit + CRLF + 1 payload byte + CRLF
const MIN_CHUNK_SLOT: usize = 6;

// candidate prefix widths (hex digits + CRLF) and the largest payload
// each can describe; 4-digit sizes have no width here, so payloads cap at
// 0xfff until a 5-digit chunk is possible
const CHUNK_WIDTHS: [(usize, usize); 4] = [(7, 0xfffff), (5, 0xfff), (4, 0xff), (3, 0xf)];

fn hex_width(n: usize) -> usize {
    let mut width = 1;
    let mut n = n >> 4;

    while n > 0 {
        width += 1;
        n >>= 4;
    }

    width
}

/// Picks the chunk prefix width and payload length for a contiguous slot.
///
/// The prefix width must match the number of hex digits of the payload
/// length, but the payload length depends on how much of the slot the
/// prefix leaves. Starting from the widest prefix, each candidate is
/// checked for self-consistency, shrinking toward narrower widths until
/// the two agree. Returns None when the slot cannot hold any chunk.
fn measure_chunk(slot_len: usize, pending: usize) -> Option<(usize, usize)> {
    for &(prefix, max_payload) in CHUNK_WIDTHS.iter() {
        // prefix + at least one payload byte + trailing CRLF
        if slot_len < prefix + 1 + 2 {
            continue;
        }

        let payload = pending.min(max_payload).min(slot_len - prefix - 2);

        if payload == 0 {
            continue;
        }

        if hex_width(payload) + 2 == prefix {
            return Some((prefix, payload));
        }
    }

    None
}

/// Content generator behind a chunked response. `generate` appends
/// whatever it can to the staging ring and returns true once no more
/// content will ever be produced.
pub trait PageSource {
    fn generate(&mut self, staging: &mut RingBuffer) -> bool;
}

impl<F> PageSource for F
where
    F: FnMut(&mut RingBuffer) -> bool,
{
    fn generate(&mut self, staging: &mut RingBuffer) -> bool {
        self(staging)
    }
}

/// Emission progress of a chunked response.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ChunkStage {
    // fill the staging ring for the first time
    // next: Header
    Generate,

    // the response preamble, written atomically
    // next: Respond
    Header,

    // alternate generating content and framing chunks
    // next: Trailer
    Respond,

    // the terminal zero-size chunk
    // next: Done
    Trailer,

    Done,
}

/// Streams a generated page as a chunked response: a handler building
/// block pairing a content source with a staging ring and the emission
/// state machine.
pub struct ChunkedResponse<S> {
    source: S,
    staging: RingBuffer,
    stage: ChunkStage,
    source_done: bool,
    content_type: String,
}

impl<S: PageSource> ChunkedResponse<S> {
    pub fn new(
        source: S,
        content_type: &str,
        staging_capacity: usize,
    ) -> Result<Self, BufferError> {
        Ok(Self {
            source,
            staging: RingBuffer::new(staging_capacity)?,
            stage: ChunkStage::Generate,
            source_done: false,
            content_type: content_type.to_owned(),
        })
    }

    pub fn stage(&self) -> ChunkStage {
        self.stage
    }

    fn drive(&mut self, out: &mut Responder) -> Respond {
        loop {
            match self.stage {
                ChunkStage::Generate => {
                    self.source_done = self.source.generate(&mut self.staging);
                    self.stage = ChunkStage::Header;
                }
                ChunkStage::Header => {
                    let preamble = format!(
                        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Type: {}\r\n\r\n",
                        self.content_type
                    );

                    if !out.write_all_or_none(preamble.as_bytes()) {
                        return Respond::Choked;
                    }

                    self.stage = ChunkStage::Respond;

                    return Respond::Continue;
                }
                ChunkStage::Respond => {
                    if self.staging.is_empty() {
                        if self.source_done {
                            self.stage = ChunkStage::Trailer;
                            continue;
                        }

                        self.source_done = self.source.generate(&mut self.staging);

                        if self.staging.is_empty() {
                            if self.source_done {
                                self.stage = ChunkStage::Trailer;
                                continue;
                            }

                            // source has nothing yet: upstream-choked
                            return Respond::Choked;
                        }
                    }

                    match out.write_chunk(&mut self.staging) {
                        ChunkWrite::Wrote(_) => return Respond::Continue,
                        ChunkWrite::Choked => return Respond::Choked,
                    }
                }
                ChunkStage::Trailer => {
                    if !out.write_final_chunk() {
                        return Respond::Choked;
                    }

                    self.stage = ChunkStage::Done;

                    return Respond::Finished;
                }
                ChunkStage::Done => return Respond::Finished,
            }
        }
    }
}

impl<S: PageSource> crate::handler::Handler for ChunkedResponse<S> {
    fn respond(&mut self, out: &mut Responder) -> Respond {
        self.drive(out)
    }
}
