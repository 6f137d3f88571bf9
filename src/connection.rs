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

use crate::buffer::{BufferError, RingBuffer};
use crate::request::Request;
use crate::transport::{Transport, TransportError};
use log::{debug, warn};
use std::cmp;
use std::collections::VecDeque;
use std::time::Instant;

/// Connection lifecycle. A backend connection's connect completion is
/// folded into `Secured` (its `accept_step` covers it the way the TLS
/// handshake does for inbound connections).
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Stage {
    // transport handshake not finished
    // next: Secured, Complete
    Accepted,

    // traffic flows
    // next: Complete
    Secured,

    // orderly shutdown; drivers only flush and run shutdown steps
    Complete,
}

/// One client (or backend) connection: two owned rings, a transport, and
/// the FIFO of in-flight requests. All reads the parser performs and all
/// bytes the writer produces go through here, so partial I/O and
/// put-back are handled in exactly one place.
pub struct Connection {
    pub(crate) id: u64,
    pub(crate) stage: Stage,
    pub(crate) input: RingBuffer,
    pub(crate) output: RingBuffer,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) requests: VecDeque<Request>,
    pub(crate) wants_read: bool,
    pub(crate) wants_write: bool,
    pub(crate) should_destroy: bool,
    pub(crate) close_after_done: bool,
    pub(crate) end_of_stream: bool,
    pub(crate) last_activity: Instant,
}

impl Connection {
    /// Ids come from the server context's counter for accepted
    /// connections; backend connections reuse their owning request's id.
    pub fn new(
        id: u64,
        transport: Box<dyn Transport>,
        ring_capacity: usize,
    ) -> Result<Self, BufferError> {
        Ok(Self {
            id,
            stage: Stage::Accepted,
            input: RingBuffer::new(ring_capacity)?,
            output: RingBuffer::new(ring_capacity)?,
            transport,
            requests: VecDeque::new(),
            wants_read: false,
            wants_write: false,
            should_destroy: false,
            close_after_done: false,
            end_of_stream: false,
            last_activity: Instant::now(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn wants_read(&self) -> bool {
        self.wants_read
    }

    pub fn wants_write(&self) -> bool {
        self.wants_write
    }

    pub fn should_destroy(&self) -> bool {
        self.should_destroy
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn requests_in_process(&self) -> usize {
        self.requests.len()
    }

    /// Forces the connection into orderly shutdown. Further driver passes
    /// flush what is buffered and retry the transport shutdown until it
    /// completes.
    pub fn complete(&mut self) {
        self.stage = Stage::Complete;
    }

    /// Asks for orderly shutdown once the current request queue drains,
    /// e.g. when the server is winding down.
    pub fn set_close_after_done(&mut self) {
        self.close_after_done = true;
    }

    pub(crate) fn reset_wants(&mut self) {
        self.wants_read = false;
        self.wants_write = false;
    }

    /// Drives the transport handshake. Returns true when progress was
    /// made (the connection became `Secured`).
    pub fn drive_accept(&mut self) -> bool {
        assert_eq!(self.stage, Stage::Accepted);

        match self.transport.accept_step() {
            Ok(true) => {
                debug!("conn {}: {} transport ready", self.id, self.transport.describe());
                self.stage = Stage::Secured;

                true
            }
            Ok(false) => false,
            Err(TransportError::WantRead) => {
                self.wants_read = true;

                false
            }
            Err(TransportError::WantWrite) => {
                self.wants_write = true;

                false
            }
            Err(e) => {
                warn!("conn {}: handshake failed: {}", self.id, e);
                self.should_destroy = true;

                false
            }
        }
    }

    /// Retries graceful transport shutdown. Returns true when done.
    pub fn drive_shutdown(&mut self) -> bool {
        match self.transport.shutdown_step() {
            Ok(done) => done,
            Err(TransportError::WantRead) => {
                self.wants_read = true;

                false
            }
            Err(TransportError::WantWrite) => {
                self.wants_write = true;

                false
            }
            Err(e) => {
                debug!("conn {}: shutdown failed: {}", self.id, e);

                true
            }
        }
    }

    /// Delivers up to `sink.len()` bytes, draining the input ring first
    /// and refilling it from the transport when it runs short. `Ok(0)`
    /// (for a nonempty sink) means end of stream; `Err(WantRead)` means
    /// nothing could be produced right now.
    ///
    /// Bytes delivered by one call are protected from overwrite until the
    /// next call, so the caller may put them back in full; a caller that
    /// needs to retry later must put back before returning to the driver.
    pub fn recv(&mut self, sink: &mut [u8]) -> Result<usize, TransportError> {
        if sink.is_empty() {
            return Ok(0);
        }

        let mut copied = self.input.read(sink);

        if copied < sink.len() && !self.end_of_stream {
            self.refill(copied)?;
            copied += self.input.read(&mut sink[copied..]);
        }

        if copied == 0 {
            if self.end_of_stream {
                return Ok(0);
            }

            return Err(TransportError::WantRead);
        }

        self.last_activity = Instant::now();

        Ok(copied)
    }

    /// Pulls bytes from the transport into the input ring through
    /// pre-advanced write slots, committing only what was actually read.
    /// `reserved` bytes just delivered to the caller are kept safe from
    /// overwrite so they remain put-back-able.
    fn refill(&mut self, reserved: usize) -> Result<(), TransportError> {
        loop {
            let capacity = self.input.capacity();

            if self.input.len() + reserved >= capacity {
                break;
            }

            let allowed = capacity - self.input.len() - reserved;

            let slot = self.input.write_slot();
            let slot_len = slot.len();

            if slot_len == 0 {
                break;
            }

            let take = cmp::min(slot_len, allowed);

            match self.transport.read(&mut slot[..take]) {
                Ok(0) => {
                    self.input.putback_write(slot_len);
                    debug!("conn {}: end of stream", self.id);
                    self.end_of_stream = true;

                    break;
                }
                Ok(n) => {
                    self.input.putback_write(slot_len - n);
                }
                Err(TransportError::WantRead) => {
                    self.input.putback_write(slot_len);
                    self.wants_read = true;

                    break;
                }
                Err(TransportError::WantWrite) => {
                    self.input.putback_write(slot_len);
                    self.wants_write = true;

                    break;
                }
                Err(e) => {
                    self.input.putback_write(slot_len);
                    self.should_destroy = true;

                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Rewinds the input ring's read cursor: undoes a speculative `recv`.
    pub fn putback_read(&mut self, n: usize) {
        self.input.putback_read(n);
    }

    /// Buffers bytes into the output ring. Independent of when they are
    /// flushed to the transport. Returns the count accepted.
    pub fn send(&mut self, src: &[u8]) -> usize {
        self.output.write(src)
    }

    /// Buffers all of `bytes` or none of them. Interim responses and
    /// frame headers must never be partially committed.
    pub fn send_all_or_none(&mut self, bytes: &[u8]) -> bool {
        let n = self.output.write(bytes);

        if n < bytes.len() {
            self.output.putback_write(n);

            return false;
        }

        true
    }

    /// Rewinds the output ring's write cursor: undoes a speculative `send`.
    pub fn putback_write(&mut self, n: usize) {
        self.output.putback_write(n);
    }

    /// Pushes buffered output to the transport through pre-advanced read
    /// slots, putting back whatever the transport does not accept. Stops
    /// on would-block (recording the readiness the loop should wait for)
    /// or when the ring is empty. Fatal errors mark the connection for
    /// destruction.
    pub fn flush(&mut self) -> Result<usize, TransportError> {
        let mut total = 0;

        while !self.output.is_empty() {
            let slot = self.output.read_slot();
            let slot_len = slot.len();

            match self.transport.write(slot) {
                Ok(0) => {
                    self.output.putback_read(slot_len);

                    break;
                }
                Ok(n) => {
                    self.output.putback_read(slot_len - n);
                    total += n;
                }
                Err(TransportError::WantWrite) => {
                    self.output.putback_read(slot_len);
                    self.wants_write = true;

                    break;
                }
                Err(TransportError::WantRead) => {
                    self.output.putback_read(slot_len);
                    self.wants_read = true;

                    break;
                }
                Err(e) => {
                    self.output.putback_read(slot_len);
                    self.should_destroy = true;

                    return Err(e);
                }
            }
        }

        if total > 0 {
            self.last_activity = Instant::now();
        }

        Ok(total)
    }

    pub fn has_unflushed_output(&self) -> bool {
        !self.output.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DuplexPipe, DuplexTransport};

    fn duplex_conn() -> (Connection, std::rc::Rc<std::cell::RefCell<DuplexPipe>>) {
        let pipe = DuplexPipe::new();
        let transport = Box::new(DuplexTransport::new(&pipe));
        let conn = Connection::new(1, transport, 16).unwrap();

        (conn, pipe)
    }

    #[test]
    fn test_recv_drains_and_refills() {
        let (mut conn, pipe) = duplex_conn();

        conn.drive_accept();
        assert_eq!(conn.stage(), Stage::Secured);

        pipe.borrow_mut().feed(b"hello world");

        let mut buf = [0u8; 5];
        assert_eq!(conn.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        // remainder was buffered by the refill; no transport needed now
        let mut buf = [0u8; 6];
        assert_eq!(conn.recv(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b" world");

        assert!(matches!(
            conn.recv(&mut buf),
            Err(TransportError::WantRead)
        ));
        assert!(conn.wants_read());
    }

    #[test]
    fn test_recv_putback_replays_bytes() {
        let (mut conn, pipe) = duplex_conn();
        conn.drive_accept();

        pipe.borrow_mut().feed(b"abcdef");

        let mut buf = [0u8; 4];
        let n = conn.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcd");

        conn.putback_read(n);

        let mut buf = [0u8; 6];
        let n = conn.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcdef");
    }

    #[test]
    fn test_recv_protects_delivered_bytes_from_refill() {
        let (mut conn, pipe) = duplex_conn();
        conn.drive_accept();

        // more input than the 16-byte ring can hold at once
        pipe.borrow_mut().feed(b"0123456789abcdefXYZ");

        let mut buf = [0u8; 12];
        let n = conn.recv(&mut buf).unwrap();
        assert_eq!(n, 12);

        // everything delivered must be exactly replayable
        conn.putback_read(n);

        let mut all = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            match conn.recv(&mut buf) {
                Ok(n) => all.extend_from_slice(&buf[..n]),
                Err(TransportError::WantRead) => break,
                Err(e) => panic!("unexpected: {}", e),
            }
        }

        assert_eq!(&all, b"0123456789abcdefXYZ");
    }

    #[test]
    fn test_recv_end_of_stream() {
        let (mut conn, pipe) = duplex_conn();
        conn.drive_accept();

        {
            let pipe = &mut *pipe.borrow_mut();
            pipe.feed(b"bye");
            pipe.finish();
        }

        let mut buf = [0u8; 8];
        assert_eq!(conn.recv(&mut buf).unwrap(), 3);
        assert_eq!(conn.recv(&mut buf).unwrap(), 0);
        assert_eq!(conn.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_send_buffers_flush_delivers() {
        let (mut conn, pipe) = duplex_conn();
        conn.drive_accept();

        assert_eq!(conn.send(b"response"), 8);
        assert!(pipe.borrow().written().is_empty());

        let flushed = conn.flush().unwrap();
        assert_eq!(flushed, 8);
        assert_eq!(pipe.borrow_mut().take_written(), b"response");
    }

    #[test]
    fn test_flush_partial_and_backpressure() {
        let (mut conn, pipe) = duplex_conn();
        conn.drive_accept();

        pipe.borrow_mut().limit_write(3);

        conn.send(b"response");
        assert_eq!(conn.flush().unwrap(), 3);
        assert!(conn.wants_write());
        assert!(conn.has_unflushed_output());

        pipe.borrow_mut().allow_write(100);
        conn.reset_wants();
        assert_eq!(conn.flush().unwrap(), 5);
        assert!(!conn.has_unflushed_output());
        assert_eq!(pipe.borrow_mut().take_written(), b"response");
    }

    #[test]
    fn test_send_all_or_none() {
        let (mut conn, _pipe) = duplex_conn();
        conn.drive_accept();

        // 16-byte ring: a 17-byte atomic write cannot fit
        assert!(!conn.send_all_or_none(b"01234567890123456"));
        assert_eq!(conn.output.len(), 0);

        assert!(conn.send_all_or_none(b"0123456789012345"));
        assert_eq!(conn.output.len(), 16);
    }
}
