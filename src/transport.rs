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

use mio::net::TcpStream;
use std::cell::RefCell;
use std::cmp;
use std::io;
use std::io::{Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("operation would block until the transport is readable")]
    WantRead,

    #[error("operation would block until the transport is writable")]
    WantWrite,

    #[error("transport failed: {0}")]
    Fatal(#[source] io::Error),
}

impl TransportError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WantRead | Self::WantWrite)
    }
}

/// Capability set every transport kind implements. Byte transfer methods
/// return counts or a tri-state signal: `WantRead`/`WantWrite` mean the
/// operation should be retried after the corresponding readiness event,
/// `Fatal` means the connection is beyond recovery. `read` returning
/// `Ok(0)` for a nonempty buffer signals end of stream.
///
/// Teardown is `Drop`.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Drives any transport-specific handshake. `Ok(true)` means the
    /// transport is ready for traffic; `Ok(false)` is never returned in
    /// place of a would-block signal.
    fn accept_step(&mut self) -> Result<bool, TransportError>;

    /// Attempts graceful close. Some transports finish immediately;
    /// others (TLS close-notify) may need to be called again after a
    /// readiness event. `Ok(true)` means shutdown has completed.
    fn shutdown_step(&mut self) -> Result<bool, TransportError>;

    fn describe(&self) -> &'static str;

    /// The pollable source behind this transport, if any. In-memory
    /// transports have none and are driven directly.
    fn event_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        None
    }
}

fn map_read_err(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::WouldBlock {
        TransportError::WantRead
    } else {
        TransportError::Fatal(e)
    }
}

fn map_write_err(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::WouldBlock {
        TransportError::WantWrite
    } else {
        TransportError::Fatal(e)
    }
}

/// Plain non-blocking TCP, no handshake.
pub struct CleartextTransport {
    stream: TcpStream,
}

impl CleartextTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn get_tcp(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for CleartextTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_read_err(e)),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        loop {
            match self.stream.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_write_err(e)),
            }
        }
    }

    fn accept_step(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn shutdown_step(&mut self) -> Result<bool, TransportError> {
        match self.stream.shutdown(Shutdown::Write) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(true),
            Err(e) => Err(TransportError::Fatal(e)),
        }
    }

    fn describe(&self) -> &'static str {
        "cleartext"
    }

    fn event_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        Some(&mut self.stream)
    }
}

/// Outbound socket used by the reverse-proxy path. `accept_step` completes
/// once the non-blocking connect is observed writable.
pub struct BackendTransport {
    stream: TcpStream,
    connected: bool,
}

impl BackendTransport {
    pub fn connect(addr: SocketAddr) -> Result<Self, io::Error> {
        let stream = TcpStream::connect(addr)?;

        Ok(Self {
            stream,
            connected: false,
        })
    }

    pub fn get_tcp(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for BackendTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_read_err(e)),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        loop {
            match self.stream.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_write_err(e)),
            }
        }
    }

    fn accept_step(&mut self) -> Result<bool, TransportError> {
        if self.connected {
            return Ok(true);
        }

        if let Some(e) = self.stream.take_error().map_err(TransportError::Fatal)? {
            return Err(TransportError::Fatal(e));
        }

        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;

                Ok(true)
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Err(TransportError::WantWrite)
            }
            Err(e) => Err(TransportError::Fatal(e)),
        }
    }

    fn shutdown_step(&mut self) -> Result<bool, TransportError> {
        match self.stream.shutdown(Shutdown::Write) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(true),
            Err(e) => Err(TransportError::Fatal(e)),
        }
    }

    fn describe(&self) -> &'static str {
        "backend"
    }

    fn event_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        Some(&mut self.stream)
    }
}

/// Shared endpoint behind a `DuplexTransport`. Tests script input bytes
/// with `feed`, model peer backpressure with `limit_write`, and collect
/// output with `take_written`.
pub struct DuplexPipe {
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    write_allow: Option<usize>,
    eof: bool,
}

impl DuplexPipe {
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            write_allow: None,
            eof: false,
        }))
    }

    pub fn feed(&mut self, buf: &[u8]) {
        self.inbuf.extend_from_slice(buf);
    }

    /// Marks the read side as finished: once the fed bytes drain, reads
    /// report end of stream.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    pub fn take_written(&mut self) -> Vec<u8> {
        mem::take(&mut self.outbuf)
    }

    pub fn written(&self) -> &[u8] {
        &self.outbuf
    }

    /// Caps how many more bytes writes will accept; further writes report
    /// would-block. `allow_write` raises the cap.
    pub fn limit_write(&mut self, size: usize) {
        self.write_allow = Some(size);
    }

    pub fn allow_write(&mut self, size: usize) {
        if let Some(allow) = &mut self.write_allow {
            *allow += size;
        }
    }
}

/// In-memory transport for tests and benches, in the role the teacher's
/// fake socket plays: deterministic bytes in, captured bytes out, with
/// scriptable write backpressure.
pub struct DuplexTransport {
    pipe: Rc<RefCell<DuplexPipe>>,
}

impl DuplexTransport {
    pub fn new(pipe: &Rc<RefCell<DuplexPipe>>) -> Self {
        Self {
            pipe: Rc::clone(pipe),
        }
    }
}

impl Transport for DuplexTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let pipe = &mut *self.pipe.borrow_mut();

        if pipe.inbuf.is_empty() {
            if pipe.eof {
                return Ok(0);
            }

            return Err(TransportError::WantRead);
        }

        let size = cmp::min(buf.len(), pipe.inbuf.len());

        buf[..size].copy_from_slice(&pipe.inbuf[..size]);

        let rest = pipe.inbuf.split_off(size);
        pipe.inbuf = rest;

        Ok(size)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let pipe = &mut *self.pipe.borrow_mut();

        let size = match &mut pipe.write_allow {
            Some(allow) => {
                if buf.len() > 0 && *allow == 0 {
                    return Err(TransportError::WantWrite);
                }

                let size = cmp::min(buf.len(), *allow);
                *allow -= size;

                size
            }
            None => buf.len(),
        };

        pipe.outbuf.extend_from_slice(&buf[..size]);

        Ok(size)
    }

    fn accept_step(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn shutdown_step(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn describe(&self) -> &'static str {
        "duplex"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplex_read_write() {
        let pipe = DuplexPipe::new();
        let mut t = DuplexTransport::new(&pipe);

        let mut buf = [0u8; 8];
        assert!(matches!(t.read(&mut buf), Err(TransportError::WantRead)));

        pipe.borrow_mut().feed(b"hello");

        let n = t.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(matches!(t.read(&mut buf), Err(TransportError::WantRead)));

        assert_eq!(t.write(b"world").unwrap(), 5);
        assert_eq!(pipe.borrow_mut().take_written(), b"world");
    }

    #[test]
    fn test_duplex_eof() {
        let pipe = DuplexPipe::new();
        let mut t = DuplexTransport::new(&pipe);

        {
            let pipe = &mut *pipe.borrow_mut();
            pipe.feed(b"x");
            pipe.finish();
        }

        let mut buf = [0u8; 8];
        assert_eq!(t.read(&mut buf).unwrap(), 1);
        assert_eq!(t.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_duplex_write_backpressure() {
        let pipe = DuplexPipe::new();
        let mut t = DuplexTransport::new(&pipe);

        pipe.borrow_mut().limit_write(3);

        assert_eq!(t.write(b"hello").unwrap(), 3);
        assert!(matches!(t.write(b"lo"), Err(TransportError::WantWrite)));

        pipe.borrow_mut().allow_write(2);
        assert_eq!(t.write(b"lo").unwrap(), 2);

        assert_eq!(pipe.borrow_mut().take_written(), b"hello");
    }

    #[test]
    fn test_duplex_handshake_is_immediate() {
        let pipe = DuplexPipe::new();
        let mut t = DuplexTransport::new(&pipe);

        assert!(t.accept_step().unwrap());
        assert!(t.shutdown_step().unwrap());
        assert_eq!(t.describe(), "duplex");
    }
}
