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

use crate::transport::{Transport, TransportError};
use log::debug;
use mio::net::TcpStream;
use openssl::error::ErrorStack;
use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, SslAcceptor, SslFiletype, SslMethod,
    SslStream,
};
use std::io;
use std::path::Path;

fn fatal_ssl(e: openssl::ssl::Error) -> TransportError {
    let e = match e.into_io_error() {
        Ok(e) => e,
        Err(e) => io::Error::new(io::ErrorKind::Other, e),
    };

    TransportError::Fatal(e)
}

/// Builds server-side TLS sessions from a certificate chain and private
/// key. Certificate management (SNI caches, reloads) is out of scope; one
/// identity per acceptor.
pub struct TlsAcceptor {
    acceptor: SslAcceptor,
}

impl TlsAcceptor {
    pub fn new(cert_file: &Path, key_file: &Path) -> Result<Self, ErrorStack> {
        let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;

        acceptor.set_private_key_file(key_file, SslFiletype::PEM)?;
        acceptor.set_certificate_chain_file(cert_file)?;
        acceptor.check_private_key()?;

        Ok(Self {
            acceptor: acceptor.build(),
        })
    }

    /// Starts a server-side session over a non-blocking socket. The
    /// handshake almost always suspends immediately; the returned
    /// transport finishes it across `accept_step` calls.
    pub fn accept(&self, stream: TcpStream) -> Result<TlsTransport, ErrorStack> {
        let stream = match self.acceptor.accept(stream) {
            Ok(stream) => Stream::Ssl(stream),
            Err(HandshakeError::SetupFailure(e)) => return Err(e),
            Err(HandshakeError::Failure(stream)) => Stream::MidHandshake(stream),
            Err(HandshakeError::WouldBlock(stream)) => Stream::MidHandshake(stream),
        };

        Ok(TlsTransport {
            stream: Some(stream),
        })
    }
}

enum Stream {
    Ssl(SslStream<TcpStream>),
    MidHandshake(MidHandshakeSslStream<TcpStream>),
}

/// TLS transport. OpenSSL is opaque behind the `Transport` contract:
/// reads and writes surface WANT_READ/WANT_WRITE as the tri-state
/// would-block signals, `accept_step` resumes the handshake, and
/// `shutdown_step` retries close-notify until it goes out.
pub struct TlsTransport {
    stream: Option<Stream>,
}

impl TlsTransport {
    pub fn get_tcp(&self) -> Option<&TcpStream> {
        match &self.stream {
            Some(Stream::Ssl(stream)) => Some(stream.get_ref()),
            Some(Stream::MidHandshake(stream)) => Some(stream.get_ref()),
            None => None,
        }
    }

    fn ensure_handshake(&mut self) -> Result<(), TransportError> {
        match &self.stream {
            Some(Stream::Ssl(_)) => Ok(()),
            Some(Stream::MidHandshake(_)) => match self.stream.take().unwrap() {
                Stream::MidHandshake(stream) => match stream.handshake() {
                    Ok(stream) => {
                        debug!("tls handshake success");
                        self.stream = Some(Stream::Ssl(stream));

                        Ok(())
                    }
                    Err(HandshakeError::WouldBlock(stream)) => {
                        let want = match stream.error().code() {
                            ErrorCode::WANT_WRITE => TransportError::WantWrite,
                            _ => TransportError::WantRead,
                        };

                        self.stream = Some(Stream::MidHandshake(stream));

                        Err(want)
                    }
                    Err(HandshakeError::Failure(stream)) => {
                        Err(TransportError::Fatal(io::Error::new(
                            io::ErrorKind::Other,
                            format!("tls handshake failed: {}", stream.error()),
                        )))
                    }
                    Err(HandshakeError::SetupFailure(e)) => Err(TransportError::Fatal(
                        io::Error::new(io::ErrorKind::Other, e),
                    )),
                },
                _ => unreachable!(),
            },
            None => Err(TransportError::Fatal(io::Error::from(
                io::ErrorKind::NotConnected,
            ))),
        }
    }
}

impl Transport for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.ensure_handshake()?;

        let stream = match &mut self.stream {
            Some(Stream::Ssl(stream)) => stream,
            _ => unreachable!(),
        };

        match stream.ssl_read(buf) {
            Ok(n) => Ok(n),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Err(TransportError::WantRead),
                ErrorCode::WANT_WRITE => Err(TransportError::WantWrite),
                ErrorCode::ZERO_RETURN => Ok(0),
                _ => Err(fatal_ssl(e)),
            },
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.ensure_handshake()?;

        let stream = match &mut self.stream {
            Some(Stream::Ssl(stream)) => stream,
            _ => unreachable!(),
        };

        match stream.ssl_write(buf) {
            Ok(n) => Ok(n),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Err(TransportError::WantRead),
                ErrorCode::WANT_WRITE => Err(TransportError::WantWrite),
                _ => Err(fatal_ssl(e)),
            },
        }
    }

    fn accept_step(&mut self) -> Result<bool, TransportError> {
        self.ensure_handshake()?;

        Ok(true)
    }

    fn shutdown_step(&mut self) -> Result<bool, TransportError> {
        let stream = match &mut self.stream {
            Some(Stream::Ssl(stream)) => stream,
            // never handshaken; nothing to notify
            _ => return Ok(true),
        };

        match stream.shutdown() {
            // close-notify sent; we don't wait for the peer's reply
            Ok(_) => Ok(true),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Err(TransportError::WantRead),
                ErrorCode::WANT_WRITE => Err(TransportError::WantWrite),
                ErrorCode::ZERO_RETURN => Ok(true),
                _ => Err(fatal_ssl(e)),
            },
        }
    }

    fn describe(&self) -> &'static str {
        "tls"
    }

    fn event_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        match &mut self.stream {
            Some(Stream::Ssl(stream)) => Some(stream.get_mut()),
            Some(Stream::MidHandshake(stream)) => Some(stream.get_mut()),
            None => None,
        }
    }
}
