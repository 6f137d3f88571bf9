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

use crate::handler::Handler;
use crate::websocket::{WsSession, WS_ACCEPT_MAX};
use arrayvec::ArrayString;

pub const MAX_METHOD_LENGTH: usize = 16;
pub const MAX_TARGET_LENGTH: usize = 4096;
pub const MAX_FIELD_LENGTH: usize = 8192;

/// Progress of the request's read side. Reading and writing advance
/// independently once the headers are in: a response may stream while
/// trailers are still being read.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ReadStage {
    // request object exists, no bytes examined yet
    // next: ReadingMethod
    Fresh,

    // next: PastMethod
    ReadingMethod,

    // skipping spaces after the method
    // next: ReadingTarget
    PastMethod,

    // next: PastTarget
    ReadingTarget,

    // skipping spaces after the target
    // next: ReadingVersion
    PastTarget,

    // next: ReadingField
    ReadingVersion,

    // one header line per pass; empty line ends the section
    // next: AwaitingContinueWrite, AwaitingUpgradeWrite, ReadingBody,
    //       ReadingChunkSize, DoneReading
    ReadingField,

    // paused until the write side emits 100 Continue
    // next: ReadingBody, ReadingChunkSize
    AwaitingContinueWrite,

    // paused until the write side emits the 101 upgrade response
    // next: Websocket
    AwaitingUpgradeWrite,

    // fixed-length body
    // next: DoneReading
    ReadingBody,

    // next: ReadingChunkBody, ReadingTrailer
    ReadingChunkSize,

    // next: ReadingChunkSize
    ReadingChunkBody,

    // trailer headers after the zero-size chunk
    // next: DoneReading
    ReadingTrailer,

    // request fully read
    DoneReading,

    // terminal: connection now carries websocket frames
    Websocket,
}

impl ReadStage {
    pub fn is_done(self) -> bool {
        self == ReadStage::DoneReading
    }
}

/// Progress of the request's write side.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum WriteStage {
    // nothing to write until the read side accepts the request
    // next: WritingContinue, WritingUpgrade, WritingResponse
    WriteAwaitingAccept,

    // interim 100 Continue, written atomically
    // next: WritingResponse
    WritingContinue,

    // 101 upgrade response, written atomically
    // next: WritingWebSocketResponse
    WritingUpgrade,

    // handler produces response bytes until finished or choked
    // next: DoneWriting
    WritingResponse,

    // response fully produced; flush and recycle
    DoneWriting,

    // terminal: websocket frames flow until close
    WritingWebSocketResponse,
}

/// How the request body is delimited on the wire. `Content-Length` and
/// chunked transfer coding are mutually exclusive; absence of both means
/// the body is complete as soon as the headers are.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BodyFraming {
    ContentLength(u64),
    Chunked,
}

pub struct Request {
    pub(crate) id: u64,
    pub(crate) read_stage: ReadStage,
    pub(crate) write_stage: WriteStage,

    pub(crate) method: ArrayString<MAX_METHOD_LENGTH>,
    pub(crate) target: String,
    pub(crate) host: Option<String>,
    // host carried by an absolute-form target, checked against any Host
    // header at end of headers
    pub(crate) target_host: Option<String>,
    pub(crate) framing: Option<BodyFraming>,
    pub(crate) content_type: Option<String>,
    pub(crate) expect_100: bool,
    pub(crate) close_requested: bool,
    pub(crate) upgrade_requested: bool,
    pub(crate) ws_upgrade: bool,
    pub(crate) ws_key: Option<String>,
    pub(crate) ws_version: Option<u8>,
    pub(crate) ws_accept: Option<ArrayString<WS_ACCEPT_MAX>>,

    // remaining bytes of the body or of the current chunk
    pub(crate) content_len: u64,
    pub(crate) total_content_len: u64,
    // size of the current chunk as declared by its size line
    pub(crate) chunk_size: u64,

    pub(crate) handler: Option<Box<dyn Handler>>,
    pub(crate) ws: Option<WsSession>,

    pub(crate) kill_reason: Option<&'static str>,
}

impl Request {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            read_stage: ReadStage::Fresh,
            write_stage: WriteStage::WriteAwaitingAccept,
            method: ArrayString::new(),
            target: String::new(),
            host: None,
            target_host: None,
            framing: None,
            content_type: None,
            expect_100: false,
            close_requested: false,
            upgrade_requested: false,
            ws_upgrade: false,
            ws_key: None,
            ws_version: None,
            ws_accept: None,
            content_len: 0,
            total_content_len: 0,
            chunk_size: 0,
            handler: None,
            ws: None,
            kill_reason: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn read_stage(&self) -> ReadStage {
        self.read_stage
    }

    pub fn write_stage(&self) -> WriteStage {
        self.write_stage
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn framing(&self) -> Option<BodyFraming> {
        self.framing
    }

    /// Body bytes delivered to the handler so far.
    pub fn total_content_len(&self) -> u64 {
        self.total_content_len
    }

    /// Declared size of the chunk currently being read.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn is_websocket(&self) -> bool {
        self.ws_accept.is_some()
    }

    pub fn kill_reason(&self) -> Option<&'static str> {
        self.kill_reason
    }

    /// True while the read state machine still wants bytes for this
    /// request. A `Websocket` request stays active for the life of the
    /// connection.
    pub(crate) fn still_reading(&self) -> bool {
        self.read_stage != ReadStage::DoneReading
    }
}
