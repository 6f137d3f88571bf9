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

use crate::request::Request;
use crate::response::Responder;
use crate::websocket::{Opcode, WsResponder};
use std::io::Write;

/// Outcome of a production pass. `Choked` is a suspend signal, not an
/// error: the handler cannot make progress right now (output full, input
/// not yet available) and should be invoked again on a later driver pass.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Respond {
    /// Produced something; invoke again after a flush.
    Continue,

    /// Cannot make progress; suspend until the next driver pass.
    Choked,

    /// Everything has been produced.
    Finished,
}

/// Per-request application callback. The event set is closed: header
/// delivery, the accept decision, body chunks, response production, and
/// the websocket lifecycle. Handler-owned state is freed by `Drop`, which
/// runs when the finished request is destroyed.
pub trait Handler {
    /// An unrecognized request or trailer header. Default: ignore.
    fn header(&mut self, _name: &str, _value: &[u8]) {}

    /// Asked once at end of headers. Returning false kills the request.
    fn accept_request(&mut self, _req: &Request) -> bool {
        true
    }

    /// A chunk of the request body. A zero-length chunk marks the end of
    /// the body.
    fn request_body(&mut self, _chunk: &[u8]) {}

    /// Produce response bytes into the connection's output ring.
    fn respond(&mut self, out: &mut Responder) -> Respond;

    /// A chunk of a websocket data frame, unmasked. `fin` is true on the
    /// last chunk of the final frame of the message.
    fn ws_data(&mut self, _opcode: Opcode, _chunk: &[u8], _fin: bool) {}

    /// Produce websocket frames. Returning `Finished` asks the engine to
    /// close the session with a normal-closure close frame.
    fn ws_respond(&mut self, _out: &mut WsResponder) -> Respond {
        Respond::Choked
    }

    /// The peer sent a close frame: code plus any trailing reason bytes.
    fn ws_closing(&mut self, _code: u16, _reason: &[u8]) {}
}

/// The request line as seen by route hooks: method plus origin-form
/// target (absolute-form targets are rewritten before routing).
pub struct RouteTarget<'a> {
    pub method: &'a str,
    pub target: &'a str,
}

pub enum RouteDecision {
    /// Not mine; evaluate the next hook.
    Decline,

    /// Install this handler and stop evaluating hooks.
    Accept(Box<dyn Handler>),

    /// Install this handler and close the connection once the response
    /// is flushed.
    AcceptAndClose(Box<dyn Handler>),

    /// Kill the connection without a response.
    Close,
}

/// Ordered routing hook. Hooks run once per request, as soon as the
/// request line is complete, so the installed handler sees the header
/// events that follow.
pub trait RouteHook {
    fn route(&self, req: &RouteTarget) -> RouteDecision;
}

impl<F> RouteHook for F
where
    F: Fn(&RouteTarget) -> RouteDecision,
{
    fn route(&self, req: &RouteTarget) -> RouteDecision {
        self(req)
    }
}

/// Streams a pre-rendered response, tolerating partial ring writes.
/// Building block for fixed responses; also what the built-in 404 uses.
pub struct StaticResponse {
    data: Vec<u8>,
    sent: usize,
}

impl StaticResponse {
    pub fn new(code: u16, reason: &str, content_type: &str, body: &[u8]) -> Self {
        let mut data = Vec::with_capacity(128 + body.len());

        write!(
            &mut data,
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            code,
            reason,
            content_type,
            body.len()
        )
        .expect("writing to a vec cannot fail");

        data.extend_from_slice(body);

        Self { data, sent: 0 }
    }
}

impl Handler for StaticResponse {
    fn respond(&mut self, out: &mut Responder) -> Respond {
        let n = out.write(&self.data[self.sent..]);
        self.sent += n;

        if self.sent == self.data.len() {
            Respond::Finished
        } else if n > 0 {
            Respond::Continue
        } else {
            Respond::Choked
        }
    }
}

pub(crate) fn not_found_handler() -> Box<dyn Handler> {
    Box::new(StaticResponse::new(
        404,
        "Not Found",
        "text/plain",
        b"no route\n",
    ))
}
