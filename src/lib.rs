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

//! picket is a non-blocking HTTP/1.1 server engine: ring-buffered
//! connections, an incremental request parser, chunked transfer coding,
//! WebSocket upgrade, TLS termination, and a reverse-proxy backend path,
//! all driven by a readiness-based event loop.
//!
//! The protocol core never blocks: every read and write is speculative,
//! partial progress is put back exactly, and the read/write state
//! machines suspend and resume across any number of driver passes.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod handler;
pub mod log;
pub mod parser;
pub mod proxy;
pub mod request;
pub mod response;
pub mod server;
pub mod tls;
pub mod transport;
pub mod websocket;

use ::log::info;
use std::error::Error;

/// Builds a server from the config and runs it until stopped.
pub fn run(config: config::Config, ctx: server::ServerContext) -> Result<(), Box<dyn Error>> {
    info!("starting...");

    {
        let mut server = server::Server::new(config, ctx)?;

        info!("started");

        server.run()?;

        info!("stopping...");
    }

    info!("stopped");

    Ok(())
}
