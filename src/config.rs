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

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_RING_CAPACITY: usize = 16384;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,

    /// PEM certificate chain and private key; both present means TLS
    /// termination, both absent means cleartext.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    /// Per-direction ring capacity. Must be a power of two.
    pub ring_capacity: usize,

    pub max_connections: usize,

    /// Connections idle longer than this are expired by housekeeping.
    pub idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            tls_cert: None,
            tls_key: None,
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_connections: 1024,
            idle_timeout_secs: 300,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn wants_tls(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}
