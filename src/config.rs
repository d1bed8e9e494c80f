// Copyright 2025 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Worker configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a worker. Values are supplied by the embedding
/// application; no file format is parsed here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the worker's listener binds to.
    pub bind: SocketAddr,
    /// Database connection string. Queries are fatal without one.
    pub conninfo: Option<String>,
    /// Ceiling on concurrent database sessions per worker.
    pub db_sessions_max: usize,
    /// Idle timeout after which a quiet connection is disconnected.
    pub idle_timeout: Duration,
    /// Largest chunk handed to a receive callback in one delivery.
    pub payload_max: usize,
    /// Cap on the size of a buffered request head before the client is
    /// refused.
    pub header_max: usize,
    /// Capacity of the poll event batch.
    pub max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8888)),
            conninfo: None,
            db_sessions_max: 2,
            idle_timeout: Duration::from_secs(10),
            payload_max: 8192,
            header_max: 8192,
            max_events: 1024,
        }
    }
}
