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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! sluse is a small event-driven HTTP server core built around one poller
//! per worker thread, with two integrated subsystems that both lean on the
//! worker's ability to park and resume an in-flight request:
//!
//! - [`tunnel`]: promotes a live client connection into a bidirectional
//!   byte pipe toward an arbitrary TCP endpoint.
//! - [`pgsql`]: a bounded pool of persistent database sessions that lets
//!   request handlers run queries without ever blocking the event loop.
//!
//! A worker is single-threaded and cooperative: every callback must return
//! quickly, and anything that has to wait parks its request instead.
//!
//! ```no_run
//! use sluse::{Config, Worker};
//!
//! fn main() -> Result<(), sluse::Error> {
//!     let mut worker = Worker::new(Config::default())?;
//!     worker.handle("/tunnel", sluse::tunnel::open_connection);
//!     worker.run();
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod pgsql;
pub mod tunnel;
pub mod worker;

pub use config::Config;
pub use error::Error;
pub use http::{Request, RequestId, RunState, Status};
pub use pgsql::SimpleQuery;
pub use worker::{HandlerFn, Worker, WorkerHandle};
