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

//! Crate error type

use crate::pgsql::backend::BackendError;

/// Errors surfaced by worker setup and teardown.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O operation against a socket or the poller failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The database backend reported a failure.
    #[error("database error: {0}")]
    Backend(#[from] BackendError),
}
