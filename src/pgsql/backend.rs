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

//! The seam toward the database client library.
//!
//! The executor consumes the database through these traits rather than a
//! concrete wire-protocol implementation: connect-by-string (blocking),
//! non-blocking query submission, a pollable socket, input consumption, a
//! busy probe, result retrieval with status classification, and the last
//! error message. Implementations that cannot expose a pollable file
//! descriptor are incompatible with the executor.

use std::fmt;
use std::os::unix::io::RawFd;

/// Error reported by a backend operation, carrying the library's message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// Classification of a retrieved result, mirroring the execution statuses a
/// Postgres-style client library reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// A command that returns no rows completed.
    CommandOk,
    /// A query completed and its rows are available.
    TuplesOk,
    /// One row of a streamed result is available.
    SingleTuple,
    /// The submitted query string was empty.
    EmptyQuery,
    /// The server's response could not be understood.
    BadResponse,
    /// The server reported a fatal error for this query.
    FatalError,
    /// A notice or warning not tied to query completion.
    NonfatalError,
    /// Copy-in transfer started.
    CopyIn,
    /// Copy-out transfer started.
    CopyOut,
    /// Bidirectional copy transfer started.
    CopyBoth,
}

/// One result retrieved from a session, with its rows when it has any.
#[derive(Debug, Clone)]
pub struct QueryResult {
    status: ResultStatus,
    rows: Vec<Vec<String>>,
    error: Option<String>,
}

impl QueryResult {
    /// A result carrying rows (or none, for command completion).
    pub fn new(status: ResultStatus, rows: Vec<Vec<String>>) -> Self {
        Self {
            status,
            rows,
            error: None,
        }
    }

    /// A result carrying an error message.
    pub fn error(status: ResultStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            rows: Vec::new(),
            error: Some(message.into()),
        }
    }

    /// The result's execution status.
    pub fn status(&self) -> ResultStatus {
        self.status
    }

    /// Number of tuples in the result.
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// Cell value at `row`/`col`, if present.
    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row).and_then(|r| r.get(col)).map(String::as_str)
    }

    /// The result-specific error message, empty when there is none.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

/// Factory for database sessions. The connect call blocks; it is the one
/// accepted synchronous syscall on the query path.
pub trait Backend: fmt::Debug + Send {
    /// Establishes a session using the given connection string.
    fn connect(&self, conninfo: &str) -> Result<Box<dyn BackendConn>, BackendError>;
}

/// A live database session as the executor drives it. Dropping the value
/// finalizes the underlying connection.
pub trait BackendConn: fmt::Debug + Send {
    /// The session's pollable socket. Must be valid while the session lives.
    fn socket(&self) -> RawFd;

    /// Submits a query without waiting for its completion.
    fn send_query(&mut self, sql: &str) -> Result<(), BackendError>;

    /// Consumes whatever input the server has sent, without blocking.
    fn consume_input(&mut self) -> Result<(), BackendError>;

    /// Whether retrieving the next result would block.
    fn is_busy(&self) -> bool;

    /// Retrieves the next pending result, or `None` when the current query
    /// has produced everything it will.
    fn next_result(&mut self) -> Option<QueryResult>;

    /// The connection-level error message for the most recent failure.
    fn error_message(&self) -> String;
}
