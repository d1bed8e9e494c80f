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

//! HTTP request model: head parsing, the request table with park/wake, and
//! response emission.
//!
//! Only the request head is parsed here. Bodies, transfer codings and
//! everything else belong to the surrounding framework; the handlers this
//! crate ships are GET-shaped.

use std::fmt::Display;

use log::trace;
use mio::Token;
use slab::Slab;

use crate::pgsql::{HandleId, SimpleQuery};
use crate::worker::{HandlerFn, Worker};

/// Identifier of an in-flight request in the worker's request table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) usize);

/// Result of stepping a request's state machine once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Step again immediately.
    Continue,
    /// Nothing to do right now; step again on a later pass.
    Retry,
    /// The request is finished and may be finalized.
    Complete,
}

/// Http status codes, trimmed to the ones this crate emits.
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 15.3.1
    Ok = 200,
    /// 15.3.5
    NoContent = 204,
    /// 15.5.1
    BadRequest = 400,
    /// 15.5.5
    NotFound = 404,
    /// 15.6.1
    InternalServerError = 500,
}

impl Status {
    /// The numeric status code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// The canonical reason phrase.
    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NoContent => "No Content",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", *self as u16))
    }
}

/// Representation of the requested HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// Represents possible failures while parsing a request head.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid or missing method.
    Method,
    /// Invalid request target.
    Target,
    /// Invalid HTTP version.
    Version,
    /// Invalid byte in a header field.
    Header,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "Invalid token in method",
            ParseError::Target => "Invalid token in target",
            ParseError::Version => "Invalid version",
            ParseError::Header => "Invalid token in header",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// A parsed request head.
#[derive(Debug)]
pub(crate) struct Head {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) version: Version,
    pub(crate) close: bool,
}

/// Parses a request head out of `buf`.
///
/// Returns `Ok(None)` until a full head (terminated by a blank line) is
/// buffered, and the number of consumed bytes alongside the head once one is.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(Head, usize)>, ParseError> {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };

    let text = std::str::from_utf8(&buf[..end]).map_err(|_| ParseError::Header)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::Method)?;
    let mut parts = request_line.split(' ');

    let method = match parts.next() {
        Some(m) if !m.is_empty() => m,
        _ => return Err(ParseError::Method),
    };
    let target = parts.next().ok_or(ParseError::Target)?;
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::H1_1,
        Some("HTTP/1.0") => Version::H1_0,
        _ => return Err(ParseError::Version),
    };
    if parts.next().is_some() || !target.starts_with('/') {
        return Err(ParseError::Target);
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_owned(), Some(q.to_owned())),
        None => (target.to_owned(), None),
    };

    let mut close = version == Version::H1_0;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::Header);
        };
        if name.trim().eq_ignore_ascii_case("connection") {
            let value = value.trim();
            if value.eq_ignore_ascii_case("close") {
                close = true;
            } else if value.eq_ignore_ascii_case("keep-alive") {
                close = false;
            }
        }
    }

    Ok(Some((
        Head {
            method: method.to_owned(),
            path,
            query,
            version,
            close,
        },
        end + 4,
    )))
}

/// Splits a query string into name/value pairs. Pairs without a `=` keep an
/// empty value.
pub(crate) fn parse_args(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_owned(), value.to_owned()),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

/// Serializes a response with the given status and body.
pub(crate) fn format_response(status: Status, body: &[u8], close: bool) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\ncontent-length: {}\r\n",
        status.code(),
        status.reason(),
        body.len()
    );
    if close {
        head.push_str("connection: close\r\n");
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Handler-private state attached to a request.
#[derive(Debug, Default)]
pub(crate) enum ReqExt {
    /// Nothing attached.
    #[default]
    None,
    /// A simple-query control block owned by the database driver.
    SimpleQuery(Box<SimpleQuery>),
}

/// An in-flight HTTP request.
///
/// A request is stepped by the worker whenever it is awake; parking it
/// (`sleep`) removes it from the stepping pass until something wakes it.
#[derive(Debug)]
pub struct Request {
    pub(crate) owner: Token,
    method: String,
    path: String,
    args: Vec<(String, String)>,
    version: Version,
    pub(crate) wants_close: bool,
    pub(crate) handler: HandlerFn,
    pub(crate) fsm_state: usize,
    pub(crate) sleeping: bool,
    deleted: bool,
    pub(crate) db_queued: bool,
    /// Response status a handler wants emitted on completion.
    pub status: Status,
    /// Response body a handler wants emitted on completion.
    pub body: Vec<u8>,
    pub(crate) responded: bool,
    pub(crate) ext: ReqExt,
    pub(crate) queries: Vec<HandleId>,
}

impl Request {
    pub(crate) fn new(owner: Token, head: Head, handler: HandlerFn) -> Self {
        let args = head
            .query
            .as_deref()
            .map(parse_args)
            .unwrap_or_default();

        Self {
            owner,
            method: head.method,
            path: head.path,
            args,
            version: head.version,
            wants_close: head.close,
            handler,
            fsm_state: 0,
            sleeping: false,
            deleted: false,
            db_queued: false,
            status: Status::Ok,
            body: Vec::new(),
            responded: false,
            ext: ReqExt::None,
            queries: Vec::new(),
        }
    }

    /// The request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The protocol version the request was made with.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Looks up a query-string argument by name.
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Token of the connection this request arrived on.
    pub fn owner(&self) -> Token {
        self.owner
    }

    pub(crate) fn deleted(&self) -> bool {
        self.deleted
    }
}

/// The worker's table of in-flight requests.
#[derive(Debug, Default)]
pub(crate) struct Requests {
    slab: Slab<Request>,
}

impl Requests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, request: Request) -> RequestId {
        RequestId(self.slab.insert(request))
    }

    pub(crate) fn get(&self, id: RequestId) -> Option<&Request> {
        self.slab.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.slab.get_mut(id.0)
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<Request> {
        self.slab.try_remove(id.0)
    }

    pub(crate) fn ids(&self) -> Vec<RequestId> {
        self.slab.iter().map(|(key, _)| RequestId(key)).collect()
    }

    /// Parks a request: it will not be stepped until woken.
    pub(crate) fn sleep(&mut self, id: RequestId) {
        if let Some(request) = self.slab.get_mut(id.0) {
            trace!("sleeping request {:?}", id);
            request.sleeping = true;
        }
    }

    /// Wakes a parked request, making it eligible for the next stepping pass.
    pub(crate) fn wakeup(&mut self, id: RequestId) {
        if let Some(request) = self.slab.get_mut(id.0) {
            if request.sleeping {
                trace!("waking request {:?}", id);
                request.sleeping = false;
            }
        }
    }

    pub(crate) fn mark_deleted(&mut self, id: RequestId) {
        if let Some(request) = self.slab.get_mut(id.0) {
            request.deleted = true;
        }
    }

    pub(crate) fn set_fsm(&mut self, id: RequestId, state: usize) {
        if let Some(request) = self.slab.get_mut(id.0) {
            request.fsm_state = state;
        }
    }

    /// Whether any request would be stepped on the next pass. Used to poll
    /// with a zero timeout while cooperative work remains.
    pub(crate) fn any_awake(&self) -> bool {
        self.slab.iter().any(|(_, r)| !r.sleeping)
    }
}

/// Placeholder handler for unrouted paths.
pub(crate) fn not_found(worker: &mut Worker, req: RequestId) -> RunState {
    if let Some(request) = worker.requests.get_mut(req) {
        request.status = Status::NotFound;
    }
    RunState::Complete
}
