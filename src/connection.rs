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

//! The worker's socket abstraction: a stream with owned byte queues, a
//! protocol tag, receive dispatch, a disconnect hook and an extension slot.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::buffer::Buffer;
use crate::http::RequestId;
use crate::worker::Worker;

/// Hook invoked when a connection disconnects, before it is removed from the
/// worker. The second argument is the connection's own token.
pub type DisconnectFn = fn(&mut Worker, Token);

/// Protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// Plain HTTP/1.x request/response.
    Http,
    /// Opaque bytes; the connection no longer speaks HTTP.
    Unknown,
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Live and registered with the poller.
    Established,
    /// Marked for teardown; swept at the end of the current tick.
    Disconnecting,
}

/// Where received bytes are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvDispatch {
    /// Accumulate and parse HTTP request heads.
    Http,
    /// Relay every chunk to the pipe peer as it arrives.
    Pipe,
}

/// Typed extension slot for handler-private connection state. Holds a lookup
/// key, never ownership, so tearing a link down cannot double-free anything.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConnExt {
    /// Nothing attached.
    #[default]
    None,
    /// The other half of a pipe link.
    PipePeer(Token),
}

impl ConnExt {
    /// The peer token, if this slot holds a pipe link.
    pub fn peer(&self) -> Option<Token> {
        match self {
            ConnExt::PipePeer(token) => Some(*token),
            ConnExt::None => None,
        }
    }
}

/// A socket owned by the worker, with its receive buffer and send queue.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    token: Token,
    pub(crate) proto: Proto,
    pub(crate) state: ConnState,
    pub(crate) recv: RecvDispatch,
    pub(crate) recv_buf: Buffer,
    send_queue: VecDeque<Vec<u8>>,
    pub(crate) disconnect: Option<DisconnectFn>,
    pub(crate) ext: ConnExt,
    pub(crate) request: Option<RequestId>,
    /// When set, the connection is torn down as soon as the send queue
    /// drains, and emitting a response does not queue a fresh HTTP receive.
    pub(crate) close_empty: bool,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, token: Token, proto: Proto, recv: RecvDispatch) -> Self {
        Self {
            stream,
            token,
            proto,
            state: ConnState::Established,
            recv,
            recv_buf: Buffer::with_capacity(4096),
            send_queue: VecDeque::new(),
            disconnect: None,
            ext: ConnExt::None,
            request: None,
            close_empty: false,
            idle_timeout: None,
            idle_deadline: None,
        }
    }

    /// The connection's poll token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Reads from the socket into the receive buffer, at most `max` bytes.
    /// `Ok(0)` means the peer closed its half of the connection.
    pub(crate) fn fill(&mut self, max: usize) -> io::Result<usize> {
        self.recv_buf.fill_from(&mut self.stream, max)
    }

    /// Queues bytes for transmission. They are written out by `flush`.
    pub(crate) fn send(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.send_queue.push_back(bytes);
        }
    }

    /// Writes queued bytes until the queue drains or the socket would block.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.send_queue.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) if n == front.len() => {
                    self.send_queue.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Whether any queued bytes are still waiting to be written.
    pub(crate) fn has_pending_send(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Arms the idle timer. Activity on the connection pushes the deadline.
    pub(crate) fn arm_idle(&mut self, timeout: Duration) {
        self.idle_timeout = Some(timeout);
        self.idle_deadline = Some(Instant::now() + timeout);
    }

    /// Records activity, pushing the idle deadline.
    pub(crate) fn touch(&mut self) {
        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(Instant::now() + timeout);
        }
    }

    pub(crate) fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(
            &mut self.stream,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}
