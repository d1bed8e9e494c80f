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

//! The worker: a single-threaded event loop driving connections, HTTP
//! requests and the database gateway off one poller.
//!
//! Every callback — request stepping, pipe relay, database readiness,
//! disconnect hooks — runs on the worker's thread and must not block.
//! Parallelism comes from running one worker per thread, each owning
//! disjoint connections, requests and database sessions.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::config::Config;
use crate::connection::{ConnState, Connection, Proto, RecvDispatch};
use crate::error::Error;
use crate::http::{self, Request, RequestId, Requests, RunState, Status};
use crate::pgsql::backend::Backend;
use crate::pgsql::{self, Executor, SessionId, SimpleQuery};
use crate::tunnel;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Start of the token range carrying database session keys. Connection
/// tokens are slab keys and stay far below this.
pub(crate) const DB_TOKEN_BASE: usize = usize::MAX >> 1;

/// A request handler. Invoked every time the request is stepped; returns
/// what the runner should do next.
pub type HandlerFn = fn(&mut Worker, RequestId) -> RunState;

/// Handle for stopping a running worker from another thread.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl WorkerHandle {
    /// Asks the worker to exit its event loop.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// A worker owning a listener, its connections, its in-flight requests and
/// its database gateway.
#[derive(Debug)]
pub struct Worker {
    listener: TcpListener,
    pub(crate) poll: Poll,
    pub(crate) conns: Slab<Connection>,
    pub(crate) requests: Requests,
    pub(crate) executor: Executor,
    pub(crate) config: Config,
    routes: Vec<(String, HandlerFn)>,
    dead: Vec<Token>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    /// Binds the listener and sets up the poller.
    pub fn new(config: Config) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.bind)?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let executor = Executor::new(config.db_sessions_max, config.conninfo.clone());

        Ok(Self {
            listener,
            poll,
            conns: Slab::new(),
            requests: Requests::new(),
            executor,
            config,
            routes: Vec::new(),
            dead: Vec::new(),
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The address the listener actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registers a handler for an exact request path.
    pub fn handle(&mut self, path: &str, handler: HandlerFn) {
        self.routes.push((path.to_owned(), handler));
    }

    /// Installs the database backend queries are served through.
    pub fn set_backend(&mut self, backend: Box<dyn Backend>) {
        self.executor.set_backend(backend);
    }

    /// Number of live database sessions. Exposed for observability.
    pub fn db_session_count(&self) -> usize {
        self.executor.session_count()
    }

    /// A handle that can stop this worker from another thread.
    pub fn shutdown_handle(&self) -> WorkerHandle {
        WorkerHandle {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Looks up an in-flight request.
    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(id)
    }

    /// Looks up an in-flight request mutably.
    pub fn request_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(id)
    }

    /// Steps the simple-query driver for `req`, installing `ctl` on the
    /// first invocation. Handlers delegate their whole body to this.
    pub fn simple_query(&mut self, req: RequestId, ctl: SimpleQuery) -> RunState {
        pgsql::simple_run(self, req, ctl)
    }

    /// Emits a response for `req` on its owning connection.
    ///
    /// Unless the connection asked to close when its send queue empties, this
    /// also re-arms HTTP receive dispatch so the next request on the
    /// connection is parsed.
    pub fn respond(&mut self, req: RequestId, status: Status, body: &[u8]) {
        let (token, wants_close) = match self.requests.get_mut(req) {
            Some(request) if !request.responded => {
                request.responded = true;
                (request.owner, request.wants_close)
            }
            _ => return,
        };

        let Some(conn) = self.conns.get_mut(token.0) else {
            return;
        };
        if wants_close {
            conn.close_empty = true;
        }
        let bytes = http::format_response(status, body, conn.close_empty);
        conn.send(bytes);
        if !conn.close_empty {
            conn.recv = RecvDispatch::Http;
        }
    }

    /// Main event loop. Returns when the shutdown handle fires or polling
    /// fails.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(self.config.max_events);

        while !self.shutdown.load(Ordering::SeqCst) {
            let timeout = self.poll_timeout();
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("failed to poll for events: {err}");
                return;
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept(),
                    WAKE_TOKEN => {}
                    Token(t) if t >= DB_TOKEN_BASE => {
                        let sid = SessionId(t - DB_TOKEN_BASE);
                        self.executor.handle_ready(
                            &mut self.requests,
                            self.poll.registry(),
                            sid,
                            event.is_error(),
                        );
                    }
                    token => {
                        if event.is_error() {
                            self.disconnect(token);
                            continue;
                        }
                        if event.is_readable() || event.is_read_closed() {
                            self.conn_readable(token);
                        }
                        if event.is_writable() {
                            self.conn_writable(token);
                        }
                    }
                }
            }

            self.process_requests();
            self.flush_pending();
            self.expire_idle();
            self.sweep();
        }
    }

    /// Inserts an externally created stream (a pipe peer) as a connection,
    /// registered for both readiness directions with its idle timer armed.
    pub(crate) fn add_connection(
        &mut self,
        stream: TcpStream,
        proto: Proto,
        recv: RecvDispatch,
    ) -> io::Result<Token> {
        let idle_timeout = self.config.idle_timeout;
        let entry = self.conns.vacant_entry();
        let token = Token(entry.key());
        if token.0 >= DB_TOKEN_BASE {
            return Err(ErrorKind::OutOfMemory.into());
        }

        let mut conn = Connection::new(stream, token, proto, recv);
        conn.register(self.poll.registry())?;
        conn.arm_idle(idle_timeout);
        entry.insert(conn);
        Ok(token)
    }

    /// Marks a connection for teardown and runs its disconnect hook. The
    /// actual removal happens on the sweep pass at the end of the tick.
    pub(crate) fn disconnect(&mut self, token: Token) {
        let hook = match self.conns.get_mut(token.0) {
            Some(conn) if conn.state != ConnState::Disconnecting => {
                conn.state = ConnState::Disconnecting;
                conn.disconnect.take()
            }
            _ => return,
        };

        if let Some(hook) = hook {
            hook(self, token);
        }
        if let Some(id) = self.conns.get(token.0).and_then(|c| c.request) {
            self.requests.mark_deleted(id);
        }
        self.dead.push(token);
    }

    /// Flushes a connection's send queue, disconnecting on write failure or
    /// once a close-when-empty connection drains.
    pub(crate) fn flush_conn(&mut self, token: Token) {
        let result = match self.conns.get_mut(token.0) {
            Some(conn) if conn.state == ConnState::Established => conn.flush(),
            _ => return,
        };

        match result {
            Ok(()) => {
                let drained = self
                    .conns
                    .get(token.0)
                    .map(|c| c.close_empty && !c.has_pending_send())
                    .unwrap_or(false);
                if drained {
                    self.disconnect(token);
                }
            }
            Err(err) => {
                debug!("write failed on {token:?}: {err}");
                self.disconnect(token);
            }
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    let idle_timeout = self.config.idle_timeout;
                    let entry = self.conns.vacant_entry();
                    let token = Token(entry.key());
                    if token.0 >= DB_TOKEN_BASE {
                        debug!("connection table exhausted, dropping accept");
                        continue;
                    }

                    match self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        Ok(()) => {
                            let mut conn =
                                Connection::new(stream, token, Proto::Http, RecvDispatch::Http);
                            conn.arm_idle(idle_timeout);
                            entry.insert(conn);
                        }
                        Err(err) => {
                            debug!("dropping connection, register failed: {err}");
                        }
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    error!("could not accept connection: {err}");
                    return;
                }
            }
        }
    }

    fn conn_readable(&mut self, token: Token) {
        loop {
            let payload_max = self.config.payload_max;
            let filled = match self.conns.get_mut(token.0) {
                Some(conn) if conn.state == ConnState::Established => {
                    conn.touch();
                    conn.fill(payload_max)
                }
                _ => return,
            };

            match filled {
                Ok(0) => {
                    self.dispatch_recv(token);
                    self.disconnect(token);
                    return;
                }
                Ok(_) => self.dispatch_recv(token),
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    debug!("read failed on {token:?}: {err}");
                    self.disconnect(token);
                    return;
                }
            }
        }
    }

    fn conn_writable(&mut self, token: Token) {
        if let Some(conn) = self.conns.get_mut(token.0) {
            conn.touch();
        }
        self.flush_conn(token);
    }

    fn dispatch_recv(&mut self, token: Token) {
        let recv = match self.conns.get(token.0) {
            Some(conn) => conn.recv,
            None => return,
        };
        match recv {
            RecvDispatch::Http => self.http_recv(token),
            RecvDispatch::Pipe => tunnel::pipe_data(self, token),
        }
    }

    /// Tries to begin a request from the bytes buffered on an HTTP
    /// connection. A connection parses one request head at a time; further
    /// pipelined bytes stay buffered until the request completes.
    fn http_recv(&mut self, token: Token) {
        let header_max = self.config.header_max;
        enum Outcome {
            Head(http::Head),
            Refuse,
            Nothing,
        }

        let outcome = match self.conns.get_mut(token.0) {
            Some(conn)
                if conn.recv == RecvDispatch::Http
                    && conn.request.is_none()
                    && !conn.close_empty =>
            {
                match http::parse_head(conn.recv_buf.as_slice()) {
                    Ok(Some((head, consumed))) => {
                        conn.recv_buf.mark_read(consumed);
                        Outcome::Head(head)
                    }
                    Ok(None) => {
                        if conn.recv_buf.remaining() > header_max {
                            Outcome::Refuse
                        } else {
                            Outcome::Nothing
                        }
                    }
                    Err(err) => {
                        debug!("bad request head on {token:?}: {err}");
                        Outcome::Refuse
                    }
                }
            }
            _ => Outcome::Nothing,
        };

        match outcome {
            Outcome::Head(head) => self.begin_request(token, head),
            Outcome::Refuse => self.refuse(token, Status::BadRequest),
            Outcome::Nothing => {}
        }
    }

    fn begin_request(&mut self, token: Token, head: http::Head) {
        let handler = self.route(&head.path);
        trace!("request {} {} on {token:?}", head.method, head.path);

        let id = self.requests.insert(Request::new(token, head, handler));
        if let Some(conn) = self.conns.get_mut(token.0) {
            conn.request = Some(id);
        }
    }

    fn route(&self, path: &str) -> HandlerFn {
        self.routes
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, handler)| *handler)
            .unwrap_or(http::not_found)
    }

    /// Refuses a connection outside the request machinery: queues a
    /// response and closes once it drains.
    fn refuse(&mut self, token: Token, status: Status) {
        if let Some(conn) = self.conns.get_mut(token.0) {
            conn.close_empty = true;
            conn.recv_buf.take_all();
            let bytes = http::format_response(status, b"", true);
            conn.send(bytes);
        }
    }

    /// Steps every awake request until it parks, retries or completes.
    /// Sleeping requests are skipped; they are stepped again after a wake.
    fn process_requests(&mut self) {
        for id in self.requests.ids() {
            loop {
                let (deleted, sleeping, handler) = match self.requests.get(id) {
                    Some(request) => (request.deleted(), request.sleeping, request.handler),
                    None => break,
                };
                if deleted {
                    self.teardown_request(id);
                    break;
                }
                if sleeping {
                    break;
                }

                match handler(self, id) {
                    RunState::Continue => {}
                    RunState::Retry => break,
                    RunState::Complete => {
                        self.finalize_request(id);
                        break;
                    }
                }
            }
        }
    }

    fn finalize_request(&mut self, id: RequestId) {
        let (responded, status, body, token) = match self.requests.get_mut(id) {
            Some(request) => (
                request.responded,
                request.status,
                std::mem::take(&mut request.body),
                request.owner,
            ),
            None => return,
        };

        if !responded {
            self.respond(id, status, &body);
        }
        self.requests.remove(id);
        if let Some(conn) = self.conns.get_mut(token.0) {
            conn.request = None;
            conn.touch();
        }

        // a pipelined next request may already be buffered
        self.http_recv(token);
    }

    /// Unlinks a request from the gateway (waiter queue and live query
    /// handles) and drops it from the table.
    fn teardown_request(&mut self, id: RequestId) {
        trace!("tearing down request {id:?}");
        let Worker {
            requests,
            executor,
            poll,
            ..
        } = self;

        if requests.get(id).map(|r| r.db_queued).unwrap_or(false) {
            executor.queue_remove(id);
        }
        let handles = requests
            .get(id)
            .map(|r| r.queries.clone())
            .unwrap_or_default();
        for hid in handles {
            executor.cleanup_handle(requests, poll.registry(), hid);
        }
        requests.remove(id);
    }

    fn flush_pending(&mut self) {
        let tokens: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.has_pending_send())
            .map(|(key, _)| Token(key))
            .collect();
        for token in tokens {
            self.flush_conn(token);
        }
    }

    fn expire_idle(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, conn)| {
                conn.state == ConnState::Established
                    && conn.request.is_none()
                    && conn.idle_deadline().map(|dl| dl <= now).unwrap_or(false)
            })
            .map(|(key, _)| Token(key))
            .collect();
        for token in expired {
            debug!("idle timeout on {token:?}");
            self.disconnect(token);
        }
    }

    /// Removes connections marked disconnecting, tearing down any request
    /// still attached to them.
    fn sweep(&mut self) {
        while let Some(token) = self.dead.pop() {
            if let Some(id) = self.conns.get(token.0).and_then(|c| c.request) {
                self.teardown_request(id);
            }
            if let Some(mut conn) = self.conns.try_remove(token.0) {
                let _ = conn.deregister(self.poll.registry());
                trace!("closed connection {token:?}");
            }
        }
    }

    /// Zero while cooperative work remains, otherwise the nearest idle
    /// deadline.
    fn poll_timeout(&self) -> Option<Duration> {
        if self.requests.any_awake() {
            return Some(Duration::ZERO);
        }

        let now = Instant::now();
        let mut next: Option<Duration> = None;
        for (_, conn) in self.conns.iter() {
            if conn.request.is_some() {
                continue;
            }
            if let Some(deadline) = conn.idle_deadline() {
                let wait = deadline.saturating_duration_since(now);
                next = Some(match next {
                    Some(current) => current.min(wait),
                    None => wait,
                });
            }
        }
        next
    }
}
