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

//! Asynchronous database gateway.
//!
//! A bounded pool of persistent sessions shares one connection string.
//! Submitting a query parks the owning HTTP request; the session's socket is
//! watched for readability and the request is woken when results, errors or
//! pool capacity arrive. Handler authors consume all of this through the
//! five-state simple-query driver rather than the pool directly.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

use log::{debug, error, trace};
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use slab::Slab;

use crate::http::{ReqExt, Request, RequestId, Requests, RunState, Status};
use crate::worker::{Worker, DB_TOKEN_BASE};

pub mod backend;

use backend::{Backend, BackendError, QueryResult, ResultStatus};

/// Identifier of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(pub(crate) usize);

/// Identifier of a query handle owned by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleId(pub(crate) usize);

/// Observable phase of an asynchronous query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Freshly initialized, not yet submitted.
    Init,
    /// Submitted; waiting on the database socket.
    Wait,
    /// A result with rows is available on the handle.
    Result,
    /// The query failed; the handle carries the error text.
    Error,
    /// The current query finished producing results.
    Done,
    /// The session has been released; the handle is finished.
    Complete,
}

/// Per-query state carrier: the phase, the most recent result, the most
/// recent error text, and the session currently serving the query.
#[derive(Debug)]
pub struct QueryHandle {
    state: QueryState,
    result: Option<QueryResult>,
    error: Option<String>,
    session: Option<SessionId>,
    req: RequestId,
}

impl QueryHandle {
    /// The query's current phase.
    pub fn state(&self) -> QueryState {
        self.state
    }

    /// The most recent result, when one is pending on the handle.
    pub fn result(&self) -> Option<&QueryResult> {
        self.result.as_ref()
    }

    /// The most recent error text.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// The (query, request, handle) triple bound to a busy session.
#[derive(Debug)]
struct Job {
    query: String,
    req: RequestId,
    handle: HandleId,
}

#[derive(Debug)]
struct Session {
    db: Box<dyn backend::BackendConn>,
    free: bool,
    job: Option<Job>,
    registered: bool,
}

/// Outcome of submitting a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submitted {
    /// Submitted; the handle is waiting on the database socket.
    Ok(HandleId),
    /// The pool is saturated; the request was parked on the waiter queue and
    /// the caller should retry after it wakes.
    Busy,
    /// Submission failed; the handle carries the error.
    Failed(HandleId),
}

/// The worker's database gateway: the session pool, the waiter queue and
/// every live query handle.
#[derive(Debug)]
pub struct Executor {
    backend: Option<Box<dyn Backend>>,
    conninfo: Option<String>,
    max_sessions: usize,
    sessions: Slab<Session>,
    free: VecDeque<SessionId>,
    waiters: VecDeque<RequestId>,
    handles: Slab<QueryHandle>,
}

impl Executor {
    pub(crate) fn new(max_sessions: usize, conninfo: Option<String>) -> Self {
        Self {
            backend: None,
            conninfo,
            max_sessions,
            sessions: Slab::new(),
            free: VecDeque::new(),
            waiters: VecDeque::new(),
            handles: Slab::new(),
        }
    }

    pub(crate) fn set_backend(&mut self, backend: Box<dyn Backend>) {
        self.backend = Some(backend);
    }

    /// Number of live sessions, free and busy.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Looks up a live query handle.
    pub fn handle(&self, id: HandleId) -> Option<&QueryHandle> {
        self.handles.get(id.0)
    }

    /// Submits `query` on behalf of `req`, acquiring a session from the pool.
    ///
    /// The request is parked in every case except outright failure before a
    /// session was involved: either it waits on the database socket, or it
    /// waits on the pool's waiter queue.
    pub(crate) fn submit(
        &mut self,
        requests: &mut Requests,
        registry: &Registry,
        req: RequestId,
        query: &str,
    ) -> Submitted {
        if self.free.is_empty() {
            if self.sessions.len() >= self.max_sessions {
                self.queue_add(requests, req);
                return Submitted::Busy;
            }

            if let Err(err) = self.session_create() {
                let hid = HandleId(self.handles.insert(QueryHandle {
                    state: QueryState::Error,
                    result: None,
                    error: Some(err.to_string()),
                    session: None,
                    req,
                }));
                if let Some(request) = requests.get_mut(req) {
                    request.queries.push(hid);
                }
                return Submitted::Failed(hid);
            }
        }

        requests.sleep(req);

        let sid = match self.free.pop_front() {
            Some(sid) => sid,
            None => panic!("free list empty after session creation"),
        };
        if !self.sessions[sid.0].free {
            panic!("received a database session that was not free");
        }
        self.sessions[sid.0].free = false;

        let hid = HandleId(self.handles.insert(QueryHandle {
            state: QueryState::Init,
            result: None,
            error: None,
            session: Some(sid),
            req,
        }));
        if let Some(request) = requests.get_mut(req) {
            request.queries.push(hid);
        }

        self.sessions[sid.0].job = Some(Job {
            query: query.to_owned(),
            req,
            handle: hid,
        });

        if let Err(err) = self.sessions[sid.0].db.send_query(query) {
            debug!("query submission failed: {err}");
            self.conn_cleanup(requests, registry, sid);
            return Submitted::Failed(hid);
        }

        let fd = self.sessions[sid.0].db.socket();
        if fd < 0 {
            panic!("backend returned a negative socket on an open session");
        }
        if let Err(err) = registry.register(
            &mut SourceFd(&fd),
            Token(DB_TOKEN_BASE + sid.0),
            Interest::READABLE,
        ) {
            debug!("could not watch database socket: {err}");
            self.conn_cleanup(requests, registry, sid);
            return Submitted::Failed(hid);
        }
        self.sessions[sid.0].registered = true;

        self.handles[hid.0].state = QueryState::Wait;
        trace!("query {:?} for request {:?} sent on session {:?}", query, req, sid);
        Submitted::Ok(hid)
    }

    /// Readiness callback for a session's socket. `on_error` is set when the
    /// poller reported an error condition on the descriptor.
    pub(crate) fn handle_ready(
        &mut self,
        requests: &mut Requests,
        registry: &Registry,
        sid: SessionId,
        on_error: bool,
    ) {
        if !self.sessions.contains(sid.0) {
            debug!("readiness for unknown session {:?}", sid);
            return;
        }
        if on_error {
            self.conn_cleanup(requests, registry, sid);
            return;
        }

        let (req, hid) = match &self.sessions[sid.0].job {
            Some(job) => (job.req, job.handle),
            // read interest is disabled on release; a stale edge can still
            // land here
            None => {
                debug!("readiness for idle session {:?}", sid);
                return;
            }
        };

        let session = &mut self.sessions[sid.0];
        let handle = &mut self.handles[hid.0];
        match session.db.consume_input() {
            Err(err) => {
                handle.state = QueryState::Error;
                handle.error = Some(err.to_string());
            }
            Ok(()) => read_result(session, handle),
        }

        if self.handles[hid.0].state == QueryState::Wait {
            requests.sleep(req);
        } else {
            requests.wakeup(req);
        }
    }

    /// Resumption point after a wake that did not hand the driver a result
    /// batch: clears stale result/error state and drives the next cycle.
    pub(crate) fn continue_handle(
        &mut self,
        requests: &mut Requests,
        registry: &Registry,
        hid: HandleId,
    ) {
        let (state, req, session) = {
            let Some(handle) = self.handles.get_mut(hid.0) else {
                return;
            };
            handle.error = None;
            handle.result = None;
            (handle.state, handle.req, handle.session)
        };
        trace!("continue query {:?} in state {:?}", hid, state);

        match state {
            QueryState::Init | QueryState::Wait => {}
            QueryState::Done => {
                requests.wakeup(req);
                self.release(requests, registry, hid);
            }
            QueryState::Error | QueryState::Result => match session {
                Some(sid) => self.handle_ready(requests, registry, sid, false),
                None => debug!("continue for query {:?} without a session", hid),
            },
            QueryState::Complete => panic!("query {:?} continued after completion", hid),
        }
    }

    /// Releases the session serving `hid` back onto the free list and wakes
    /// the oldest live waiter.
    pub(crate) fn release(
        &mut self,
        requests: &mut Requests,
        registry: &Registry,
        hid: HandleId,
    ) {
        let sid = match self.handles.get(hid.0).and_then(|h| h.session) {
            Some(sid) => sid,
            None => return,
        };

        {
            let session = &mut self.sessions[sid.0];
            if let Some(job) = session.job.take() {
                trace!("finished query {:?} for request {:?}", job.query, job.req);
            }
            // drain just in case
            while session.db.next_result().is_some() {}
            session.free = true;
        }
        self.free.push_back(sid);

        if self.sessions[sid.0].registered {
            let fd = self.sessions[sid.0].db.socket();
            let _ = registry.deregister(&mut SourceFd(&fd));
            self.sessions[sid.0].registered = false;
        }

        if let Some(handle) = self.handles.get_mut(hid.0) {
            handle.session = None;
            handle.state = QueryState::Complete;
        }
        trace!("released session {:?}", sid);

        self.queue_wakeup(requests);
    }

    /// Tears a session down after an I/O failure: errors the owning request
    /// if one is attached, finalizes the backend connection, and drops the
    /// pool count.
    pub(crate) fn conn_cleanup(
        &mut self,
        requests: &mut Requests,
        registry: &Registry,
        sid: SessionId,
    ) {
        if !self.sessions.contains(sid.0) {
            return;
        }
        debug!("cleaning up session {:?}", sid);

        if self.sessions[sid.0].free {
            self.free.retain(|s| *s != sid);
        }

        if let Some(job) = self.sessions[sid.0].job.take() {
            requests.wakeup(job.req);
            let message = self.sessions[sid.0].db.error_message();
            if let Some(handle) = self.handles.get_mut(job.handle.0) {
                handle.session = None;
                handle.state = QueryState::Error;
                handle.error = Some(message);
            }
        }

        let session = self.sessions.remove(sid.0);
        if session.registered {
            let fd = session.db.socket();
            let _ = registry.deregister(&mut SourceFd(&fd));
        }
        // the backend connection is finalized when `session` drops
    }

    /// Frees a handle's result and error, detaches its session, and unlinks
    /// it from the owning request. Safe to call more than once.
    pub(crate) fn cleanup_handle(
        &mut self,
        requests: &mut Requests,
        registry: &Registry,
        hid: HandleId,
    ) {
        if !self.handles.contains(hid.0) {
            return;
        }

        {
            let handle = &mut self.handles[hid.0];
            handle.result = None;
            handle.error = None;
        }

        if let Some(sid) = self.handles[hid.0].session {
            if self.handles[hid.0].state == QueryState::Error {
                // an errored session is finalized, never re-pooled
                self.conn_cleanup(requests, registry, sid);
            } else {
                self.release(requests, registry, hid);
            }
        }

        let handle = self.handles.remove(hid.0);
        if let Some(request) = requests.get_mut(handle.req) {
            request.queries.retain(|h| *h != hid);
        }
    }

    /// Unlinks every waiter entry belonging to `req`. Called on request
    /// teardown.
    pub(crate) fn queue_remove(&mut self, req: RequestId) {
        self.waiters.retain(|r| *r != req);
    }

    fn queue_add(&mut self, requests: &mut Requests, req: RequestId) {
        requests.sleep(req);
        if let Some(request) = requests.get_mut(req) {
            request.db_queued = true;
        }
        self.waiters.push_back(req);
        debug!("request {:?} queued for a database session", req);
    }

    fn queue_wakeup(&mut self, requests: &mut Requests) {
        let mut idx = 0;
        while idx < self.waiters.len() {
            let req = self.waiters[idx];
            let alive = requests.get(req).map(|r| !r.deleted()).unwrap_or(false);
            if !alive {
                // left in place; removed by the request's own teardown
                idx += 1;
                continue;
            }

            self.waiters.remove(idx);
            if let Some(request) = requests.get_mut(req) {
                request.db_queued = false;
            }
            requests.wakeup(req);
            return;
        }
    }

    fn session_create(&mut self) -> Result<(), BackendError> {
        let backend = match self.backend.as_deref() {
            Some(backend) => backend,
            None => panic!("database query without a configured backend"),
        };
        let conninfo = match self.conninfo.as_deref() {
            Some(conninfo) => conninfo,
            None => panic!("database query without a connection string"),
        };

        let db = backend.connect(conninfo)?;
        let key = self.sessions.insert(Session {
            db,
            free: true,
            job: None,
            registered: false,
        });
        self.free.push_back(SessionId(key));
        debug!("created database session {key}");
        Ok(())
    }
}

/// Classifies the next pending result into a handle state.
fn read_result(session: &mut Session, handle: &mut QueryHandle) {
    if session.db.is_busy() {
        handle.state = QueryState::Wait;
        return;
    }

    let result = match session.db.next_result() {
        None => {
            handle.state = QueryState::Done;
            return;
        }
        Some(result) => result,
    };

    match result.status() {
        ResultStatus::CopyIn
        | ResultStatus::CopyOut
        | ResultStatus::CopyBoth
        | ResultStatus::NonfatalError => {}
        ResultStatus::CommandOk => handle.state = QueryState::Done,
        ResultStatus::TuplesOk | ResultStatus::SingleTuple => handle.state = QueryState::Result,
        ResultStatus::EmptyQuery | ResultStatus::BadResponse | ResultStatus::FatalError => {
            handle.state = QueryState::Error;
            handle.error = Some(result.error_message().to_owned());
        }
    }
    handle.result = Some(result);
}

/// Callback run before submission; sets the SQL on the control block and may
/// refuse the request by returning `false`.
pub type SimpleInit = fn(&mut Request, &mut SimpleQuery) -> bool;

/// Callback run once per result batch.
pub type SimpleResultFn = fn(&mut Request, &mut SimpleQuery, &QueryResult);

/// Callback run when the query finishes, successfully or not.
pub type SimpleDone = fn(&mut Request, &mut SimpleQuery);

/// Control block for the standard async-query flow.
///
/// `init` must set [`SimpleQuery::sql`]; on failure it should set the
/// request's response status before returning `false`.
pub struct SimpleQuery {
    init: SimpleInit,
    result: Option<SimpleResultFn>,
    done: SimpleDone,
    /// The SQL to run, set by the `init` callback.
    pub sql: Option<String>,
    /// Scratch slot for handler state threaded between callbacks.
    pub udata: Option<Box<dyn Any + Send>>,
    handle: Option<HandleId>,
}

impl SimpleQuery {
    /// Builds a control block with the two mandatory callbacks.
    pub fn new(init: SimpleInit, done: SimpleDone) -> Self {
        Self {
            init,
            result: None,
            done,
            sql: None,
            udata: None,
            handle: None,
        }
    }

    /// Adds the optional per-result-batch callback.
    pub fn with_result(mut self, result: SimpleResultFn) -> Self {
        self.result = Some(result);
        self
    }

    /// The live query handle, once submission has created one.
    pub fn handle(&self) -> Option<HandleId> {
        self.handle
    }
}

impl fmt::Debug for SimpleQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleQuery")
            .field("sql", &self.sql)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

const SIMPLE_STATE_INIT: usize = 0;
const SIMPLE_STATE_QUERY: usize = 1;
const SIMPLE_STATE_WAIT: usize = 2;
const SIMPLE_STATE_RESULT: usize = 3;
const SIMPLE_STATE_DONE: usize = 4;

/// Steps the simple-query driver once for `req`, installing `ctl` on the
/// request the first time through.
pub(crate) fn simple_run(worker: &mut Worker, req: RequestId, ctl: SimpleQuery) -> RunState {
    let state = {
        let Some(request) = worker.requests.get_mut(req) else {
            return RunState::Complete;
        };
        if matches!(request.ext, ReqExt::None) && request.fsm_state == SIMPLE_STATE_INIT {
            request.ext = ReqExt::SimpleQuery(Box::new(ctl));
        }
        request.fsm_state
    };

    match state {
        SIMPLE_STATE_INIT => state_init(worker, req),
        SIMPLE_STATE_QUERY => state_query(worker, req),
        SIMPLE_STATE_WAIT => state_wait(worker, req),
        SIMPLE_STATE_RESULT => state_result(worker, req),
        SIMPLE_STATE_DONE => state_done(worker, req),
        other => panic!("unknown simple query state {other}"),
    }
}

fn take_simple(worker: &mut Worker, req: RequestId) -> Option<Box<SimpleQuery>> {
    let request = worker.requests.get_mut(req)?;
    match std::mem::take(&mut request.ext) {
        ReqExt::SimpleQuery(ctl) => Some(ctl),
        ReqExt::None => None,
    }
}

fn put_simple(worker: &mut Worker, req: RequestId, ctl: Box<SimpleQuery>) {
    if let Some(request) = worker.requests.get_mut(req) {
        request.ext = ReqExt::SimpleQuery(ctl);
    }
}

fn simple_handle(worker: &Worker, req: RequestId) -> Option<HandleId> {
    match worker.requests.get(req)?.ext {
        ReqExt::SimpleQuery(ref ctl) => ctl.handle,
        ReqExt::None => None,
    }
}

fn state_init(worker: &mut Worker, req: RequestId) -> RunState {
    let Some(mut ctl) = take_simple(worker, req) else {
        return RunState::Complete;
    };
    ctl.sql = None;
    ctl.udata = None;
    ctl.handle = None;

    let ok = match worker.requests.get_mut(req) {
        Some(request) => (ctl.init)(request, &mut ctl),
        None => false,
    };
    if !ok {
        return RunState::Complete;
    }

    put_simple(worker, req, ctl);
    worker.requests.set_fsm(req, SIMPLE_STATE_QUERY);
    RunState::Continue
}

fn state_query(worker: &mut Worker, req: RequestId) -> RunState {
    let Some(mut ctl) = take_simple(worker, req) else {
        return RunState::Complete;
    };
    let sql = match ctl.sql.as_deref() {
        Some(sql) => sql.to_owned(),
        None => panic!("no query set after simple query init"),
    };

    worker.requests.set_fsm(req, SIMPLE_STATE_WAIT);

    let submitted = {
        let Worker {
            requests,
            executor,
            poll,
            ..
        } = worker;
        executor.submit(requests, poll.registry(), req, &sql)
    };

    match submitted {
        Submitted::Busy => {
            worker.requests.set_fsm(req, SIMPLE_STATE_QUERY);
            put_simple(worker, req, ctl);
            RunState::Retry
        }
        Submitted::Ok(hid) | Submitted::Failed(hid) => {
            ctl.handle = Some(hid);
            put_simple(worker, req, ctl);
            RunState::Continue
        }
    }
}

fn state_wait(worker: &mut Worker, req: RequestId) -> RunState {
    let Some(hid) = simple_handle(worker, req) else {
        return RunState::Complete;
    };
    let Some(state) = worker.executor.handle(hid).map(QueryHandle::state) else {
        return RunState::Complete;
    };

    match state {
        QueryState::Wait => RunState::Retry,
        QueryState::Complete => {
            worker.requests.set_fsm(req, SIMPLE_STATE_DONE);
            RunState::Continue
        }
        QueryState::Error => {
            let text = worker
                .executor
                .handle(hid)
                .and_then(QueryHandle::error)
                .unwrap_or("unknown")
                .to_owned();
            error!("pgsql error: {text}");
            if let Some(request) = worker.requests.get_mut(req) {
                request.status = Status::InternalServerError;
            }
            worker.requests.set_fsm(req, SIMPLE_STATE_DONE);
            RunState::Continue
        }
        QueryState::Result => {
            worker.requests.set_fsm(req, SIMPLE_STATE_RESULT);
            RunState::Continue
        }
        QueryState::Init | QueryState::Done => {
            let Worker {
                requests,
                executor,
                poll,
                ..
            } = worker;
            executor.continue_handle(requests, poll.registry(), hid);
            RunState::Continue
        }
    }
}

fn state_result(worker: &mut Worker, req: RequestId) -> RunState {
    let Some(mut ctl) = take_simple(worker, req) else {
        return RunState::Complete;
    };

    if let Some(result_cb) = ctl.result {
        let hid = ctl.handle;
        let Worker {
            requests, executor, ..
        } = worker;
        if let (Some(request), Some(result)) = (
            requests.get_mut(req),
            hid.and_then(|h| executor.handle(h)).and_then(QueryHandle::result),
        ) {
            result_cb(request, &mut ctl, result);
        }
    }

    put_simple(worker, req, ctl);
    worker.requests.set_fsm(req, SIMPLE_STATE_DONE);
    RunState::Continue
}

fn state_done(worker: &mut Worker, req: RequestId) -> RunState {
    let Some(mut ctl) = take_simple(worker, req) else {
        return RunState::Complete;
    };

    if let Some(request) = worker.requests.get_mut(req) {
        (ctl.done)(request, &mut ctl);
    }

    if let Some(hid) = ctl.handle {
        let Worker {
            requests,
            executor,
            poll,
            ..
        } = worker;
        executor.cleanup_handle(requests, poll.registry(), hid);
    }

    RunState::Complete
}
