//! Shared plumbing for the integration suites: a worker-on-a-thread runner,
//! a scripted mock database backend whose sessions signal readiness through
//! real socket pairs, and a bare-bones HTTP client.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sluse::pgsql::backend::{Backend, BackendConn, BackendError, QueryResult, ResultStatus};
use sluse::worker::HandlerFn;
use sluse::{Config, Worker, WorkerHandle};

/// Scripted outcome for one SQL string.
#[derive(Debug, Clone)]
pub enum Script {
    /// Deliver these results after `delay`.
    Results {
        results: Vec<QueryResult>,
        delay: Duration,
    },
    /// Fail the submission itself.
    SendError(String),
}

impl Script {
    pub fn rows(rows: Vec<Vec<&str>>, delay: Duration) -> Self {
        let rows = rows
            .into_iter()
            .map(|r| r.into_iter().map(str::to_owned).collect())
            .collect();
        Script::Results {
            results: vec![QueryResult::new(ResultStatus::TuplesOk, rows)],
            delay,
        }
    }

    pub fn fatal(message: &str, delay: Duration) -> Self {
        Script::Results {
            results: vec![QueryResult::error(ResultStatus::FatalError, message)],
            delay,
        }
    }
}

/// A backend whose sessions replay scripted results, signalling readiness by
/// writing a byte across a socket pair after the scripted delay.
#[derive(Debug)]
pub struct MockBackend {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
}

impl MockBackend {
    pub fn new(scripts: Vec<(&str, Script)>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(
                scripts
                    .into_iter()
                    .map(|(sql, script)| (sql.to_owned(), script))
                    .collect(),
            )),
        }
    }
}

impl Backend for MockBackend {
    fn connect(&self, conninfo: &str) -> Result<Box<dyn BackendConn>, BackendError> {
        if conninfo == "host=unreachable" {
            return Err(BackendError("could not connect to server".to_owned()));
        }
        let (sock, peer) = UnixStream::pair().map_err(|e| BackendError(e.to_string()))?;
        sock.set_nonblocking(true)
            .map_err(|e| BackendError(e.to_string()))?;
        Ok(Box::new(MockConn {
            sock,
            peer,
            scripts: self.scripts.clone(),
            pending: VecDeque::new(),
            busy: false,
            error: String::new(),
        }))
    }
}

#[derive(Debug)]
pub struct MockConn {
    sock: UnixStream,
    peer: UnixStream,
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    pending: VecDeque<QueryResult>,
    busy: bool,
    error: String,
}

impl BackendConn for MockConn {
    fn socket(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn send_query(&mut self, sql: &str) -> Result<(), BackendError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .unwrap_or(Script::Results {
                results: vec![QueryResult::new(ResultStatus::CommandOk, Vec::new())],
                delay: Duration::from_millis(10),
            });

        match script {
            Script::SendError(message) => {
                self.error = message.clone();
                Err(BackendError(message))
            }
            Script::Results { results, delay } => {
                for result in &results {
                    if result.status() == ResultStatus::FatalError {
                        self.error = result.error_message().to_owned();
                    }
                }
                self.pending = results.into();
                self.busy = true;

                let peer = self.peer.try_clone().expect("clone signal socket");
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = (&peer).write_all(&[1]);
                });
                Ok(())
            }
        }
    }

    fn consume_input(&mut self) -> Result<(), BackendError> {
        let mut buf = [0u8; 16];
        loop {
            match (&self.sock).read(&mut buf) {
                Ok(0) => return Err(BackendError("server closed the connection".to_owned())),
                Ok(_) => self.busy = false,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(BackendError(e.to_string())),
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    fn next_result(&mut self) -> Option<QueryResult> {
        self.pending.pop_front()
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }
}

/// Runs a worker on its own thread, returning its bound address and the
/// means to stop it.
pub fn start_worker(
    mut config: Config,
    routes: &[(&str, HandlerFn)],
    backend: Option<Box<dyn Backend>>,
) -> (SocketAddr, WorkerHandle, JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    config.bind = "127.0.0.1:0".parse().unwrap();

    let mut worker = Worker::new(config).expect("bind worker");
    if let Some(backend) = backend {
        worker.set_backend(backend);
    }
    for (path, handler) in routes {
        worker.handle(path, *handler);
    }

    let addr = worker.local_addr().expect("local addr");
    let handle = worker.shutdown_handle();
    let join = thread::spawn(move || worker.run());
    (addr, handle, join)
}

/// Connects with generous timeouts so a hung test fails instead of stalling.
pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

pub fn send_request(stream: &mut TcpStream, target: &str) {
    let request = format!("GET {target} HTTP/1.1\r\nhost: test\r\n\r\n");
    stream.write_all(request.as_bytes()).expect("send request");
}

/// Reads one response head, byte by byte so nothing beyond the blank line is
/// consumed, and returns the status code with the raw head text.
pub fn read_head(stream: &mut TcpStream) -> (u16, String) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            Ok(_) => panic!("connection closed mid-head: {head:?}"),
            Err(e) => panic!("read failed mid-head: {e}"),
        }
        assert!(head.len() < 65536, "unterminated response head");
    }

    let text = String::from_utf8(head).expect("utf8 head");
    let status = text
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .expect("status code");
    (status, text)
}

/// Reads the response body according to the head's content-length.
pub fn read_body(stream: &mut TcpStream, head: &str) -> Vec<u8> {
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).expect("read body");
    body
}

/// One whole request/response exchange on a fresh connection.
pub fn http_get(addr: SocketAddr, target: &str) -> (u16, String) {
    let mut stream = connect(addr);
    send_request(&mut stream, target);
    let (status, head) = read_head(&mut stream);
    let body = read_body(&mut stream, &head);
    (status, String::from_utf8_lossy(&body).into_owned())
}
