//! End-to-end query tests: a worker on one thread serving handlers built on
//! the simple-query driver, against a scripted backend whose sessions signal
//! readiness through real descriptors.

mod support;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use sluse::pgsql::backend::{Backend, QueryResult};
use sluse::worker::HandlerFn;
use sluse::{Config, Request, RequestId, RunState, SimpleQuery, Worker};

use support::{http_get, start_worker, MockBackend, Script};

fn one_handler(worker: &mut Worker, req: RequestId) -> RunState {
    worker.simple_query(req, SimpleQuery::new(init_one, done_plain).with_result(result_rows))
}

fn slow_handler(worker: &mut Worker, req: RequestId) -> RunState {
    worker.simple_query(req, SimpleQuery::new(init_slow, done_plain).with_result(result_rows))
}

fn bad_handler(worker: &mut Worker, req: RequestId) -> RunState {
    worker.simple_query(req, SimpleQuery::new(init_bad, done_plain).with_result(result_rows))
}

fn init_one(_req: &mut Request, ctl: &mut SimpleQuery) -> bool {
    ctl.sql = Some("SELECT 1".to_owned());
    true
}

fn init_slow(_req: &mut Request, ctl: &mut SimpleQuery) -> bool {
    ctl.sql = Some("SELECT slow".to_owned());
    true
}

fn init_bad(_req: &mut Request, ctl: &mut SimpleQuery) -> bool {
    ctl.sql = Some("SELECT * FROM does_not_exist".to_owned());
    true
}

fn result_rows(req: &mut Request, _ctl: &mut SimpleQuery, result: &QueryResult) {
    let mut body = Vec::new();
    for row in 0..result.ntuples() {
        body.extend_from_slice(result.value(row, 0).unwrap_or("").as_bytes());
        body.push(b'\n');
    }
    req.body = body;
}

fn done_plain(_req: &mut Request, _ctl: &mut SimpleQuery) {}

fn routes() -> Vec<(&'static str, HandlerFn)> {
    vec![
        ("/one", one_handler as HandlerFn),
        ("/slow", slow_handler as HandlerFn),
        ("/bad", bad_handler as HandlerFn),
    ]
}

fn scripted_backend(slow_delay: Duration) -> Box<dyn Backend> {
    Box::new(MockBackend::new(vec![
        (
            "SELECT 1",
            Script::rows(vec![vec!["1"]], Duration::from_millis(20)),
        ),
        ("SELECT slow", Script::rows(vec![vec!["done"]], slow_delay)),
        (
            "SELECT * FROM does_not_exist",
            Script::fatal(
                "relation \"does_not_exist\" does not exist",
                Duration::from_millis(20),
            ),
        ),
    ]))
}

fn db_config(sessions: usize) -> Config {
    let mut config = Config::default();
    config.conninfo = Some("host=mock".to_owned());
    config.db_sessions_max = sessions;
    config
}

#[test]
fn single_query_parks_and_delivers_one_row() {
    let (addr, shutdown, join) = start_worker(
        db_config(2),
        &routes(),
        Some(scripted_backend(Duration::from_millis(100))),
    );

    let (status, body) = http_get(addr, "/one");
    assert_eq!(status, 200);
    assert_eq!(body, "1\n");

    shutdown.shutdown();
    join.join().unwrap();
}

#[test]
fn query_error_becomes_500_and_the_pool_recovers() {
    let (addr, shutdown, join) = start_worker(
        db_config(2),
        &routes(),
        Some(scripted_backend(Duration::from_millis(100))),
    );

    let (status, _) = http_get(addr, "/bad");
    assert_eq!(status, 500);

    // the errored session was finalized; a fresh one serves the next query
    let (status, body) = http_get(addr, "/one");
    assert_eq!(status, 200);
    assert_eq!(body, "1\n");

    shutdown.shutdown();
    join.join().unwrap();
}

#[test]
fn saturated_pool_wakes_waiters_in_arrival_order() {
    let (addr, shutdown, join) = start_worker(
        db_config(2),
        &routes(),
        Some(scripted_backend(Duration::from_millis(300))),
    );

    let (tx, rx) = mpsc::channel();
    let mut clients = Vec::new();
    for idx in 1..=3 {
        let tx = tx.clone();
        clients.push(thread::spawn(move || {
            let (status, body) = http_get(addr, "/slow");
            assert_eq!(status, 200);
            assert_eq!(body, "done\n");
            tx.send(idx).unwrap();
        }));
        // fix the arrival order
        thread::sleep(Duration::from_millis(50));
    }

    let mut finished = Vec::new();
    for _ in 0..3 {
        finished.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert_eq!(finished, vec![1, 2, 3]);

    for client in clients {
        client.join().unwrap();
    }
    shutdown.shutdown();
    join.join().unwrap();
}

#[test]
fn disconnected_waiter_is_skipped_on_wakeup() {
    let (addr, shutdown, join) = start_worker(
        db_config(1),
        &routes(),
        Some(scripted_backend(Duration::from_millis(400))),
    );

    // first query occupies the only session
    let first = thread::spawn(move || {
        let (status, body) = http_get(addr, "/slow");
        assert_eq!(status, 200);
        assert_eq!(body, "done\n");
    });
    thread::sleep(Duration::from_millis(50));

    // second request parks on the waiter queue, then its client vanishes
    let mut doomed = support::connect(addr);
    support::send_request(&mut doomed, "/slow");
    thread::sleep(Duration::from_millis(50));
    drop(doomed);

    // third request parks behind the doomed one
    let third = thread::spawn(move || {
        let (status, body) = http_get(addr, "/slow");
        assert_eq!(status, 200);
        assert_eq!(body, "done\n");
    });

    first.join().unwrap();
    third.join().unwrap();

    shutdown.shutdown();
    join.join().unwrap();
}

#[test]
fn submission_failure_surfaces_as_500() {
    let (addr, shutdown, join) = start_worker(
        db_config(2),
        &[("/one", one_handler as HandlerFn)],
        Some(Box::new(MockBackend::new(vec![(
            "SELECT 1",
            Script::SendError("no COPY in progress".to_owned()),
        )]))),
    );

    let (status, _) = http_get(addr, "/one");
    assert_eq!(status, 500);

    shutdown.shutdown();
    join.join().unwrap();
}
