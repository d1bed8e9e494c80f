//! Anything-over-HTTP tunnel demo.
//!
//! Run it, then ask it for a pipe toward some TCP service:
//!
//! ```text
//! cargo run --example tunnel 127.0.0.1:8888
//! curl http://127.0.0.1:8888/tunnel?host=127.0.0.1&port=6379
//! ```
//!
//! After the `200 OK`, the connection relays raw bytes in both directions.

use sluse::{Config, Worker};

fn main() -> Result<(), sluse::Error> {
    env_logger::init();

    let mut config = Config::default();
    if let Some(bind) = std::env::args().nth(1) {
        config.bind = bind.parse().expect("bind address like 127.0.0.1:8888");
    }

    let mut worker = Worker::new(config)?;
    worker.handle("/tunnel", sluse::tunnel::open_connection);

    println!("listening on {}", worker.local_addr()?);
    worker.run();
    Ok(())
}
