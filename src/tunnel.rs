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

//! Anything-over-HTTP tunneling.
//!
//! The handler promotes a live client connection into one half of a byte
//! pipe: it dials the requested `host:port`, cross-links the two connections
//! through their extension slots, and re-arms both receive paths to relay
//! chunks verbatim until either side closes.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};

use log::{error, info, trace};
use mio::Token;

use crate::connection::{ConnExt, Proto, RecvDispatch};
use crate::http::{RequestId, RunState, Status};
use crate::worker::Worker;

/// Request handler opening a tunnel toward `host:port` from the query
/// string.
///
/// Replies `400 Bad Request` for non-HTTP connections and missing or invalid
/// parameters, `500` when the target cannot be dialed, and `200 OK` right
/// before the connection stops speaking HTTP.
pub fn open_connection(worker: &mut Worker, req: RequestId) -> RunState {
    let (owner, host, port) = {
        let Some(request) = worker.requests.get(req) else {
            return RunState::Complete;
        };
        (
            request.owner(),
            request.arg("host").map(str::to_owned),
            request.arg("port").map(str::to_owned),
        )
    };

    // refuse connections already promoted away from plain HTTP
    let proto = worker.conns.get(owner.0).map(|c| c.proto);
    if proto != Some(Proto::Http) {
        worker.respond(req, Status::BadRequest, b"");
        return RunState::Complete;
    }

    let (Some(host), Some(port)) = (host, port) else {
        worker.respond(req, Status::BadRequest, b"");
        return RunState::Complete;
    };

    let Ok(addr) = host.parse::<Ipv4Addr>() else {
        error!("invalid host given {host}");
        worker.respond(req, Status::BadRequest, b"");
        return RunState::Complete;
    };
    let port = match port.parse::<u16>() {
        Ok(port) if (1..=0x7fff).contains(&port) => port,
        _ => {
            error!("invalid port given {port}");
            worker.respond(req, Status::BadRequest, b"");
            return RunState::Complete;
        }
    };

    if let Err(err) = pipe_create(worker, owner, SocketAddrV4::new(addr, port)) {
        error!("connect(): {err}");
        worker.respond(req, Status::InternalServerError, b"");
        return RunState::Complete;
    }

    // Assert close-when-empty around the response so it does not queue a
    // fresh HTTP receive on a connection that just stopped speaking HTTP.
    if let Some(conn) = worker.conns.get_mut(owner.0) {
        conn.close_empty = true;
    }
    worker.respond(req, Status::Ok, b"");
    if let Some(conn) = worker.conns.get_mut(owner.0) {
        conn.close_empty = false;
    }

    RunState::Complete
}

/// Dials the target and couples the resulting connection with `client`.
fn pipe_create(worker: &mut Worker, client: Token, addr: SocketAddrV4) -> io::Result<()> {
    info!("attempting to connect to {addr}");

    let stream = TcpStream::connect(SocketAddr::V4(addr))?;
    stream.set_nonblocking(true)?;
    let stream = mio::net::TcpStream::from_std(stream);

    let peer = worker.add_connection(stream, Proto::Unknown, RecvDispatch::Pipe)?;

    // Cross-link the pair and install the symmetric disconnect hook. Any
    // bytes the client pipelined behind the request head become the first
    // outbound chunk.
    let residue = match worker.conns.get_mut(client.0) {
        Some(conn) => {
            conn.ext = ConnExt::PipePeer(peer);
            conn.disconnect = Some(pipe_disconnect);
            conn.recv = RecvDispatch::Pipe;
            conn.recv_buf.take_all()
        }
        None => Vec::new(),
    };
    if let Some(conn) = worker.conns.get_mut(peer.0) {
        conn.ext = ConnExt::PipePeer(client);
        conn.disconnect = Some(pipe_disconnect);
        if !residue.is_empty() {
            conn.send(residue);
        }
    }
    worker.flush_conn(peer);

    trace!("connection started to {addr} ({client:?} -> {peer:?})");
    Ok(())
}

/// Called every time new data is read on either side of a pipe: forwards the
/// chunk to the peer's send queue and flushes it.
pub(crate) fn pipe_data(worker: &mut Worker, token: Token) {
    let (chunk, peer) = match worker.conns.get_mut(token.0) {
        Some(conn) => (conn.recv_buf.take_all(), conn.ext.peer()),
        None => return,
    };
    if chunk.is_empty() {
        return;
    }

    trace!("received {} bytes on pipe {token:?} (-> {peer:?})", chunk.len());

    // link already torn down; the bytes have nowhere to go
    let Some(peer) = peer else {
        return;
    };
    match worker.conns.get_mut(peer.0) {
        Some(conn) => conn.send(chunk),
        None => return,
    }
    worker.flush_conn(peer);
}

/// Disconnect hook shared by both halves of a pipe. Clears both extension
/// slots before requesting the peer's disconnect, so the mirrored invocation
/// finds the link already gone.
pub(crate) fn pipe_disconnect(worker: &mut Worker, token: Token) {
    let peer = match worker.conns.get(token.0) {
        Some(conn) => conn.ext.peer(),
        None => None,
    };
    trace!("pipe disconnect {token:?} -> {peer:?}");

    if let Some(peer) = peer {
        if let Some(conn) = worker.conns.get_mut(token.0) {
            conn.ext = ConnExt::None;
        }
        if let Some(conn) = worker.conns.get_mut(peer.0) {
            conn.ext = ConnExt::None;
        }
        worker.disconnect(peer);
    }
}
