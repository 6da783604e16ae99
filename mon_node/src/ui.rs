// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Operator surface.
//!
//! Pushes a JSON snapshot of the server state over the framed transport on
//! every change and accepts `set_rank` requests. Any other request type
//! closes the requesting connection.

use crate::observer::server::ServerState;
use crate::observer::{closed_wait, CMD_CHANNEL_SIZE, CONN_OUTBOX_SIZE};
use crate::{Error, Result};

use mon_comms::{Connection, ConnectionReader, ConnectionWriter};
use mon_interface::Cid;

use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    task::{self, JoinHandle},
};
use tracing::{debug, warn};

/// An operator's request to change a component's rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetRankRequest {
    /// Targeted component.
    pub cid: Cid,
    /// New rank.
    pub rank: i64,
}

/// UI server.
///
/// For creating a new instance of this struct see [`UiServer::listen`],
/// which also yields the stream of operator requests.
#[derive(Debug)]
pub struct UiServer {
    local_addr: SocketAddr,
    cmd_tx: mpsc::Sender<Cmd>,
    closed_rx: watch::Receiver<bool>,
    actor: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

enum Cmd {
    Connected(Connection),
    ConnGone {
        id: u64,
    },
    Request {
        id: u64,
        body: Vec<u8>,
    },
    SetState {
        state: Box<ServerState>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

impl UiServer {
    /// Create a listening UI server seeded with the current server state.
    pub async fn listen(
        addr: SocketAddr,
        state: ServerState,
    ) -> Result<(Self, mpsc::Receiver<SetRankRequest>)> {
        let listener = mon_comms::listen(addr).await?;
        let local_addr = listener.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let (request_tx, request_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let (closed_tx, closed_rx) = watch::channel(false);

        let actor = Actor {
            cmd_tx: cmd_tx.clone(),
            request_tx,
            closed_tx,
            snapshot: snapshot_bytes(&state),
            next_id: 1,
            conns: HashMap::new(),
        };
        let actor = task::spawn(actor.run(cmd_rx));
        let acceptor = task::spawn(accept_loop(listener, cmd_tx.clone()));

        debug!("ui server listening on {local_addr}");
        Ok((
            Self {
                local_addr,
                cmd_tx,
                closed_rx,
                actor,
                acceptor,
            },
            request_rx,
        ))
    }

    /// The address operator clients connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Push a fresh server state to every operator client.
    pub async fn set_state(&self, state: &ServerState) -> Result<()> {
        self.cmd_tx
            .send(Cmd::SetState {
                state: Box::new(state.clone()),
            })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Shut the UI server down.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
        self.acceptor.abort();
        self.actor.abort();
    }

    /// Resolves once the UI server has shut down.
    pub async fn closed(&self) {
        closed_wait(self.closed_rx.clone()).await
    }
}

impl Drop for UiServer {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.actor.abort();
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UiRequest {
    SetRank { cid: Cid, rank: i64 },
}

async fn accept_loop(listener: TcpListener, cmd_tx: mpsc::Sender<Cmd>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("accepted ui connection from {addr}");
                match Connection::new(stream) {
                    Ok(conn) => {
                        if cmd_tx.send(Cmd::Connected(conn)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => debug!("discarding ui connection from {addr}: {error}"),
                }
            }
            Err(error) => warn!("accepting ui connection failed: {error}"),
        }
    }
}

async fn ui_read_loop(id: u64, mut reader: ConnectionReader, cmd_tx: mpsc::Sender<Cmd>) {
    loop {
        match reader.recv_frame().await {
            Ok(body) => {
                if cmd_tx.send(Cmd::Request { id, body }).await.is_err() {
                    break;
                }
            }
            Err(error) => {
                debug!("ui connection lost (id: {id}): {error}");
                break;
            }
        }
    }
    let _ = cmd_tx.send(Cmd::ConnGone { id }).await;
}

async fn ui_write_loop(mut writer: ConnectionWriter, mut outbox: mpsc::Receiver<Vec<u8>>) {
    while let Some(body) = outbox.recv().await {
        if let Err(error) = writer.send_frame(&body).await {
            debug!("write to ui client failed: {error}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct UiConnHandle {
    outbox: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
}

struct Actor {
    cmd_tx: mpsc::Sender<Cmd>,
    request_tx: mpsc::Sender<SetRankRequest>,
    closed_tx: watch::Sender<bool>,
    snapshot: Vec<u8>,
    next_id: u64,
    conns: HashMap<u64, UiConnHandle>,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Cmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Cmd::Connected(conn) => self.handle_connected(conn),
                Cmd::ConnGone { id } => self.drop_conn(id),
                Cmd::Request { id, body } => self.handle_request(id, &body),
                Cmd::SetState { state } => self.handle_set_state(&state),
                Cmd::Shutdown { ack } => {
                    for (_, handle) in self.conns.drain() {
                        handle.reader.abort();
                    }
                    let _ = ack.send(());
                    break;
                }
            }
        }
        let _ = self.closed_tx.send(true);
    }

    fn handle_connected(&mut self, conn: Connection) {
        let id = self.next_id;
        self.next_id += 1;

        let (reader, writer) = conn.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(CONN_OUTBOX_SIZE);
        let _writer = task::spawn(ui_write_loop(writer, outbox_rx));
        let reader = task::spawn(ui_read_loop(id, reader, self.cmd_tx.clone()));

        // Seed the fresh client with the current snapshot.
        let seeded = outbox_tx.try_send(self.snapshot.clone()).is_ok();
        if seeded {
            let _ = self.conns.insert(
                id,
                UiConnHandle {
                    outbox: outbox_tx,
                    reader,
                },
            );
        } else {
            reader.abort();
        }
    }

    fn handle_request(&mut self, id: u64, body: &[u8]) {
        match serde_json::from_slice::<UiRequest>(body) {
            Ok(UiRequest::SetRank { cid, rank }) => {
                debug!("received set_rank request (cid: {cid}, rank: {rank})");
                if self.request_tx.try_send(SetRankRequest { cid, rank }).is_err() {
                    warn!("dropping set_rank request, consumer not keeping up");
                }
            }
            Err(error) => {
                warn!("invalid ui request (id: {id}): {error}");
                self.drop_conn(id);
            }
        }
    }

    fn handle_set_state(&mut self, state: &ServerState) {
        self.snapshot = snapshot_bytes(state);

        let mut dead = Vec::new();
        for (id, handle) in &self.conns {
            if handle.outbox.try_send(self.snapshot.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            debug!("dropping unresponsive ui connection (id: {id})");
            self.drop_conn(id);
        }
    }

    fn drop_conn(&mut self, id: u64) {
        if let Some(handle) = self.conns.remove(&id) {
            handle.reader.abort();
        }
    }
}

fn snapshot_bytes(state: &ServerState) -> Vec<u8> {
    // Serialising a `Value` built from plain maps cannot fail.
    serde_json::to_vec(&snapshot(state)).unwrap_or_else(|_| b"{}".to_vec())
}

fn snapshot(state: &ServerState) -> serde_json::Value {
    let local_components: Vec<_> = state
        .local_components
        .iter()
        .map(|info| {
            json!({
                "cid": info.cid,
                "name": info.name,
                "group": info.group,
                "data": info.data,
                "rank": info.rank,
            })
        })
        .collect();

    let global_components: Vec<_> = state
        .global_components
        .iter()
        .map(|info| {
            json!({
                "cid": info.cid,
                "mid": info.mid,
                "name": info.name,
                "group": info.group,
                "data": info.data,
                "rank": info.rank,
                "blessing_req": {
                    "token": info.blessing_req.token,
                    "timestamp": info.blessing_req.timestamp,
                },
                "blessing_res": {
                    "token": info.blessing_res.token,
                    "ready": info.blessing_res.ready,
                },
            })
        })
        .collect();

    json!({
        "mid": state.mid,
        "local_components": local_components,
        "global_components": global_components,
    })
}
