// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Observer Server.
//!
//! Accepts component connections, assigns local cids, owns the local
//! component list and fans the global view out to every connected
//! component. All state lives in one actor task; the accept loop and the
//! per-connection reader/writer tasks only move messages in and out.

use super::{closed_wait, write_loop, CMD_CHANNEL_SIZE, CONN_OUTBOX_SIZE};
use crate::{Error, Result};

use mon_comms::{Connection, ConnectionReader, Error as CommsError};
use mon_interface::messaging::{MsgClient, MsgServer, ObserverMsg};
use mon_interface::{BlessingReq, BlessingRes, Cid, ComponentInfo, Mid};

use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    task::{self, JoinHandle},
    time,
};
use tracing::{debug, warn};

/// How long a closing server waits for its components to hang up after
/// being asked to, before forcing the connections.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// The server's combined view: its place in the federation and both
/// component lists.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServerState {
    /// Mid assigned to this server by the active master.
    pub mid: Mid,
    /// Components connected to this server.
    pub local_components: Vec<ComponentInfo>,
    /// Federation-wide component list.
    pub global_components: Vec<ComponentInfo>,
}

/// Observer Server.
///
/// For creating a new instance of this struct see [`Server::listen`].
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<ServerState>,
    closed_rx: watch::Receiver<bool>,
    actor: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

enum Cmd {
    Connected(Connection),
    ClientMsg {
        cid: Cid,
        msg: MsgClient,
    },
    ClientGone {
        cid: Cid,
    },
    Update {
        mid: Mid,
        global_components: Vec<ComponentInfo>,
        ack: oneshot::Sender<()>,
    },
    SetRank {
        cid: Cid,
        rank: i64,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

impl Server {
    /// Create a listening Observer Server.
    pub async fn listen(
        addr: SocketAddr,
        default_rank: i64,
        close_timeout: Duration,
    ) -> Result<Self> {
        let listener = mon_comms::listen(addr).await?;
        let local_addr = listener.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ServerState::default());
        let (closed_tx, closed_rx) = watch::channel(false);

        let actor = Actor {
            default_rank,
            close_timeout,
            cmd_tx: cmd_tx.clone(),
            state_tx,
            closed_tx,
            state: ServerState::default(),
            next_cid: 1,
            clients: HashMap::new(),
            rank_cache: HashMap::new(),
        };
        let actor = task::spawn(actor.run(cmd_rx));
        let acceptor = task::spawn(accept_loop(listener, cmd_tx.clone()));

        debug!("observer server listening on {local_addr}");
        Ok(Self {
            local_addr,
            cmd_tx,
            state_rx,
            closed_rx,
            actor,
            acceptor,
        })
    }

    /// The address components connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current server state.
    pub fn state(&self) -> ServerState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ServerState> {
        self.state_rx.clone()
    }

    /// Update the server's monitor id and global components, as decided by
    /// the active master. Completes once the change has been applied and
    /// broadcast to every connected component.
    pub async fn update(&self, mid: Mid, global_components: Vec<ComponentInfo>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Update {
                mid,
                global_components,
                ack,
            })
            .await
            .map_err(|_| Error::Closed)?;
        done.await.map_err(|_| Error::Closed)
    }

    /// Set a component's rank. A no-op on an unknown cid.
    pub async fn set_rank(&self, cid: Cid, rank: i64) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::SetRank { cid, rank, ack })
            .await
            .map_err(|_| Error::Closed)?;
        done.await.map_err(|_| Error::Closed)
    }

    /// Shut the server down, asking every component to hang up first.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
        self.acceptor.abort();
        self.actor.abort();
    }

    /// Resolves once the server has shut down.
    pub async fn closed(&self) {
        closed_wait(self.closed_rx.clone()).await
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.actor.abort();
    }
}

async fn accept_loop(listener: TcpListener, cmd_tx: mpsc::Sender<Cmd>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("accepted component connection from {addr}");
                match Connection::new(stream) {
                    Ok(conn) => {
                        if cmd_tx.send(Cmd::Connected(conn)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => debug!("discarding connection from {addr}: {error}"),
                }
            }
            Err(error) => warn!("accepting component connection failed: {error}"),
        }
    }
}

async fn client_read_loop(cid: Cid, mut reader: ConnectionReader, cmd_tx: mpsc::Sender<Cmd>) {
    loop {
        match reader.recv().await {
            Ok(ObserverMsg::Client(msg)) => {
                debug!("received client message (cid: {cid})");
                if cmd_tx.send(Cmd::ClientMsg { cid, msg }).await.is_err() {
                    break;
                }
            }
            Ok(msg) => {
                warn!("unsupported {} from component (cid: {cid})", msg.name());
                break;
            }
            Err(CommsError::Closed) => {
                debug!("component connection closed (cid: {cid})");
                break;
            }
            Err(error) => {
                debug!("component connection lost (cid: {cid}): {error}");
                break;
            }
        }
    }
    let _ = cmd_tx.send(Cmd::ClientGone { cid }).await;
}

struct ClientHandle {
    outbox: mpsc::Sender<ObserverMsg>,
    reader: JoinHandle<()>,
}

struct Actor {
    default_rank: i64,
    close_timeout: Duration,
    cmd_tx: mpsc::Sender<Cmd>,
    state_tx: watch::Sender<ServerState>,
    closed_tx: watch::Sender<bool>,
    state: ServerState,
    next_cid: Cid,
    clients: HashMap<Cid, ClientHandle>,
    rank_cache: HashMap<(String, Option<String>), i64>,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Cmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Cmd::Connected(conn) => self.handle_connected(conn),
                Cmd::ClientMsg { cid, msg } => self.handle_client_msg(cid, msg),
                Cmd::ClientGone { cid } => self.handle_client_gone(cid),
                Cmd::Update {
                    mid,
                    global_components,
                    ack,
                } => {
                    self.handle_update(mid, global_components);
                    let _ = ack.send(());
                }
                Cmd::SetRank { cid, rank, ack } => {
                    self.handle_set_rank(cid, rank);
                    let _ = ack.send(());
                }
                Cmd::Shutdown { ack } => {
                    self.shutdown().await;
                    let _ = ack.send(());
                    break;
                }
            }
        }
        let _ = self.closed_tx.send(true);
    }

    fn handle_connected(&mut self, conn: Connection) {
        let cid = self.next_cid;
        self.next_cid += 1;

        let (reader, writer) = conn.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(CONN_OUTBOX_SIZE);
        let _writer = task::spawn(write_loop(writer, outbox_rx));
        let reader = task::spawn(client_read_loop(cid, reader, self.cmd_tx.clone()));
        let _ = self.clients.insert(
            cid,
            ClientHandle {
                outbox: outbox_tx,
                reader,
            },
        );

        debug!("component registered (cid: {cid})");
        let mut local_components = self.state.local_components.clone();
        local_components.push(self.init_info(cid));
        self.change_state(
            self.state.mid,
            local_components,
            self.state.global_components.clone(),
        );
    }

    fn handle_client_msg(&mut self, cid: Cid, msg: MsgClient) {
        let Some(position) = self
            .state
            .local_components
            .iter()
            .position(|info| info.cid == cid)
        else {
            warn!("client message for unknown component (cid: {cid})");
            return;
        };

        let info = &self.state.local_components[position];
        let mut updated = info.clone();
        updated.name = Some(msg.name);
        updated.group = Some(msg.group);
        updated.data = msg.data;
        updated.blessing_res = msg.blessing_res;

        // The first client message names the component; a reconnecting
        // component inherits the rank last known for that (name, group).
        if info.name.is_none() {
            if let Some(name) = &updated.name {
                let key = (name.clone(), updated.group.clone());
                if let Some(rank) = self.rank_cache.get(&key) {
                    updated.rank = *rank;
                }
                let _ = self.rank_cache.insert(key, updated.rank);
            }
        }

        if *info == updated {
            return;
        }

        let mut local_components = self.state.local_components.clone();
        local_components[position] = updated;
        self.change_state(
            self.state.mid,
            local_components,
            self.state.global_components.clone(),
        );
    }

    fn handle_client_gone(&mut self, cid: Cid) {
        let Some(handle) = self.clients.remove(&cid) else {
            return;
        };
        debug!("component removed (cid: {cid})");

        // Ask the peer to shut down cleanly; on an already dead link the
        // queued message is lost together with the connection.
        let _ = handle.outbox.try_send(ObserverMsg::Close);
        handle.reader.abort();

        let local_components = self
            .state
            .local_components
            .iter()
            .filter(|info| info.cid != cid)
            .cloned()
            .collect();
        self.change_state(
            self.state.mid,
            local_components,
            self.state.global_components.clone(),
        );
    }

    fn handle_update(&mut self, mid: Mid, global_components: Vec<ComponentInfo>) {
        if mid == self.state.mid && global_components == self.state.global_components {
            return;
        }

        // Blessing decisions for local components follow the master's view.
        let blessing_reqs: HashMap<Cid, BlessingReq> = global_components
            .iter()
            .filter(|info| info.mid == mid)
            .map(|info| (info.cid, info.blessing_req))
            .collect();

        let local_components = self
            .state
            .local_components
            .iter()
            .cloned()
            .map(|mut info| {
                info.blessing_req = blessing_reqs
                    .get(&info.cid)
                    .copied()
                    .unwrap_or(info.blessing_req);
                info.mid = mid;
                info
            })
            .collect();

        self.change_state(mid, local_components, global_components);
    }

    fn handle_set_rank(&mut self, cid: Cid, rank: i64) {
        let Some(position) = self
            .state
            .local_components
            .iter()
            .position(|info| info.cid == cid)
        else {
            return;
        };

        let info = &self.state.local_components[position];
        if info.rank == rank {
            return;
        }

        if let Some(name) = &info.name {
            let _ = self
                .rank_cache
                .insert((name.clone(), info.group.clone()), rank);
        }

        let mut local_components = self.state.local_components.clone();
        local_components[position].rank = rank;
        self.change_state(
            self.state.mid,
            local_components,
            self.state.global_components.clone(),
        );
    }

    fn change_state(
        &mut self,
        mid: Mid,
        local_components: Vec<ComponentInfo>,
        global_components: Vec<ComponentInfo>,
    ) {
        self.state = ServerState {
            mid,
            local_components,
            global_components,
        };
        let _ = self.state_tx.send(self.state.clone());
        self.broadcast();
    }

    /// Queues the fresh snapshot for every open connection. Happens before
    /// the actor dequeues any further command, so a component always sees
    /// the state produced by its own message before the next one acts.
    fn broadcast(&mut self) {
        let mut dead = Vec::new();
        for (cid, handle) in &self.clients {
            let msg = ObserverMsg::Server(MsgServer {
                cid: *cid,
                mid: self.state.mid,
                components: self.state.global_components.clone(),
            });
            if handle.outbox.try_send(msg).is_err() {
                dead.push(*cid);
            }
        }
        for cid in dead {
            warn!("dropping unresponsive component connection (cid: {cid})");
            self.handle_client_gone(cid);
        }
    }

    async fn shutdown(&mut self) {
        debug!(
            "closing observer server ({} connections)",
            self.clients.len()
        );
        let handles: Vec<ClientHandle> = self.clients.drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            let _ = handle.outbox.try_send(ObserverMsg::Close);
        }

        // Give the peers a chance to hang up on their own.
        let mut readers: Vec<JoinHandle<()>> =
            handles.into_iter().map(|handle| handle.reader).collect();
        let all_hung_up = async {
            for reader in &mut readers {
                let _ = reader.await;
            }
        };
        if time::timeout(self.close_timeout, all_hung_up).await.is_err() {
            debug!("forcing remaining component connections");
        }
        for reader in readers {
            reader.abort();
        }
    }

    fn init_info(&self, cid: Cid) -> ComponentInfo {
        ComponentInfo {
            cid,
            mid: self.state.mid,
            name: None,
            group: None,
            data: serde_json::Value::Null,
            rank: self.default_rank,
            blessing_req: BlessingReq::none(),
            blessing_res: BlessingRes::default(),
        }
    }
}
