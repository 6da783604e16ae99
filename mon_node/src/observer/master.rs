// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Observer Master.
//!
//! Accepts slave connections while active, merges the per-slave local views
//! into the global component list and applies the blessing calculation to
//! it. Mid 0 is the master's own locally attached server; other mids are
//! assigned to slaves monotonically on connect.

use super::{closed_wait, write_loop, CMD_CHANNEL_SIZE, CONN_OUTBOX_SIZE};
use crate::{Error, Result};

use mon_comms::{Connection, ConnectionReader, Error as CommsError};
use mon_interface::messaging::{MsgMaster, ObserverMsg};
use mon_interface::{BlessingReq, Cid, ComponentInfo, Mid};

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    task::{self, JoinHandle},
};
use tracing::{debug, warn};

/// Blessing calculation applied to the flattened global view. Returns the
/// `(mid, cid, blessing_req)` assignments that differ from the input.
pub type BlessingCalc = Box<dyn Fn(&[ComponentInfo]) -> Vec<(Mid, Cid, BlessingReq)> + Send>;

/// Observer Master.
///
/// Created listening but inactive; see [`Master::listen`] and
/// [`Master::set_active`].
#[derive(Debug)]
pub struct Master {
    local_addr: SocketAddr,
    cmd_tx: mpsc::Sender<Cmd>,
    global_rx: watch::Receiver<Vec<ComponentInfo>>,
    active: Arc<AtomicBool>,
    closed_rx: watch::Receiver<bool>,
    actor: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

enum Cmd {
    Connected(Connection),
    SlaveMsg {
        mid: Mid,
        components: Vec<ComponentInfo>,
    },
    SlaveGone {
        mid: Mid,
    },
    SetActive {
        active: bool,
        ack: oneshot::Sender<()>,
    },
    SetLocalComponents {
        components: Vec<ComponentInfo>,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

impl Master {
    /// Create a listening, inactive Observer Master.
    pub async fn listen(addr: SocketAddr, calc: BlessingCalc) -> Result<Self> {
        let listener = mon_comms::listen(addr).await?;
        let local_addr = listener.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let (global_tx, global_rx) = watch::channel(Vec::new());
        let (closed_tx, closed_rx) = watch::channel(false);
        let active = Arc::new(AtomicBool::new(false));

        let mut mid_components = BTreeMap::new();
        let _ = mid_components.insert(0, Vec::new());

        let actor = Actor {
            calc,
            cmd_tx: cmd_tx.clone(),
            global_tx,
            closed_tx,
            active_flag: active.clone(),
            active: false,
            next_mid: 1,
            mid_components,
            slaves: HashMap::new(),
            global: Vec::new(),
            version: 0,
        };
        let actor = task::spawn(actor.run(cmd_rx));
        let acceptor = task::spawn(accept_loop(listener, cmd_tx.clone()));

        debug!("observer master listening on {local_addr}");
        Ok(Self {
            local_addr,
            cmd_tx,
            global_rx,
            active,
            closed_rx,
            actor,
            acceptor,
        })
    }

    /// The address slaves connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether this master currently coordinates the federation.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Current global component list.
    pub fn global_components(&self) -> Vec<ComponentInfo> {
        self.global_rx.borrow().clone()
    }

    /// Subscribe to global component list changes.
    pub fn global_receiver(&self) -> watch::Receiver<Vec<ComponentInfo>> {
        self.global_rx.clone()
    }

    /// Activate or deactivate this master. Deactivation closes every slave
    /// connection and drops their contribution to the global view.
    pub async fn set_active(&self, active: bool) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::SetActive { active, ack })
            .await
            .map_err(|_| Error::Closed)?;
        done.await.map_err(|_| Error::Closed)
    }

    /// Replace the mid-0 components with the local server's current list.
    pub async fn set_local_components(&self, components: Vec<ComponentInfo>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::SetLocalComponents { components, ack })
            .await
            .map_err(|_| Error::Closed)?;
        done.await.map_err(|_| Error::Closed)
    }

    /// Shut the master down, dropping every slave connection.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
        self.acceptor.abort();
        self.actor.abort();
    }

    /// Resolves once the master has shut down.
    pub async fn closed(&self) {
        closed_wait(self.closed_rx.clone()).await
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.actor.abort();
    }
}

async fn accept_loop(listener: TcpListener, cmd_tx: mpsc::Sender<Cmd>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("accepted slave connection from {addr}");
                match Connection::new(stream) {
                    Ok(conn) => {
                        if cmd_tx.send(Cmd::Connected(conn)).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => debug!("discarding connection from {addr}: {error}"),
                }
            }
            Err(error) => warn!("accepting slave connection failed: {error}"),
        }
    }
}

async fn slave_read_loop(mid: Mid, mut reader: ConnectionReader, cmd_tx: mpsc::Sender<Cmd>) {
    loop {
        match reader.recv().await {
            Ok(ObserverMsg::Slave(msg)) => {
                debug!("received slave message (mid: {mid})");
                let cmd = Cmd::SlaveMsg {
                    mid,
                    components: msg.components,
                };
                if cmd_tx.send(cmd).await.is_err() {
                    break;
                }
            }
            Ok(msg) => {
                warn!("unsupported {} from slave (mid: {mid})", msg.name());
                break;
            }
            Err(CommsError::Closed) => {
                debug!("slave connection closed (mid: {mid})");
                break;
            }
            Err(error) => {
                debug!("slave connection lost (mid: {mid}): {error}");
                break;
            }
        }
    }
    let _ = cmd_tx.send(Cmd::SlaveGone { mid }).await;
}

struct SlaveHandle {
    outbox: mpsc::Sender<ObserverMsg>,
    /// Set once the first `MsgSlave` arrived; only announced slaves receive
    /// global view pushes.
    announced: bool,
    reader: JoinHandle<()>,
}

struct Actor {
    calc: BlessingCalc,
    cmd_tx: mpsc::Sender<Cmd>,
    global_tx: watch::Sender<Vec<ComponentInfo>>,
    closed_tx: watch::Sender<bool>,
    active_flag: Arc<AtomicBool>,
    active: bool,
    next_mid: Mid,
    mid_components: BTreeMap<Mid, Vec<ComponentInfo>>,
    slaves: HashMap<Mid, SlaveHandle>,
    global: Vec<ComponentInfo>,
    /// Bumped whenever `global` changes; lets callers tell whether a
    /// reconciliation pushed anything.
    version: u64,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Cmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Cmd::Connected(conn) => self.handle_connected(conn),
                Cmd::SlaveMsg { mid, components } => self.handle_slave_msg(mid, components),
                Cmd::SlaveGone { mid } => self.remove_slave(mid),
                Cmd::SetActive { active, ack } => {
                    self.handle_set_active(active);
                    let _ = ack.send(());
                }
                Cmd::SetLocalComponents { components, ack } => {
                    self.apply_update(0, Some(components));
                    let _ = ack.send(());
                }
                Cmd::Shutdown { ack } => {
                    debug!("closing observer master ({} slaves)", self.slaves.len());
                    for (_, handle) in self.slaves.drain() {
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
        if !self.active {
            debug!(
                "refusing slave connection from {} while inactive",
                conn.peer_addr()
            );
            return;
        }

        let mid = self.next_mid;
        self.next_mid += 1;

        let (reader, writer) = conn.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(CONN_OUTBOX_SIZE);
        let _writer = task::spawn(write_loop(writer, outbox_rx));
        let reader = task::spawn(slave_read_loop(mid, reader, self.cmd_tx.clone()));
        let _ = self.slaves.insert(
            mid,
            SlaveHandle {
                outbox: outbox_tx,
                announced: false,
                reader,
            },
        );
        debug!("slave registered (mid: {mid})");
    }

    fn handle_slave_msg(&mut self, mid: Mid, components: Vec<ComponentInfo>) {
        let Some(handle) = self.slaves.get_mut(&mid) else {
            // The slave was dropped while its message was in flight.
            return;
        };
        let first = !handle.announced;
        handle.announced = true;

        let version = self.version;
        self.apply_update(mid, Some(components));

        // A slave has to learn its mid even when its announcement did not
        // change the global view (and thus got no push).
        if first && version == self.version {
            if let Some(handle) = self.slaves.get(&mid) {
                let msg = ObserverMsg::Master(MsgMaster {
                    mid,
                    components: self.global.clone(),
                });
                if handle.outbox.try_send(msg).is_err() {
                    self.remove_slave(mid);
                }
            }
        }
    }

    fn handle_set_active(&mut self, active: bool) {
        if active == self.active {
            return;
        }
        self.active = active;
        self.active_flag.store(active, Ordering::Relaxed);
        debug!("master {}", if active { "activated" } else { "deactivated" });

        if !active {
            let mids: Vec<Mid> = self.slaves.keys().copied().collect();
            for mid in mids {
                self.remove_slave(mid);
            }
        }
    }

    fn remove_slave(&mut self, mid: Mid) {
        if let Some(handle) = self.slaves.remove(&mid) {
            debug!("slave removed (mid: {mid})");
            handle.reader.abort();
        }
        self.apply_update(mid, None);
    }

    /// Replaces (or removes) one mid's components and reconciles the global
    /// view. Push failures remove the affected slave, which feeds back into
    /// the reconciliation until it settles.
    fn apply_update(&mut self, mid: Mid, components: Option<Vec<ComponentInfo>>) {
        let mut work = vec![(mid, components)];
        while let Some((mid, components)) = work.pop() {
            let changed = match components {
                None => self.mid_components.remove(&mid).is_some(),
                Some(components) => {
                    let stamped = {
                        let previous = self.mid_components.get(&mid);
                        // A re-announcement must not lose a grant already
                        // issued for the same cid.
                        let carried: HashMap<Cid, BlessingReq> = previous
                            .map(|infos| {
                                infos
                                    .iter()
                                    .map(|info| (info.cid, info.blessing_req))
                                    .collect()
                            })
                            .unwrap_or_default();
                        let stamped: Vec<ComponentInfo> = components
                            .into_iter()
                            .map(|mut info| {
                                info.blessing_req = carried
                                    .get(&info.cid)
                                    .copied()
                                    .unwrap_or(info.blessing_req);
                                info.mid = mid;
                                info
                            })
                            .collect();
                        if previous == Some(&stamped) {
                            None
                        } else {
                            Some(stamped)
                        }
                    };
                    match stamped {
                        None => false,
                        Some(stamped) => {
                            let _ = self.mid_components.insert(mid, stamped);
                            true
                        }
                    }
                }
            };

            if !changed {
                continue;
            }

            for failed_mid in self.reconcile() {
                warn!("dropping unresponsive slave connection (mid: {failed_mid})");
                if let Some(handle) = self.slaves.remove(&failed_mid) {
                    handle.reader.abort();
                }
                work.push((failed_mid, None));
            }
        }
    }

    /// Flattens the per-mid views (ascending mids), applies the blessing
    /// calculation and, if the global list changed, pushes it to every
    /// announced slave. Returns the mids whose push failed.
    fn reconcile(&mut self) -> Vec<Mid> {
        let flattened: Vec<ComponentInfo> =
            self.mid_components.values().flatten().cloned().collect();

        let changes = (self.calc)(&flattened);
        for (mid, cid, req) in &changes {
            if let Some(entries) = self.mid_components.get_mut(mid) {
                if let Some(info) = entries.iter_mut().find(|info| info.cid == *cid) {
                    info.blessing_req = *req;
                }
            }
        }

        let global: Vec<ComponentInfo> = if changes.is_empty() {
            flattened
        } else {
            self.mid_components.values().flatten().cloned().collect()
        };

        let mut failed = Vec::new();
        if global != self.global {
            self.global = global;
            self.version += 1;
            let _ = self.global_tx.send(self.global.clone());

            for (mid, handle) in &self.slaves {
                if !handle.announced {
                    continue;
                }
                let msg = ObserverMsg::Master(MsgMaster {
                    mid: *mid,
                    components: self.global.clone(),
                });
                if handle.outbox.try_send(msg).is_err() {
                    failed.push(*mid);
                }
            }
        }
        failed
    }
}
