// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Observer Slave.
//!
//! Connects this server to a remote master, publishes the local component
//! list and receives the merged global view. The slave never reconnects on
//! its own; reconnection policy lives in the runner.

use super::{closed_wait, CMD_CHANNEL_SIZE};
use crate::{Error, Result};

use mon_comms::{Connection, ConnectionReader, ConnectionWriter, Error as CommsError};
use mon_interface::messaging::{MsgMaster, MsgSlave, ObserverMsg};
use mon_interface::{ComponentInfo, Mid};

use std::net::SocketAddr;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{self, JoinHandle},
};
use tracing::{debug, warn};

/// What the slave has learnt from its master so far.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SlaveState {
    /// Mid the master assigned to this server; `None` before the first
    /// `MsgMaster`.
    pub mid: Option<Mid>,
    /// Federation-wide component list.
    pub global_components: Vec<ComponentInfo>,
}

/// Observer Slave.
///
/// For creating a new instance of this struct see [`Slave::connect`].
#[derive(Debug)]
pub struct Slave {
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<SlaveState>,
    closed_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

enum Cmd {
    Update {
        components: Vec<ComponentInfo>,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

impl Slave {
    /// Connect to an Observer Master and announce the given local
    /// components.
    pub async fn connect(addr: SocketAddr, local_components: Vec<ComponentInfo>) -> Result<Self> {
        let mut conn = Connection::connect(addr).await?;
        conn.send(&ObserverMsg::Slave(MsgSlave {
            components: local_components.clone(),
        }))
        .await?;

        let (reader, writer) = conn.into_split();
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(SlaveState::default());
        let (closed_tx, closed_rx) = watch::channel(false);

        let task = task::spawn(slave_loop(
            reader,
            writer,
            cmd_rx,
            state_tx,
            closed_tx,
            local_components,
        ));

        debug!("slave connected to master at {addr}");
        Ok(Self {
            cmd_tx,
            state_rx,
            closed_rx,
            task,
        })
    }

    /// Current slave state.
    pub fn state(&self) -> SlaveState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SlaveState> {
        self.state_rx.clone()
    }

    /// Whether the master link is still up.
    pub fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    /// Publish a changed local component list to the master.
    pub async fn update(&self, local_components: Vec<ComponentInfo>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Update {
                components: local_components,
                ack,
            })
            .await
            .map_err(|_| Error::Closed)?;
        done.await.map_err(|_| Error::Closed)
    }

    /// Shut the slave down.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
        self.task.abort();
    }

    /// Resolves once the master link is gone.
    pub async fn closed(&self) {
        closed_wait(self.closed_rx.clone()).await
    }
}

impl Drop for Slave {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Forwards `MsgMaster` payloads off the wire; ends on connection loss or
/// protocol violation.
async fn master_read_loop(mut reader: ConnectionReader, evt_tx: mpsc::Sender<MsgMaster>) {
    loop {
        match reader.recv().await {
            Ok(ObserverMsg::Master(msg)) => {
                if evt_tx.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(msg) => {
                warn!("unsupported {} from master", msg.name());
                break;
            }
            Err(CommsError::Closed) => {
                debug!("master connection closed");
                break;
            }
            Err(error) => {
                debug!("master connection lost: {error}");
                break;
            }
        }
    }
}

async fn slave_loop(
    reader: ConnectionReader,
    mut writer: ConnectionWriter,
    mut cmd_rx: mpsc::Receiver<Cmd>,
    state_tx: watch::Sender<SlaveState>,
    closed_tx: watch::Sender<bool>,
    mut local_components: Vec<ComponentInfo>,
) {
    let (evt_tx, mut evt_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
    let read_task = task::spawn(master_read_loop(reader, evt_tx));

    debug!("starting slave loop");
    loop {
        tokio::select! {
            incoming = evt_rx.recv() => match incoming {
                Some(msg) => {
                    debug!("received global view from master (mid: {})", msg.mid);
                    let _ = state_tx.send(SlaveState {
                        mid: Some(msg.mid),
                        global_components: msg.components,
                    });
                }
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Update { components, ack }) => {
                    let result = if components == local_components {
                        Ok(())
                    } else {
                        local_components = components;
                        writer
                            .send(&ObserverMsg::Slave(MsgSlave {
                                components: local_components.clone(),
                            }))
                            .await
                    };
                    let _ = ack.send(());
                    if let Err(error) = result {
                        debug!("publishing local components failed: {error}");
                        break;
                    }
                }
                Some(Cmd::Shutdown { ack }) => {
                    let _ = ack.send(());
                    break;
                }
                None => break,
            },
        }
    }

    debug!("stopping slave loop");
    read_task.abort();
    let _ = closed_tx.send(true);
}
