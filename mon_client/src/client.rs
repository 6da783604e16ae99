// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Observer Client.
//!
//! Keeps one connection to the local monitor server, publishes the
//! component's blessing response and rebuilds the component's view of the
//! federation from every `MsgServer`.

use crate::{flag_wait, Error, Result, CMD_CHANNEL_SIZE};

use mon_comms::{Connection, ConnectionReader, ConnectionWriter, Error as CommsError};
use mon_interface::messaging::{MsgClient, MsgServer, ObserverMsg};
use mon_interface::{BlessingRes, ComponentInfo};

use std::net::SocketAddr;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{self, JoinHandle},
};
use tracing::{debug, warn};

/// The component's view: its own entry and the full global list.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClientState {
    /// The entry matching this component's (cid, mid); `None` until the
    /// component shows up in the global view.
    pub info: Option<ComponentInfo>,
    /// Federation-wide component list.
    pub components: Vec<ComponentInfo>,
}

/// Observer Client.
///
/// For creating a new instance of this struct see [`Client::connect`].
#[derive(Debug)]
pub struct Client {
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<ClientState>,
    close_req_rx: watch::Receiver<bool>,
    closed_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

enum Cmd {
    SetBlessingRes {
        res: BlessingRes,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

struct Identity {
    name: String,
    group: String,
    data: serde_json::Value,
}

impl Client {
    /// Connect to the local monitor server and announce this component.
    /// The initial blessing response is `(None, not ready)`.
    pub async fn connect(
        addr: SocketAddr,
        name: &str,
        group: &str,
        data: serde_json::Value,
    ) -> Result<Self> {
        let identity = Identity {
            name: name.to_string(),
            group: group.to_string(),
            data,
        };
        let blessing_res = BlessingRes::default();

        let mut conn = Connection::connect(addr).await?;
        conn.send(&ObserverMsg::Client(client_msg(&identity, blessing_res)))
            .await?;

        let (reader, writer) = conn.into_split();
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ClientState::default());
        let (close_req_tx, close_req_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        let task = task::spawn(client_loop(
            reader,
            writer,
            cmd_rx,
            state_tx,
            close_req_tx,
            closed_tx,
            identity,
            blessing_res,
        ));

        debug!("client connected to monitor server at {addr}");
        Ok(Self {
            cmd_tx,
            state_rx,
            close_req_rx,
            closed_rx,
            task,
        })
    }

    /// Current client state.
    pub fn state(&self) -> ClientState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    /// Publish a changed blessing response.
    pub async fn set_blessing_res(&self, res: BlessingRes) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::SetBlessingRes { res, ack })
            .await
            .map_err(|_| Error::Closed)?;
        done.await.map_err(|_| Error::Closed)
    }

    /// Resolves once the server has asked this component to shut down.
    pub async fn close_requested(&self) {
        flag_wait(self.close_req_rx.clone()).await
    }

    /// Shut the client down.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
        self.task.abort();
    }

    /// Resolves once the server connection is gone.
    pub async fn closed(&self) {
        flag_wait(self.closed_rx.clone()).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn client_msg(identity: &Identity, blessing_res: BlessingRes) -> MsgClient {
    MsgClient {
        name: identity.name.clone(),
        group: identity.group.clone(),
        data: identity.data.clone(),
        blessing_res,
    }
}

enum ReadEvent {
    Server(MsgServer),
    CloseRequested,
}

/// Forwards server messages off the wire; ends on connection loss, close
/// request or protocol violation.
async fn server_read_loop(mut reader: ConnectionReader, evt_tx: mpsc::Sender<ReadEvent>) {
    loop {
        match reader.recv().await {
            Ok(ObserverMsg::Server(msg)) => {
                if evt_tx.send(ReadEvent::Server(msg)).await.is_err() {
                    break;
                }
            }
            Ok(ObserverMsg::Close) => {
                debug!("received close request from server");
                let _ = evt_tx.send(ReadEvent::CloseRequested).await;
                break;
            }
            Ok(msg) => {
                warn!("unsupported {} from server", msg.name());
                break;
            }
            Err(CommsError::Closed) => {
                debug!("server connection closed");
                break;
            }
            Err(error) => {
                debug!("server connection lost: {error}");
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn client_loop(
    reader: ConnectionReader,
    mut writer: ConnectionWriter,
    mut cmd_rx: mpsc::Receiver<Cmd>,
    state_tx: watch::Sender<ClientState>,
    close_req_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
    identity: Identity,
    mut blessing_res: BlessingRes,
) {
    let (evt_tx, mut evt_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
    let read_task = task::spawn(server_read_loop(reader, evt_tx));

    debug!("starting client loop");
    loop {
        tokio::select! {
            evt = evt_rx.recv() => match evt {
                Some(ReadEvent::Server(msg)) => {
                    debug!("received server state (cid: {}, mid: {})", msg.cid, msg.mid);
                    let info = msg
                        .components
                        .iter()
                        .find(|info| info.cid == msg.cid && info.mid == msg.mid)
                        .cloned();
                    let state = ClientState {
                        info,
                        components: msg.components,
                    };
                    if *state_tx.borrow() != state {
                        let _ = state_tx.send(state);
                    }
                }
                Some(ReadEvent::CloseRequested) => {
                    let _ = close_req_tx.send(true);
                    break;
                }
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::SetBlessingRes { res, ack }) => {
                    let result = if res == blessing_res {
                        Ok(())
                    } else {
                        blessing_res = res;
                        writer
                            .send(&ObserverMsg::Client(client_msg(&identity, blessing_res)))
                            .await
                    };
                    let _ = ack.send(());
                    if let Err(error) = result {
                        debug!("publishing blessing response failed: {error}");
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

    debug!("stopping client loop");
    read_task.abort();
    let _ = closed_tx.send(true);
}
