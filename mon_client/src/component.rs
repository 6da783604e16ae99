// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Component controller.
//!
//! Translates the blessing protocol into the lifecycle of a user-supplied
//! runner. The component is active while it is ready and the grant token it
//! echoed matches the master's current request; exactly one runner exists
//! per activation and its shutdown always runs to completion, even when the
//! component itself is being closed.

use crate::client::{Client, ClientState};
use crate::{flag_wait, Error, Result, CMD_CHANNEL_SIZE};

use mon_interface::{BlessingRes, ComponentInfo};

use async_trait::async_trait;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task,
};
use tracing::debug;

/// User-supplied activity handle, produced once per activation.
#[async_trait]
pub trait ComponentRunner: Send {
    /// Completes when the activity has finished on its own.
    async fn closing(&mut self);

    /// Shuts the activity down, waiting for its cleanup to complete.
    async fn close(self: Box<Self>);
}

/// Produces a fresh runner every time the component becomes active.
#[async_trait]
pub trait RunnerFactory: Send + 'static {
    /// Called at most once per activation; never while a previous runner
    /// still exists.
    async fn create(&mut self) -> Box<dyn ComponentRunner>;
}

/// Monitor Component.
///
/// For creating a new instance of this struct see [`Component::connect`].
#[derive(Debug)]
pub struct Component {
    client: Arc<Client>,
    cmd_tx: mpsc::Sender<Cmd>,
    closed_rx: watch::Receiver<bool>,
}

enum Cmd {
    SetReady {
        ready: bool,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

impl Component {
    /// Connect to the local monitor server and run the component protocol.
    /// Initially the component is not ready.
    pub async fn connect(
        addr: SocketAddr,
        name: &str,
        group: &str,
        data: serde_json::Value,
        factory: impl RunnerFactory,
    ) -> Result<Self> {
        let client = Arc::new(Client::connect(addr, name, group, data).await?);

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_SIZE);
        let (closed_tx, closed_rx) = watch::channel(false);

        let controller = Controller {
            client: client.clone(),
            state_rx: client.state_receiver(),
            cmd_rx,
            blessing_res: BlessingRes::default(),
        };
        // Detached on purpose: the controller shuts itself down once the
        // command channel or the server connection goes away, and a live
        // runner's cleanup must never be aborted mid-way.
        let _task = task::spawn(component_loop(
            controller,
            Box::new(factory),
            client.clone(),
            closed_tx,
        ));

        Ok(Self {
            client,
            cmd_tx,
            closed_rx,
        })
    }

    /// Current component state.
    pub fn state(&self) -> ClientState {
        self.client.state()
    }

    /// Subscribe to state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.client.state_receiver()
    }

    /// Advertise whether this component is willing to run.
    pub async fn set_ready(&self, ready: bool) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::SetReady { ready, ack })
            .await
            .map_err(|_| Error::Closed)?;
        done.await.map_err(|_| Error::Closed)
    }

    /// Resolves once the server has asked this component to shut down.
    pub async fn close_requested(&self) {
        self.client.close_requested().await
    }

    /// Shut the component down. A running runner is closed first and its
    /// cleanup completes before this returns.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
        self.closed().await;
    }

    /// Resolves once the component has shut down.
    pub async fn closed(&self) {
        flag_wait(self.closed_rx.clone()).await
    }
}

/// Why the controller loop ended.
enum Exit {
    /// The server connection is gone.
    ClientGone,
    /// The runner finished on its own while the component was active.
    RunnerFinished,
    /// `close` was called.
    Shutdown(oneshot::Sender<()>),
}

/// What ended one activation.
enum Outcome {
    Deactivated,
    RunnerClosed,
    Exit(Exit),
}

struct Controller {
    client: Arc<Client>,
    state_rx: watch::Receiver<ClientState>,
    cmd_rx: mpsc::Receiver<Cmd>,
    blessing_res: BlessingRes,
}

impl Controller {
    fn info(&self) -> Option<ComponentInfo> {
        self.state_rx.borrow().info.clone()
    }

    async fn push_res(&self) -> Result<(), Exit> {
        self.client
            .set_blessing_res(self.blessing_res)
            .await
            .map_err(|_| Exit::ClientGone)
    }

    async fn set_ready(&mut self, ready: bool) -> Result<(), Exit> {
        if self.blessing_res.ready == ready {
            return Ok(());
        }
        self.blessing_res.ready = ready;
        self.push_res().await
    }

    /// Sleeps until the client state or the blessing response changed.
    async fn wait_event(&mut self) -> Result<(), Exit> {
        tokio::select! {
            changed = self.state_rx.changed() => {
                if changed.is_err() {
                    return Err(Exit::ClientGone);
                }
                Ok(())
            }
            cmd = self.cmd_rx.recv() => match cmd {
                Some(Cmd::SetReady { ready, ack }) => {
                    let result = self.set_ready(ready).await;
                    let _ = ack.send(());
                    result
                }
                Some(Cmd::Shutdown { ack }) => Err(Exit::Shutdown(ack)),
                None => Err(Exit::ClientGone),
            },
        }
    }

    /// Idle: wait until the component is ready and the master offers a
    /// grant token.
    async fn wait_blessed_token(&mut self) -> Result<u64, Exit> {
        loop {
            if self.blessing_res.ready {
                if let Some(token) = self.info().and_then(|info| info.blessing_req.token) {
                    return Ok(token);
                }
            }
            self.wait_event().await?;
        }
    }

    /// Confirming: wait until the echoed token is reflected in our own
    /// entry. Returns whether the master still agrees by then.
    async fn wait_confirmation(&mut self) -> Result<bool, Exit> {
        loop {
            if !self.blessing_res.ready {
                return Ok(false);
            }
            let Some(token) = self.blessing_res.token else {
                return Ok(false);
            };
            if let Some(info) = self.info() {
                if info.blessing_res.token == Some(token) {
                    return Ok(info.blessing_req.token == Some(token));
                }
            }
            self.wait_event().await?;
        }
    }

    /// Active: wait until readiness drops or the master's request no longer
    /// matches the echoed token.
    async fn wait_while_active(&mut self) -> Result<(), Exit> {
        loop {
            if !self.blessing_res.ready {
                return Ok(());
            }
            let token = self.info().and_then(|info| info.blessing_req.token);
            if token.is_none() || token != self.blessing_res.token {
                return Ok(());
            }
            self.wait_event().await?;
        }
    }
}

async fn component_loop(
    mut controller: Controller,
    mut factory: Box<dyn RunnerFactory>,
    client: Arc<Client>,
    closed_tx: watch::Sender<bool>,
) {
    debug!("starting component loop");
    let exit = run_component(&mut controller, factory.as_mut()).await;

    debug!("stopping component loop");
    client.close().await;
    if let Exit::Shutdown(ack) = exit {
        let _ = ack.send(());
    }
    let _ = closed_tx.send(true);
}

async fn run_component(controller: &mut Controller, factory: &mut dyn RunnerFactory) -> Exit {
    loop {
        let token = match controller.wait_blessed_token().await {
            Ok(token) => token,
            Err(exit) => return exit,
        };

        if controller.blessing_res.token != Some(token) {
            controller.blessing_res.token = Some(token);
            if let Err(exit) = controller.push_res().await {
                return exit;
            }
        }

        let confirmed = match controller.wait_confirmation().await {
            Ok(confirmed) => confirmed,
            Err(exit) => return exit,
        };
        if !confirmed {
            // The grant moved away before the readback completed.
            controller.blessing_res.token = None;
            if let Err(exit) = controller.push_res().await {
                return exit;
            }
            continue;
        }

        debug!("creating component runner");
        let mut runner = factory.create().await;

        let outcome = tokio::select! {
            deactivated = controller.wait_while_active() => match deactivated {
                Ok(()) => Outcome::Deactivated,
                Err(exit) => Outcome::Exit(exit),
            },
            _ = runner.closing() => Outcome::RunnerClosed,
        };

        // The runner's shutdown always completes; this task is never
        // aborted while a runner exists.
        debug!("closing component runner");
        runner.close().await;

        controller.blessing_res.token = None;
        let pushed = controller.push_res().await;

        match outcome {
            Outcome::Deactivated => {
                if let Err(exit) = pushed {
                    return exit;
                }
            }
            Outcome::RunnerClosed => {
                return match pushed {
                    Ok(()) => Exit::RunnerFinished,
                    Err(exit) => exit,
                }
            }
            Outcome::Exit(exit) => return exit,
        }
    }
}
