// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Node supervisor.
//!
//! Owns the local Observer Server, the (initially inactive) Observer
//! Master, the optional operator UI and at most one Observer Slave, and
//! keeps their views flowing into each other. The local master is only
//! activated after connecting to every configured parent has failed for a
//! full retry cycle, which keeps at most one master active in the
//! federation.

use crate::blessing;
use crate::config::Config;
use crate::observer::master::{BlessingCalc, Master};
use crate::observer::server::{Server, DEFAULT_CLOSE_TIMEOUT};
use crate::observer::slave::Slave;
use crate::observer::closed_wait;
use crate::ui::{SetRankRequest, UiServer};
use crate::{Error, Result};

use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch, RwLock},
    task::{self, JoinHandle},
    time,
};
use tracing::{debug, warn};

/// Node supervisor.
///
/// For creating a new instance of this struct see [`Runner::create`].
#[derive(Debug)]
pub struct Runner {
    server_addr: SocketAddr,
    master_addr: SocketAddr,
    ui_addr: Option<SocketAddr>,
    cancel_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

struct Ctx {
    server: Server,
    master: Master,
    ui: Option<UiServer>,
    slave_slot: RwLock<Option<Arc<Slave>>>,
    parents: Vec<SocketAddr>,
    connect_timeout: Duration,
    retry_delay: Duration,
    retry_count: Option<u64>,
    cancel_tx: watch::Sender<bool>,
}

impl Runner {
    /// Start a monitor node from its configuration.
    pub async fn create(conf: Config) -> Result<Self> {
        conf.validate()?;

        debug!("starting server");
        let server = Server::listen(
            conf.server.addr()?,
            conf.server.default_rank,
            DEFAULT_CLOSE_TIMEOUT,
        )
        .await?;

        debug!("starting master");
        let group_algorithms = conf.group_algorithms.clone();
        let default_algorithm = conf.default_algorithm;
        let calc: BlessingCalc = Box::new(move |components| {
            blessing::calculate(components, &group_algorithms, default_algorithm)
        });
        let master = Master::listen(conf.master.addr()?, calc).await?;

        let (ui, ui_requests) = match &conf.ui {
            Some(ui_conf) => {
                debug!("starting ui");
                let (ui, requests) = UiServer::listen(ui_conf.addr()?, server.state()).await?;
                (Some(ui), Some(requests))
            }
            None => (None, None),
        };

        let parents = conf
            .slave
            .parents
            .iter()
            .map(|parent| parent.addr())
            .collect::<Result<Vec<_>>>()?;

        let server_addr = server.local_addr();
        let master_addr = master.local_addr();
        let ui_addr = ui.as_ref().map(|ui| ui.local_addr());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        let ctx = Arc::new(Ctx {
            server,
            master,
            ui,
            slave_slot: RwLock::new(None),
            parents,
            connect_timeout: conf.slave.connect_timeout(),
            retry_delay: conf.slave.connect_retry_delay(),
            retry_count: conf.slave.connect_retry_count,
            cancel_tx: cancel_tx.clone(),
        });

        let mut tasks = vec![
            task::spawn(server_state_task(ctx.clone())),
            task::spawn(master_global_task(ctx.clone())),
            task::spawn(control_task(ctx.clone())),
        ];
        if let Some(requests) = ui_requests {
            tasks.push(task::spawn(ui_requests_task(ctx.clone(), requests)));
        }

        let _supervisor = task::spawn(supervise(ctx, cancel_rx, closed_tx, tasks));

        debug!("monitor node started");
        Ok(Self {
            server_addr,
            master_addr,
            ui_addr,
            cancel_tx,
            closed_rx,
        })
    }

    /// Address of the Observer Server components connect to.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Address of the Observer Master slaves connect to.
    pub fn master_addr(&self) -> SocketAddr {
        self.master_addr
    }

    /// Address of the operator surface, when configured.
    pub fn ui_addr(&self) -> Option<SocketAddr> {
        self.ui_addr
    }

    /// Shut the node down, closing every owned resource.
    pub async fn close(&self) {
        let _ = self.cancel_tx.send(true);
        self.closed().await;
    }

    /// Resolves once the node has shut down.
    pub async fn closed(&self) {
        closed_wait(self.closed_rx.clone()).await
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        // Kick the teardown; the supervisor finishes it in the background.
        let _ = self.cancel_tx.send(true);
    }
}

async fn supervise(
    ctx: Arc<Ctx>,
    mut cancel_rx: watch::Receiver<bool>,
    closed_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
) {
    let cancelled = async move {
        loop {
            if *cancel_rx.borrow() {
                return;
            }
            if cancel_rx.changed().await.is_err() {
                return;
            }
        }
    };

    // Closing any owned resource closes the whole node.
    tokio::select! {
        _ = cancelled => debug!("runner close requested"),
        _ = ctx.server.closed() => debug!("server closed, closing runner"),
        _ = ctx.master.closed() => debug!("master closed, closing runner"),
        _ = ui_closed(&ctx) => debug!("ui closed, closing runner"),
    }

    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }

    if let Some(ui) = &ctx.ui {
        ui.close().await;
    }
    ctx.server.close().await;
    ctx.master.close().await;
    if let Some(slave) = ctx.slave_slot.write().await.take() {
        slave.close().await;
    }

    debug!("monitor node stopped");
    let _ = closed_tx.send(true);
}

async fn ui_closed(ctx: &Ctx) {
    match &ctx.ui {
        Some(ui) => ui.closed().await,
        None => futures::future::pending().await,
    }
}

/// Mirrors every server state change to the UI, to the master's mid-0 view
/// and to the live slave.
async fn server_state_task(ctx: Arc<Ctx>) {
    let mut state_rx = ctx.server.state_receiver();
    loop {
        if let Err(error) = mirror_server_state(&ctx).await {
            debug!("mirroring server state ended: {error}");
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn mirror_server_state(ctx: &Ctx) -> Result<()> {
    let state = ctx.server.state();

    if let Some(ui) = &ctx.ui {
        ui.set_state(&state).await?;
    }

    ctx.master
        .set_local_components(state.local_components.clone())
        .await?;

    let slave = ctx.slave_slot.read().await.clone();
    if let Some(slave) = slave {
        if slave.is_open() {
            // A dying slave is handled by the control loop.
            let _ = slave.update(state.local_components).await;
        }
    }

    Ok(())
}

/// Adopts the master's global view into the server while the master is
/// active.
async fn master_global_task(ctx: Arc<Ctx>) {
    let mut global_rx = ctx.master.global_receiver();
    loop {
        let global = global_rx.borrow_and_update().clone();
        if ctx.master.is_active() {
            if let Err(error) = ctx.server.update(0, global).await {
                debug!("adopting master view ended: {error}");
                return;
            }
        }
        if global_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Applies operator rank changes to the server.
async fn ui_requests_task(ctx: Arc<Ctx>, mut requests: mpsc::Receiver<SetRankRequest>) {
    while let Some(request) = requests.recv().await {
        if ctx.server.set_rank(request.cid, request.rank).await.is_err() {
            return;
        }
    }
}

async fn control_task(ctx: Arc<Ctx>) {
    match run_control(&ctx).await {
        Ok(()) => {}
        Err(Error::Closed) => debug!("runner loop ended, resource closed"),
        Err(error) => warn!("runner loop error: {error}"),
    }
    let _ = ctx.cancel_tx.send(true);
}

async fn run_control(ctx: &Ctx) -> Result<()> {
    if ctx.parents.is_empty() {
        // The node is permanently the master.
        set_master_active(ctx, true).await?;
        futures::future::pending::<()>().await;
    }

    loop {
        if ctx.slave_slot.read().await.is_none() {
            ctx.server.update(0, Vec::new()).await?;
            connect_cycle(ctx, ctx.retry_count).await?;
        }

        let slave = ctx.slave_slot.read().await.clone();
        match slave {
            Some(slave) if slave.is_open() => {
                set_master_active(ctx, false).await?;
                watch_slave(ctx, &slave).await?;
            }
            Some(slave) => {
                slave.close().await;
                *ctx.slave_slot.write().await = None;
            }
            None => {
                debug!("no master detected - activating local master");
                set_master_active(ctx, true).await?;
                connect_cycle(ctx, None).await?;
            }
        }
    }
}

/// Tries every parent in order, with `retry_count` further rounds after the
/// first pass (`None` keeps trying forever). On success the fresh slave is
/// stored in the slot.
async fn connect_cycle(ctx: &Ctx, retry_count: Option<u64>) -> Result<()> {
    let mut round: u64 = 0;
    loop {
        for addr in &ctx.parents {
            let local_components = ctx.server.state().local_components;
            match time::timeout(ctx.connect_timeout, Slave::connect(*addr, local_components)).await
            {
                Ok(Ok(slave)) => {
                    *ctx.slave_slot.write().await = Some(Arc::new(slave));
                    return Ok(());
                }
                Ok(Err(error)) => debug!("connecting to master at {addr} failed: {error}"),
                Err(_) => debug!("connecting to master at {addr} timed out"),
            }
        }

        if let Some(limit) = retry_count {
            if round >= limit {
                return Ok(());
            }
        }
        round = round.saturating_add(1);
        time::sleep(ctx.retry_delay).await;
    }
}

/// Follows one slave until its master link drops, keeping the server's
/// global view in sync with what the slave learns.
async fn watch_slave(ctx: &Ctx, slave: &Arc<Slave>) -> Result<()> {
    let mut state_rx = slave.state_receiver();
    loop {
        let state = state_rx.borrow_and_update().clone();
        if !ctx.master.is_active() {
            if let Some(mid) = state.mid {
                ctx.server.update(mid, state.global_components).await?;
            }
        }

        tokio::select! {
            _ = slave.closed() => return Ok(()),
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn set_master_active(ctx: &Ctx, active: bool) -> Result<()> {
    ctx.master.set_active(active).await?;
    mirror_server_state(ctx).await?;

    if active {
        ctx.server.update(0, ctx.master.global_components()).await?;
    } else {
        let slave = ctx.slave_slot.read().await.clone();
        if let Some(slave) = slave {
            let state = slave.state();
            if let Some(mid) = state.mid {
                ctx.server.update(mid, state.global_components).await?;
            }
        }
    }
    Ok(())
}
