// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Whole-node scenarios: runners, federation and component blessing over
//! real loopback connections.

use mon_client::{Component, ComponentRunner, RunnerFactory};
use mon_interface::Algorithm;
use mon_node::config::{Config, MasterConfig, ParentConfig, ServerConfig, SlaveConfig};
use mon_node::runner::Runner;

use async_trait::async_trait;
use eyre::Result;
use serde_json::json;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Flags {
    created: AtomicUsize,
    closed: AtomicUsize,
}

impl Flags {
    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

struct TestFactory {
    flags: Arc<Flags>,
}

struct TestRunner {
    flags: Arc<Flags>,
}

#[async_trait]
impl RunnerFactory for TestFactory {
    async fn create(&mut self) -> Box<dyn ComponentRunner> {
        let _ = self.flags.created.fetch_add(1, Ordering::SeqCst);
        Box::new(TestRunner {
            flags: self.flags.clone(),
        })
    }
}

#[async_trait]
impl ComponentRunner for TestRunner {
    async fn closing(&mut self) {
        futures::future::pending().await
    }

    async fn close(self: Box<Self>) {
        let _ = self.flags.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn factory() -> (TestFactory, Arc<Flags>) {
    let flags = Arc::new(Flags::default());
    (
        TestFactory {
            flags: flags.clone(),
        },
        flags,
    )
}

fn node_config(default_algorithm: Algorithm, parents: Vec<SocketAddr>) -> Config {
    Config {
        log: None,
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            default_rank: 1,
        },
        master: MasterConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        ui: None,
        slave: SlaveConfig {
            parents: parents
                .into_iter()
                .map(|addr| ParentConfig {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
                .collect(),
            connect_timeout: 0.5,
            connect_retry_count: Some(1),
            connect_retry_delay: 0.1,
        },
        default_algorithm,
        group_algorithms: HashMap::new(),
    }
}

async fn wait_until(mut pred: impl FnMut() -> bool) -> Result<()> {
    time::timeout(TIMEOUT, async {
        while !pred() {
            time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}

/// Waits until the component's own entry satisfies the predicate.
async fn wait_for_info(
    component: &Component,
    mut pred: impl FnMut(&mon_interface::ComponentInfo) -> bool,
) -> Result<mon_interface::ComponentInfo> {
    let mut state_rx = component.state_receiver();
    let info = time::timeout(TIMEOUT, async {
        loop {
            {
                let state = state_rx.borrow_and_update();
                if let Some(info) = &state.info {
                    if pred(info) {
                        return Ok(info.clone());
                    }
                }
            }
            if state_rx.changed().await.is_err() {
                eyre::bail!("component state channel closed");
            }
        }
    })
    .await??;
    Ok(info)
}

fn is_active(info: &mon_interface::ComponentInfo) -> bool {
    info.blessing_req.token.is_some() && info.blessing_res.token == info.blessing_req.token
}

#[tokio::test]
async fn bless_all_runs_every_ready_component() -> Result<()> {
    let runner = Runner::create(node_config(Algorithm::BlessAll, vec![])).await?;

    let (factory1, flags1) = factory();
    let (factory2, flags2) = factory();
    let comp1 =
        Component::connect(runner.server_addr(), "c1", "g", json!(null), factory1).await?;
    let comp2 =
        Component::connect(runner.server_addr(), "c2", "g", json!(null), factory2).await?;

    comp1.set_ready(true).await?;
    comp2.set_ready(true).await?;

    let info1 = wait_for_info(&comp1, is_active).await?;
    let info2 = wait_for_info(&comp2, is_active).await?;

    assert_ne!(info1.blessing_req.token, info2.blessing_req.token);
    wait_until(|| flags1.created() == 1 && flags2.created() == 1).await?;

    comp1.close().await;
    comp2.close().await;
    runner.close().await;
    Ok(())
}

#[tokio::test]
async fn bless_one_elects_a_single_component_and_fails_over() -> Result<()> {
    let runner = Runner::create(node_config(Algorithm::BlessOne, vec![])).await?;

    let (factory1, flags1) = factory();
    let (factory2, flags2) = factory();
    let comp1 =
        Component::connect(runner.server_addr(), "c1", "g", json!(null), factory1).await?;
    let comp2 =
        Component::connect(runner.server_addr(), "c2", "g", json!(null), factory2).await?;

    comp1.set_ready(true).await?;
    comp2.set_ready(true).await?;

    // Exactly one of the two is ever started.
    wait_until(|| flags1.created() + flags2.created() == 1).await?;
    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(flags1.created() + flags2.created(), 1);

    // Kill the winner; the survivor inherits the blessing.
    let (winner, survivor, survivor_flags) = if flags1.created() == 1 {
        (comp1, comp2, flags2)
    } else {
        (comp2, comp1, flags1)
    };
    winner.close().await;

    wait_until(|| survivor_flags.created() == 1).await?;
    let info = wait_for_info(&survivor, is_active).await?;
    assert!(info.blessing_req.is_blessed());

    survivor.close().await;
    runner.close().await;
    Ok(())
}

#[tokio::test]
async fn master_failover_promotes_the_secondary() -> Result<()> {
    // N1 is the permanent primary, N2 follows it.
    let n1 = Runner::create(node_config(Algorithm::BlessAll, vec![])).await?;
    let n2 =
        Runner::create(node_config(Algorithm::BlessAll, vec![n1.master_addr()])).await?;

    let (factory1, flags) = factory();
    let comp = Component::connect(n2.server_addr(), "c1", "g", json!(null), factory1).await?;
    comp.set_ready(true).await?;

    // Blessed through N1's master; N2 is a slave with a non-zero mid.
    let info = wait_for_info(&comp, |info| is_active(info) && info.mid != 0).await?;
    assert_eq!(info.mid, 1);

    // N1 dies; within one retry cycle N2's master takes over and the
    // component is re-blessed under mid 0.
    n1.close().await;
    let _ = wait_for_info(&comp, |info| is_active(info) && info.mid == 0).await?;

    wait_until(|| flags.created() == 2 && flags.closed() == 1).await?;

    comp.close().await;
    n2.close().await;
    Ok(())
}

#[tokio::test]
async fn isolated_node_converges_once_a_parent_appears() -> Result<()> {
    // Reserve a port for the future parent.
    let parent_port = {
        let probe = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        probe.local_addr()?.port()
    };
    let parent_addr: SocketAddr = ([127, 0, 0, 1], parent_port).into();

    let node = Runner::create(node_config(Algorithm::BlessAll, vec![parent_addr])).await?;
    let (factory1, _flags) = factory();
    let comp = Component::connect(node.server_addr(), "c1", "g", json!(null), factory1).await?;
    comp.set_ready(true).await?;

    // No parent reachable: the local master takes over.
    let info = wait_for_info(&comp, |info| is_active(info) && info.mid == 0).await?;
    assert_eq!(info.mid, 0);

    // Bring the parent up on the reserved port; the node's unbounded
    // reconnect loop finds it and the local master steps down.
    let mut parent_conf = node_config(Algorithm::BlessAll, vec![]);
    parent_conf.master.port = parent_port;
    let parent = Runner::create(parent_conf).await?;

    let _ = wait_for_info(&comp, |info| is_active(info) && info.mid != 0).await?;

    comp.close().await;
    node.close().await;
    parent.close().await;
    Ok(())
}
