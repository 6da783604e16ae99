// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Observer Server protocol tests, driven over raw framed connections.

use mon_comms::Connection;
use mon_interface::messaging::{MsgClient, MsgServer, MsgSlave, ObserverMsg};
use mon_interface::{BlessingReq, BlessingRes, ComponentInfo};
use mon_node::observer::server::{Server, ServerState};

use eyre::{bail, Result};
use serde_json::json;
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{sync::watch, time};

const TIMEOUT: Duration = Duration::from_secs(5);

fn local_addr() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 0).into()
}

async fn listen() -> Result<Server> {
    Ok(Server::listen(local_addr(), 1, Duration::from_millis(500)).await?)
}

async fn recv_server_msg(conn: &mut Connection) -> Result<MsgServer> {
    match time::timeout(TIMEOUT, conn.recv()).await?? {
        ObserverMsg::Server(msg) => Ok(msg),
        msg => bail!("expected MsgServer, got {}", msg.name()),
    }
}

async fn wait_for_state(
    state_rx: &mut watch::Receiver<ServerState>,
    mut pred: impl FnMut(&ServerState) -> bool,
) -> Result<ServerState> {
    let state = time::timeout(TIMEOUT, async {
        loop {
            {
                let current = state_rx.borrow_and_update();
                if pred(&current) {
                    return Ok(current.clone());
                }
            }
            if state_rx.changed().await.is_err() {
                bail!("server state channel closed");
            }
        }
    })
    .await??;
    Ok(state)
}

fn client_msg(name: &str, group: &str, ready: bool) -> ObserverMsg {
    ObserverMsg::Client(MsgClient {
        name: name.to_string(),
        group: group.to_string(),
        data: json!(null),
        blessing_res: BlessingRes { token: None, ready },
    })
}

#[tokio::test]
async fn assigns_cids_and_sends_snapshots() -> Result<()> {
    let server = listen().await?;
    let mut state_rx = server.state_receiver();

    let mut conn1 = Connection::connect(server.local_addr()).await?;
    let snapshot = recv_server_msg(&mut conn1).await?;
    assert_eq!(snapshot.cid, 1);
    assert_eq!(snapshot.mid, 0);
    assert!(snapshot.components.is_empty());

    let mut conn2 = Connection::connect(server.local_addr()).await?;
    let snapshot = recv_server_msg(&mut conn2).await?;
    assert_eq!(snapshot.cid, 2);

    let state = wait_for_state(&mut state_rx, |state| state.local_components.len() == 2).await?;
    let cids: Vec<_> = state.local_components.iter().map(|info| info.cid).collect();
    assert_eq!(cids, vec![1, 2]);

    // Placeholder until the first client message arrives.
    let placeholder = &state.local_components[0];
    assert_eq!(placeholder.name, None);
    assert_eq!(placeholder.group, None);
    assert_eq!(placeholder.rank, 1);
    assert_eq!(placeholder.blessing_req, BlessingReq::none());

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn client_msg_updates_local_component() -> Result<()> {
    let server = listen().await?;
    let mut state_rx = server.state_receiver();

    let mut conn = Connection::connect(server.local_addr()).await?;
    let _ = recv_server_msg(&mut conn).await?;

    conn.send(&ObserverMsg::Client(MsgClient {
        name: "c1".to_string(),
        group: "g1".to_string(),
        data: json!({"port": 1234}),
        blessing_res: BlessingRes {
            token: None,
            ready: true,
        },
    }))
    .await?;

    let state = wait_for_state(&mut state_rx, |state| {
        state
            .local_components
            .first()
            .map_or(false, |info| info.name.is_some())
    })
    .await?;

    let info = &state.local_components[0];
    assert_eq!(info.name.as_deref(), Some("c1"));
    assert_eq!(info.group.as_deref(), Some("g1"));
    assert_eq!(info.data, json!({"port": 1234}));
    assert!(info.blessing_res.ready);

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn update_overlays_blessing_and_mid() -> Result<()> {
    let server = listen().await?;
    let mut state_rx = server.state_receiver();

    let mut conn = Connection::connect(server.local_addr()).await?;
    let _ = recv_server_msg(&mut conn).await?;
    conn.send(&client_msg("c1", "g1", true)).await?;
    let state =
        wait_for_state(&mut state_rx, |state| {
            state
                .local_components
                .first()
                .map_or(false, |info| info.name.is_some())
        })
        .await?;

    // What the active master would decide for this component.
    let mut blessed = state.local_components[0].clone();
    blessed.mid = 5;
    blessed.blessing_req = BlessingReq {
        token: Some(42),
        timestamp: Some(1.0),
    };
    server.update(5, vec![blessed.clone()]).await?;

    let state = wait_for_state(&mut state_rx, |state| state.mid == 5).await?;
    assert_eq!(state.local_components[0].mid, 5);
    assert_eq!(state.local_components[0].blessing_req.token, Some(42));
    assert_eq!(state.global_components, vec![blessed]);

    // The connected component sees the new view with its own cid header.
    let msg = loop {
        let msg = recv_server_msg(&mut conn).await?;
        if msg.mid == 5 {
            break msg;
        }
    };
    assert_eq!(msg.cid, 1);
    assert_eq!(msg.components.len(), 1);
    assert_eq!(msg.components[0].blessing_req.token, Some(42));

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn rank_survives_reconnect() -> Result<()> {
    let server = listen().await?;
    let mut state_rx = server.state_receiver();

    let mut conn = Connection::connect(server.local_addr()).await?;
    let _ = recv_server_msg(&mut conn).await?;
    conn.send(&client_msg("n", "g", false)).await?;
    let _ = wait_for_state(&mut state_rx, |state| {
        state
            .local_components
            .first()
            .map_or(false, |info| info.name.is_some())
    })
    .await?;

    server.set_rank(1, 7).await?;
    let state = wait_for_state(&mut state_rx, |state| {
        state.local_components.first().map_or(false, |info| info.rank == 7)
    })
    .await?;
    assert_eq!(state.local_components[0].rank, 7);

    // Setting an unknown cid must change nothing.
    server.set_rank(99, 3).await?;
    assert_eq!(server.state().local_components[0].rank, 7);

    drop(conn);
    let _ = wait_for_state(&mut state_rx, |state| state.local_components.is_empty()).await?;

    // A new connection with the same (name, group) inherits the rank.
    let mut conn = Connection::connect(server.local_addr()).await?;
    let _ = recv_server_msg(&mut conn).await?;
    conn.send(&client_msg("n", "g", false)).await?;

    let state = wait_for_state(&mut state_rx, |state| {
        state
            .local_components
            .first()
            .map_or(false, |info| info.name.is_some())
    })
    .await?;
    assert_eq!(state.local_components[0].cid, 2);
    assert_eq!(state.local_components[0].rank, 7);

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn protocol_violation_drops_connection() -> Result<()> {
    let server = listen().await?;
    let mut state_rx = server.state_receiver();

    let mut conn = Connection::connect(server.local_addr()).await?;
    let _ = recv_server_msg(&mut conn).await?;
    let _ = wait_for_state(&mut state_rx, |state| state.local_components.len() == 1).await?;

    // A component must never speak the federation protocol.
    conn.send(&ObserverMsg::Slave(MsgSlave { components: vec![] }))
        .await?;

    let _ = wait_for_state(&mut state_rx, |state| state.local_components.is_empty()).await?;

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn close_requests_graceful_shutdown() -> Result<()> {
    let server = listen().await?;
    let mut conn = Connection::connect(server.local_addr()).await?;
    let _ = recv_server_msg(&mut conn).await?;

    server.close().await;

    // Every queued message until the close request is a snapshot.
    let msg = time::timeout(TIMEOUT, async {
        loop {
            match conn.recv().await? {
                ObserverMsg::Server(_) => continue,
                msg => return Ok::<_, mon_comms::Error>(msg),
            }
        }
    })
    .await??;
    assert!(matches!(msg, ObserverMsg::Close));
    Ok(())
}

#[tokio::test]
async fn state_is_fanned_out_to_every_component() -> Result<()> {
    let server = listen().await?;
    let mut state_rx = server.state_receiver();

    let mut conn1 = Connection::connect(server.local_addr()).await?;
    let _ = recv_server_msg(&mut conn1).await?;
    let mut conn2 = Connection::connect(server.local_addr()).await?;
    let _ = recv_server_msg(&mut conn2).await?;
    let _ = wait_for_state(&mut state_rx, |state| state.local_components.len() == 2).await?;

    let global: Vec<ComponentInfo> = server
        .state()
        .local_components
        .iter()
        .cloned()
        .map(|mut info| {
            info.mid = 1;
            info
        })
        .collect();
    server.update(1, global).await?;

    for (conn, own_cid) in [(&mut conn1, 1), (&mut conn2, 2)] {
        let msg = loop {
            let msg = recv_server_msg(conn).await?;
            if msg.mid == 1 {
                break msg;
            }
        };
        assert_eq!(msg.cid, own_cid);
        assert_eq!(msg.components.len(), 2);
    }

    server.close().await;
    Ok(())
}
