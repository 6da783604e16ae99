// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Operator surface tests.

use mon_comms::Connection;
use mon_interface::{BlessingReq, BlessingRes, ComponentInfo};
use mon_node::observer::server::ServerState;
use mon_node::ui::{SetRankRequest, UiServer};

use eyre::Result;
use serde_json::json;
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::time;

const TIMEOUT: Duration = Duration::from_secs(5);

fn local_addr() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 0).into()
}

fn state_with_component() -> ServerState {
    ServerState {
        mid: 2,
        local_components: vec![ComponentInfo {
            cid: 1,
            mid: 2,
            name: Some("c1".to_string()),
            group: Some("g1".to_string()),
            data: json!(null),
            rank: 1,
            blessing_req: BlessingReq::none(),
            blessing_res: BlessingRes::default(),
        }],
        global_components: vec![],
    }
}

async fn recv_snapshot(conn: &mut Connection) -> Result<serde_json::Value> {
    let body = time::timeout(TIMEOUT, conn.recv_frame()).await??;
    Ok(serde_json::from_slice(&body)?)
}

#[tokio::test]
async fn pushes_snapshots_on_connect_and_change() -> Result<()> {
    let (ui, _requests) = UiServer::listen(local_addr(), ServerState::default()).await?;

    let mut conn = Connection::connect(ui.local_addr()).await?;
    let seeded = recv_snapshot(&mut conn).await?;
    assert_eq!(seeded["mid"], json!(0));
    assert_eq!(seeded["local_components"], json!([]));

    ui.set_state(&state_with_component()).await?;
    let updated = recv_snapshot(&mut conn).await?;
    assert_eq!(updated["mid"], json!(2));
    assert_eq!(updated["local_components"][0]["cid"], json!(1));
    assert_eq!(updated["local_components"][0]["name"], json!("c1"));

    ui.close().await;
    Ok(())
}

#[tokio::test]
async fn set_rank_requests_are_forwarded() -> Result<()> {
    let (ui, mut requests) = UiServer::listen(local_addr(), ServerState::default()).await?;

    let mut conn = Connection::connect(ui.local_addr()).await?;
    let _ = recv_snapshot(&mut conn).await?;

    conn.send_frame(br#"{"type": "set_rank", "cid": 1, "rank": 7}"#)
        .await?;

    let request = time::timeout(TIMEOUT, requests.recv())
        .await?
        .ok_or_else(|| eyre::eyre!("request channel closed"))?;
    assert_eq!(request, SetRankRequest { cid: 1, rank: 7 });

    ui.close().await;
    Ok(())
}

#[tokio::test]
async fn unknown_request_type_closes_the_connection() -> Result<()> {
    let (ui, _requests) = UiServer::listen(local_addr(), ServerState::default()).await?;

    let mut conn = Connection::connect(ui.local_addr()).await?;
    let _ = recv_snapshot(&mut conn).await?;

    conn.send_frame(br#"{"type": "shutdown"}"#).await?;

    let result = time::timeout(TIMEOUT, async {
        loop {
            if let Err(error) = conn.recv_frame().await {
                return error;
            }
        }
    })
    .await?;
    assert!(matches!(
        result,
        mon_comms::Error::Closed | mon_comms::Error::Io(_)
    ));

    ui.close().await;
    Ok(())
}
