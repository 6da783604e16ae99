// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The three federated observer roles of a monitor node.
//!
//! The [`server`] accepts component connections and owns the node's local
//! view; the [`master`] merges per-node views into the global one and runs
//! blessing; the [`slave`] reports the local view to a remote master.

pub mod master;
pub mod server;
pub mod slave;

use mon_comms::ConnectionWriter;
use mon_interface::messaging::ObserverMsg;

use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Command channel depth of an observer actor.
pub(crate) const CMD_CHANNEL_SIZE: usize = 1024;

/// Per-connection outbox depth. A peer that cannot drain this many queued
/// messages is dropped.
pub(crate) const CONN_OUTBOX_SIZE: usize = 256;

/// Awaits the closed flag of an observer resource. Also resolves when the
/// flag's sender is gone, which only happens once the owning task ended.
pub(crate) async fn closed_wait(mut closed_rx: watch::Receiver<bool>) {
    loop {
        if *closed_rx.borrow() {
            return;
        }
        if closed_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Drains an outbox onto a connection until the outbox is dropped or the
/// peer becomes unwritable.
pub(crate) async fn write_loop(
    mut writer: ConnectionWriter,
    mut outbox: mpsc::Receiver<ObserverMsg>,
) {
    while let Some(msg) = outbox.recv().await {
        if let Err(error) = writer.send(&msg).await {
            debug!("write to {} failed: {error}", writer.peer_addr());
            break;
        }
    }
    let _ = writer.shutdown().await;
}
