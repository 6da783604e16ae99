// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Data model shared by monitor servers, masters and components.

use serde::{Deserialize, Serialize};

/// Component id, unique within one monitor server for the lifetime of the
/// component's connection. Assigned monotonically from 1.
pub type Cid = u64;

/// Monitor id, unique within one master for the lifetime of the monitor's
/// connection. Mid 0 is reserved for the master's own local server.
pub type Mid = u64;

/// Blessing request issued by the active master. The token identifies a
/// single election grant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlessingReq {
    /// Grant token, `None` when the component is not blessed.
    pub token: Option<u64>,
    /// Seconds since Unix epoch at which the token was issued.
    pub timestamp: Option<f64>,
}

impl BlessingReq {
    /// A request carrying neither token nor timestamp.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether both token and timestamp are set.
    pub fn is_blessed(&self) -> bool {
        self.token.is_some() && self.timestamp.is_some()
    }
}

/// Blessing response written by the component: the token it has accepted
/// (a readback of the request) and whether it is willing to run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlessingRes {
    /// Token echoed back by the component.
    pub token: Option<u64>,
    /// Component's readiness to perform its active work.
    pub ready: bool,
}

/// Everything a monitor server knows about one connected component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// Component id, local to the owning server.
    pub cid: Cid,
    /// Monitor id of the owning server within the federation.
    pub mid: Mid,
    /// Component name; `None` until the first `MsgClient` arrives.
    pub name: Option<String>,
    /// Election group; `None` until the first `MsgClient` arrives.
    pub group: Option<String>,
    /// Opaque component descriptor, forwarded verbatim.
    pub data: serde_json::Value,
    /// Operator-settable election tie-breaker, lower wins.
    pub rank: i64,
    /// Master-issued grant.
    pub blessing_req: BlessingReq,
    /// Component-written readback.
    pub blessing_res: BlessingRes,
}

/// Per-group election policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Every ready component in the group runs concurrently.
    #[serde(rename = "BLESS_ALL")]
    BlessAll,
    /// Exactly one ready component in the group runs, with failover.
    #[serde(rename = "BLESS_ONE")]
    BlessOne,
}
