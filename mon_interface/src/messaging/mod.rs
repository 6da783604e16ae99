// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The observer messaging interface.
//!
//! Five messages are exchanged over the monitor links. Components and their
//! local server speak `MsgClient` / `MsgServer` / `MsgClose`; monitor
//! servers and the federation master speak `MsgSlave` / `MsgMaster`. The
//! `wire_msg` module defines the byte-level format.

// Error types definitions
mod errors;
// Byte level encoding of observer messages
mod wire_msg;

pub use self::errors::{Error, Result};

use crate::types::{BlessingRes, Cid, ComponentInfo, Mid};

/// Component to server: announce identity, descriptor and blessing readback.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgClient {
    /// Component name.
    pub name: String,
    /// Election group.
    pub group: String,
    /// Opaque descriptor, forwarded verbatim.
    pub data: serde_json::Value,
    /// Component's blessing readback.
    pub blessing_res: BlessingRes,
}

/// Server to component: the receiving component's ids and the global view.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgServer {
    /// Cid assigned to the receiving connection.
    pub cid: Cid,
    /// Mid of the sending server.
    pub mid: Mid,
    /// Global component list.
    pub components: Vec<ComponentInfo>,
}

/// Slave to master: the slave's local components.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgSlave {
    /// Local component list of the reporting server.
    pub components: Vec<ComponentInfo>,
}

/// Master to slave: the mid assigned to the receiving slave and the merged
/// global view.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgMaster {
    /// Mid assigned to the receiving slave.
    pub mid: Mid,
    /// Merged global component list.
    pub components: Vec<ComponentInfo>,
}

/// A message carried by one frame of the monitor wire transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverMsg {
    /// Component to server.
    Client(MsgClient),
    /// Server to component.
    Server(MsgServer),
    /// Server to component: request graceful shutdown.
    Close,
    /// Slave to master.
    Slave(MsgSlave),
    /// Master to slave.
    Master(MsgMaster),
}

impl ObserverMsg {
    /// Short message name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Client(_) => "MsgClient",
            Self::Server(_) => "MsgServer",
            Self::Close => "MsgClose",
            Self::Slave(_) => "MsgSlave",
            Self::Master(_) => "MsgMaster",
        }
    }
}
