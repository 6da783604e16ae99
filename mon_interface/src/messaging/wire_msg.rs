// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Byte level encoding of observer messages.
//!
//! Frame bodies are bincode, which tags every `Option` explicitly, so an
//! absent `name`/`group`/token is never conflated with a null value. The
//! opaque `data` descriptor travels as JSON text inside the body (the body
//! format is not self-describing) and is re-parsed at the boundary, so a
//! malformed descriptor surfaces as a decode error on the receiving side.

use super::{Error, MsgClient, MsgMaster, MsgServer, MsgSlave, ObserverMsg, Result};
use crate::types::{BlessingReq, BlessingRes, Cid, ComponentInfo, Mid};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

impl ObserverMsg {
    /// Serialise this message into one frame body.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let wire = WireMsg::from_msg(self)?;
        let bytes = bincode::serialize(&wire).map_err(|err| Error::Serialisation(err.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    /// Deserialise a frame body into a message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let wire: WireMsg =
            bincode::deserialize(bytes).map_err(|err| Error::FailedToParse(err.to_string()))?;
        wire.into_msg()
    }
}

#[derive(Serialize, Deserialize)]
enum WireMsg {
    Client {
        name: String,
        group: String,
        data: String,
        blessing_res: BlessingRes,
    },
    Server {
        cid: Cid,
        mid: Mid,
        components: Vec<WireComponentInfo>,
    },
    Close,
    Slave {
        components: Vec<WireComponentInfo>,
    },
    Master {
        mid: Mid,
        components: Vec<WireComponentInfo>,
    },
}

#[derive(Serialize, Deserialize)]
struct WireComponentInfo {
    cid: Cid,
    mid: Mid,
    name: Option<String>,
    group: Option<String>,
    data: String,
    rank: i64,
    blessing_req: BlessingReq,
    blessing_res: BlessingRes,
}

impl WireMsg {
    fn from_msg(msg: &ObserverMsg) -> Result<Self> {
        Ok(match msg {
            ObserverMsg::Client(MsgClient {
                name,
                group,
                data,
                blessing_res,
            }) => Self::Client {
                name: name.clone(),
                group: group.clone(),
                data: encode_data(data)?,
                blessing_res: *blessing_res,
            },
            ObserverMsg::Server(MsgServer {
                cid,
                mid,
                components,
            }) => Self::Server {
                cid: *cid,
                mid: *mid,
                components: to_wire_components(components)?,
            },
            ObserverMsg::Close => Self::Close,
            ObserverMsg::Slave(MsgSlave { components }) => Self::Slave {
                components: to_wire_components(components)?,
            },
            ObserverMsg::Master(MsgMaster { mid, components }) => Self::Master {
                mid: *mid,
                components: to_wire_components(components)?,
            },
        })
    }

    fn into_msg(self) -> Result<ObserverMsg> {
        Ok(match self {
            Self::Client {
                name,
                group,
                data,
                blessing_res,
            } => ObserverMsg::Client(MsgClient {
                name,
                group,
                data: decode_data(&data)?,
                blessing_res,
            }),
            Self::Server {
                cid,
                mid,
                components,
            } => ObserverMsg::Server(MsgServer {
                cid,
                mid,
                components: from_wire_components(components)?,
            }),
            Self::Close => ObserverMsg::Close,
            Self::Slave { components } => ObserverMsg::Slave(MsgSlave {
                components: from_wire_components(components)?,
            }),
            Self::Master { mid, components } => ObserverMsg::Master(MsgMaster {
                mid,
                components: from_wire_components(components)?,
            }),
        })
    }
}

impl WireComponentInfo {
    fn from_info(info: &ComponentInfo) -> Result<Self> {
        Ok(Self {
            cid: info.cid,
            mid: info.mid,
            name: info.name.clone(),
            group: info.group.clone(),
            data: encode_data(&info.data)?,
            rank: info.rank,
            blessing_req: info.blessing_req,
            blessing_res: info.blessing_res,
        })
    }

    fn into_info(self) -> Result<ComponentInfo> {
        Ok(ComponentInfo {
            cid: self.cid,
            mid: self.mid,
            name: self.name,
            group: self.group,
            data: decode_data(&self.data)?,
            rank: self.rank,
            blessing_req: self.blessing_req,
            blessing_res: self.blessing_res,
        })
    }
}

fn to_wire_components(components: &[ComponentInfo]) -> Result<Vec<WireComponentInfo>> {
    components.iter().map(WireComponentInfo::from_info).collect()
}

fn from_wire_components(components: Vec<WireComponentInfo>) -> Result<Vec<ComponentInfo>> {
    components
        .into_iter()
        .map(WireComponentInfo::into_info)
        .collect()
}

fn encode_data(data: &serde_json::Value) -> Result<String> {
    serde_json::to_string(data).map_err(|err| Error::Serialisation(err.to_string()))
}

fn decode_data(data: &str) -> Result<serde_json::Value> {
    serde_json::from_str(data).map_err(|err| Error::FailedToParse(err.to_string()))
}
