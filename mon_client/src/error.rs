// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use thiserror::Error;

/// A specialised `Result` type for client APIs.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the monitor client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failure on the monitor link.
    #[error("Comms error: {0}")]
    Comms(#[from] mon_comms::Error),

    /// The connection to the monitor server is gone.
    #[error("Client closed")]
    Closed,
}
