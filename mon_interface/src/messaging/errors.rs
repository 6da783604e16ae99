// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::result;
use thiserror::Error;

/// A specialised `Result` type for messaging APIs.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Errors that can occur when interacting with messaging APIs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An error occurred when serialising a message.
    #[error("Failed to serialise message: {0}")]
    Serialisation(String),

    /// Failed to parse a message.
    ///
    /// The `String` will be a human-readable indication of the problem with
    /// the message. The connection the message arrived on must be closed.
    #[error("Failed to parse: {0}")]
    FailedToParse(String),
}
