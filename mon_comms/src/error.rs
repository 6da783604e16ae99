// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::io;
use thiserror::Error;

/// A specialised `Result` type for comms APIs.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur on a monitor link.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The peer closed the connection cleanly.
    #[error("Connection closed by peer")]
    Closed,

    /// A frame announced a body larger than the transport allows.
    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// Message encoding or decoding failed.
    #[error("Messaging error: {0}")]
    Messaging(#[from] mon_interface::messaging::Error),

    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
