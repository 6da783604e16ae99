// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Monitor Service client library.
//!
//! Components embed this crate to participate in blessing: the [`client`]
//! module keeps the connection to the local monitor server, the
//! [`component`] module runs exactly one user-supplied runner whenever the
//! component holds a confirmed grant.

#![doc(
    html_logo_url = "https://github.com/maidsafe/QA/raw/master/Images/maidsafe_logo.png",
    html_favicon_url = "https://maidsafe.net/img/favicon.ico",
    test(attr(deny(warnings)))
)]
// Forbid some very bad patterns. Forbid is stronger than `deny`, preventing us from suppressing the
// lint with `#[allow(...)]` et-all.
#![forbid(
    arithmetic_overflow,
    mutable_transmutes,
    no_mangle_const_items,
    unknown_crate_types,
    unsafe_code
)]
// Turn on some additional warnings to encourage good style.
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    clippy::unicode_not_nfc,
    clippy::unwrap_used
)]

pub mod client;
pub mod component;

mod error;

pub use self::{
    client::{Client, ClientState},
    component::{Component, ComponentRunner, RunnerFactory},
    error::{Error, Result},
};

use tokio::sync::watch;

/// Command channel depth used by client and component actors.
pub(crate) const CMD_CHANNEL_SIZE: usize = 1024;

/// Awaits a boolean flag. Also resolves when the flag's sender is gone,
/// which only happens once the owning task ended.
pub(crate) async fn flag_wait(mut flag_rx: watch::Receiver<bool>) {
    loop {
        if *flag_rx.borrow() {
            return;
        }
        if flag_rx.changed().await.is_err() {
            return;
        }
    }
}
