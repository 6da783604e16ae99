// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Comms for the Monitor Service.
//! All monitor links (component, slave and UI connections) are carried
//! over this framed transport.

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

mod error;

pub use self::error::{Error, Result};

use mon_interface::messaging::ObserverMsg;

use bytes::Bytes;
use std::{io, net::SocketAddr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};
use tracing::trace;

/// Upper bound on a single frame body. A peer announcing more than this is
/// either broken or hostile, and its connection is closed.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bind a listener for incoming monitor connections.
///
/// Port 0 is supported; read the effective address back with
/// [`TcpListener::local_addr`].
pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    trace!("listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// One monitor link: a long-lived, full-duplex, framed TCP connection.
///
/// Each frame is a `u32` big-endian length prefix followed by one encoded
/// [`ObserverMsg`].
#[derive(Debug)]
pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    /// Open a connection to a listening peer.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream)
    }

    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: ConnectionReader {
                inner: read_half,
                peer,
            },
            writer: ConnectionWriter {
                inner: write_half,
                peer,
            },
        })
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.reader.peer
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &ObserverMsg) -> Result<()> {
        self.writer.send(msg).await
    }

    /// Receive the next message.
    pub async fn recv(&mut self) -> Result<ObserverMsg> {
        self.reader.recv().await
    }

    /// Send one raw frame body.
    pub async fn send_frame(&mut self, body: &[u8]) -> Result<()> {
        self.writer.send_frame(body).await
    }

    /// Receive the next raw frame body.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        self.reader.recv_frame().await
    }

    /// Split into independently usable halves, so one task can read while
    /// another writes.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

/// Reading half of a [`Connection`].
#[derive(Debug)]
pub struct ConnectionReader {
    inner: OwnedReadHalf,
    peer: SocketAddr,
}

impl ConnectionReader {
    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Receive the next message.
    ///
    /// Returns [`Error::Closed`] once the peer has hung up cleanly. Any
    /// decode failure means the link is unusable and must be dropped.
    pub async fn recv(&mut self) -> Result<ObserverMsg> {
        let body = self.recv_frame().await?;
        let msg = ObserverMsg::from_bytes(&body)?;
        trace!("received {} from {}", msg.name(), self.peer);
        Ok(msg)
    }

    /// Receive the next raw frame body.
    pub async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        if let Err(error) = self.inner.read_exact(&mut len_buf).await {
            return Err(match error.kind() {
                io::ErrorKind::UnexpectedEof => Error::Closed,
                _ => error.into(),
            });
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        Ok(body)
    }
}

/// Writing half of a [`Connection`].
#[derive(Debug)]
pub struct ConnectionWriter {
    inner: OwnedWriteHalf,
    peer: SocketAddr,
}

impl ConnectionWriter {
    /// The peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one message.
    ///
    /// Cancellation mid-send may leave a partial frame on the wire; the
    /// peer will observe the subsequent connection loss.
    pub async fn send(&mut self, msg: &ObserverMsg) -> Result<()> {
        let body: Bytes = msg.to_bytes()?;
        self.send_frame(&body).await?;
        trace!("sent {} to {}", msg.name(), self.peer);
        Ok(())
    }

    /// Send one raw frame body.
    pub async fn send_frame(&mut self, body: &[u8]) -> Result<()> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(body.len()));
        }

        self.inner.write_u32(body.len() as u32).await?;
        self.inner.write_all(body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut the writing direction down, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mon_interface::messaging::{MsgClient, MsgServer};
    use mon_interface::types::BlessingRes;

    use assert_matches::assert_matches;
    use eyre::Result;
    use serde_json::json;
    use std::{net::Ipv4Addr, time::Duration};
    use tokio::time;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn local_addr() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, 0).into()
    }

    async fn connected_pair() -> Result<(Connection, Connection)> {
        let listener = listen(local_addr()).await?;
        let addr = listener.local_addr()?;

        let connect = Connection::connect(addr);
        let accept = async {
            let (stream, _) = listener.accept().await?;
            Connection::new(stream).map_err(eyre::Report::from)
        };
        let (outgoing, incoming) = tokio::join!(connect, accept);
        Ok((outgoing?, incoming?))
    }

    #[tokio::test]
    async fn full_duplex_send_and_recv() -> Result<()> {
        let (mut client, mut server) = connected_pair().await?;

        let up = ObserverMsg::Client(MsgClient {
            name: "c1".to_string(),
            group: "g1".to_string(),
            data: json!({"port": 8080}),
            blessing_res: BlessingRes {
                token: None,
                ready: true,
            },
        });
        let down = ObserverMsg::Server(MsgServer {
            cid: 1,
            mid: 0,
            components: vec![],
        });

        client.send(&up).await?;
        server.send(&down).await?;

        let received_up = time::timeout(TIMEOUT, server.recv()).await??;
        let received_down = time::timeout(TIMEOUT, client.recv()).await??;

        assert_eq!(received_up, up);
        assert_eq!(received_down, down);
        Ok(())
    }

    #[tokio::test]
    async fn recv_reports_closed_on_peer_hangup() -> Result<()> {
        let (client, mut server) = connected_pair().await?;

        drop(client);

        let result = time::timeout(TIMEOUT, server.recv()).await?;
        assert_matches!(result, Err(Error::Closed));
        Ok(())
    }

    #[tokio::test]
    async fn split_halves_work_concurrently() -> Result<()> {
        let (client, mut server) = connected_pair().await?;
        let (mut reader, mut writer) = client.into_split();

        let msg = ObserverMsg::Close;
        server.send(&msg).await?;
        let received = time::timeout(TIMEOUT, reader.recv()).await??;
        assert_eq!(received, msg);

        writer.send(&msg).await?;
        let received = time::timeout(TIMEOUT, server.recv()).await??;
        assert_eq!(received, msg);
        Ok(())
    }
}
