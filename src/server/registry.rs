use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::network::encode_frame;
use crate::{AppError, AppResult};

/// Stable identity of one accepted connection, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The send half and control surface of one registered peer.
///
/// The write half sits behind its own lock so concurrent senders serialize
/// per connection without holding the registry lock across I/O. The close
/// token is observed by the connection's read task; cancelling it is how a
/// close request from any thread takes effect on the next dispatch.
pub(crate) struct PeerHandle {
    peer_addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    close_token: CancellationToken,
}

/// Thread-safe set of currently live server connections.
///
/// All structural mutation goes through the map's internal locking; lookups
/// for send and close never hold a map guard across an await point.
pub struct ConnectionRegistry {
    peers: DashMap<ConnectionId, PeerHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            peers: DashMap::new(),
        }
    }

    pub(crate) fn add(
        &self,
        id: ConnectionId,
        peer_addr: SocketAddr,
        writer: OwnedWriteHalf,
        close_token: CancellationToken,
    ) {
        self.peers.insert(
            id,
            PeerHandle {
                peer_addr,
                writer: Arc::new(Mutex::new(writer)),
                close_token,
            },
        );
    }

    /// Removes the connection and gracefully shuts its socket down.
    ///
    /// Returns false if the connection was already gone.
    pub(crate) async fn remove_and_close(&self, id: ConnectionId) -> bool {
        let Some((_, peer)) = self.peers.remove(&id) else {
            return false;
        };
        info!("closing connection {} ({})", id, peer.peer_addr);
        let mut writer = peer.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("error shutting down socket for {}: {}", id, e);
        }
        true
    }

    /// Encodes and writes one message to a registered connection.
    ///
    /// With `nonblocking` set, a writer already busy with another send fails
    /// fast with `WouldBlock` instead of waiting its turn.
    pub async fn send_to(
        &self,
        id: ConnectionId,
        payload: &[u8],
        nonblocking: bool,
    ) -> AppResult<()> {
        let frame = encode_frame(payload)?;
        let writer = self
            .peers
            .get(&id)
            .map(|peer| peer.writer.clone())
            .ok_or(AppError::ConnectionNotFound(id))?;
        if nonblocking {
            match writer.try_lock() {
                Ok(mut guard) => write_frame(&mut guard, &frame).await,
                Err(_) => Err(AppError::WouldBlock),
            }
        } else {
            let mut guard = writer.lock().await;
            write_frame(&mut guard, &frame).await
        }
    }

    /// Asks the connection's read task to tear the connection down.
    ///
    /// Resolved cooperatively: the socket stays open until the task observes
    /// the token on its next dispatch evaluation.
    pub fn request_close(&self, id: ConnectionId) -> AppResult<()> {
        let peer = self
            .peers
            .get(&id)
            .ok_or(AppError::ConnectionNotFound(id))?;
        debug!("got close request for {}", id);
        peer.close_token.cancel();
        Ok(())
    }

    /// Requests close on every live connection. Used at server shutdown.
    pub(crate) fn close_all(&self) {
        for peer in self.peers.iter() {
            peer.close_token.cancel();
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.peers.get(&id).map(|peer| peer.peer_addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new()
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Bytes) -> AppResult<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
