use std::{collections::HashMap, fmt, net::SocketAddr};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Server-generated identity of one accepted connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Write side of a duplex channel.
///
/// Frames are queued to the single writer task that owns the socket, so
/// concurrent writers never interleave partial frames.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<Vec<u8>>,
    remote_addr: Option<SocketAddr>,
}

#[derive(Debug, Error)]
#[error("connection {0} is closed")]
pub struct FrameWriteError(pub ConnectionId);

impl Connection {
    pub fn new(sender: mpsc::Sender<Vec<u8>>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
            remote_addr,
        }
    }

    /// Creates a connection together with the receiving end its writer drains.
    pub fn channel(
        buffer: usize,
        remote_addr: Option<SocketAddr>,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx, remote_addr), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn write_frame(&self, frame: Vec<u8>) -> Result<(), FrameWriteError> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| FrameWriteError(self.id))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} closed before it could be registered")]
    TransportClosed(ConnectionId),
}

/// Every live connection, keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Connection) -> Result<ConnectionId, RegistryError> {
        let id = connection.id();
        if connection.is_closed() {
            return Err(RegistryError::TransportClosed(id));
        }
        self.connections.lock().insert(id, connection);
        Ok(id)
    }

    pub fn unregister(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.lock().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
