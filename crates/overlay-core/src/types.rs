//! Shared routing types.
//!
//! Field names follow the facade contract exactly so a transport bridge can
//! serialize these types without a translation layer.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Globally unique peer id, assigned by the root router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an opaque id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Connection id, minted by the router that hosts the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an opaque id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A connection as recorded by the routing tree.
///
/// Registered only at the lowest router that sees both endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Connection id
    pub id: ConnectionId,
    /// Peer that opened the connection
    pub client: PeerId,
    /// Peer that accepted the connection
    pub server: PeerId,
}

impl ConnectionRecord {
    /// The endpoint opposite to `source`, or `None` if `source` is neither
    /// endpoint.
    pub fn other_end(&self, source: &PeerId) -> Option<&PeerId> {
        if &self.client == source {
            Some(&self.server)
        } else if &self.server == source {
            Some(&self.client)
        } else {
            None
        }
    }

    /// Whether `(source, target)` names the endpoints in either direction.
    pub fn links(&self, source: &PeerId, target: &PeerId) -> bool {
        (&self.client == source && &self.server == target)
            || (&self.server == source && &self.client == target)
    }
}

/// A single payload travelling over a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Sending peer
    pub source: PeerId,
    /// Receiving peer
    pub target: PeerId,
    /// Connection the packet belongs to
    pub connection: ConnectionId,
    /// Opaque payload
    pub data: Bytes,
}

/// Externally visible projection of a registered peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer id
    pub id: PeerId,
    /// Human-readable name
    pub name: String,
}
