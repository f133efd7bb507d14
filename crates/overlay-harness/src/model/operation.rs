//! Operations for model-based testing.
//!
//! Operations are generated randomly (by proptest or the fuzzer) and applied
//! to both the model and a real tree. Every slot is reduced modulo the number
//! of live candidates, so any generated value addresses something.

use arbitrary::Arbitrary;
use overlay_core::NetworkError;

use crate::topology::TopologyError;

/// Router index, reduced modulo the router count.
pub type RouterSlot = u8;

/// Peer index in registration order, reduced modulo the peer count.
pub type PeerSlot = u8;

/// Connection index in creation order, reduced modulo the connection count.
pub type ConnectionSlot = u8;

/// Reason used by [`Operation::End`].
pub const END_REASON: &str = "end requested";

/// Actions applied to the network.
#[derive(Debug, Clone, Arbitrary)]
pub enum Operation {
    /// Register a new peer.
    AddPeer {
        /// Router to attach to
        router: RouterSlot,
        /// Name tag, mapped to one of four names
        name: u8,
    },

    /// Start accepting inbound connections.
    EnableHost {
        /// Peer
        peer: PeerSlot,
    },

    /// Open a connection.
    Connect {
        /// Connecting peer
        client: PeerSlot,
        /// Target peer
        server: PeerSlot,
    },

    /// Send a payload over a connection.
    Send {
        /// Connection
        connection: ConnectionSlot,
        /// Sending endpoint
        side: Side,
        /// Payload
        payload: SmallPayload,
    },

    /// End a connection with [`END_REASON`].
    End {
        /// Connection
        connection: ConnectionSlot,
        /// Ending endpoint
        side: Side,
    },

    /// Dispose a connection endpoint.
    DisposeConnection {
        /// Connection
        connection: ConnectionSlot,
        /// Disposing endpoint
        side: Side,
    },

    /// Dispose a peer.
    DisposePeer {
        /// Peer
        peer: PeerSlot,
    },

    /// Look peers up by name at the root.
    FindByName {
        /// Name tag
        name: u8,
    },
}

/// One endpoint of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Arbitrary)]
pub enum Side {
    /// Connecting endpoint
    Client,
    /// Accepting endpoint
    Server,
}

/// Compact payload description, expanded deterministically.
#[derive(Debug, Clone, Arbitrary)]
pub struct SmallPayload {
    /// Content seed
    pub seed: u8,
    /// Length class: empty, small, medium or large
    pub size_class: u8,
}

impl SmallPayload {
    /// Expand to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let len: u8 = match self.size_class % 4 {
            0 => 0,
            1 => 4,
            2 => 32,
            _ => 128,
        };

        (0..len).map(|i| self.seed.wrapping_add(i)).collect()
    }
}

/// Map a name tag to a peer name.
pub fn peer_name(tag: u8) -> String {
    format!("p{}", tag % 4)
}

/// Resolve `slot` against `len` candidates.
pub fn resolve(slot: u8, len: usize) -> Option<usize> {
    (len > 0).then(|| usize::from(slot) % len)
}

/// Outcome of an operation, compared between model and real tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Succeeded
    Ok,
    /// Lookup succeeded with these peer slots
    Found(Vec<usize>),
    /// Failed
    Error(OperationError),
}

impl OperationResult {
    /// Whether the operation succeeded.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Error(_))
    }
}

/// Failure kinds observable from outside the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationError {
    /// No peer to address
    NoPeers,
    /// No connection to address
    NoConnections,
    /// `NetworkError::PeerNotFound`
    PeerNotFound,
    /// `NetworkError::ConnectionRejected`
    ConnectionRejected,
    /// `NetworkError::AccessDenied`
    AccessDenied,
    /// `NetworkError::InvalidConnection`
    InvalidConnection,
    /// `NetworkError::ConnectionClosed`
    ConnectionClosed,
    /// An error the model never produces
    Internal,
}

impl From<&NetworkError> for OperationError {
    fn from(err: &NetworkError) -> Self {
        match err {
            NetworkError::PeerNotFound(_) => Self::PeerNotFound,
            NetworkError::ConnectionRejected(_) => Self::ConnectionRejected,
            NetworkError::AccessDenied(_) => Self::AccessDenied,
            NetworkError::InvalidConnection(_) => Self::InvalidConnection,
            NetworkError::ConnectionClosed(_) => Self::ConnectionClosed,
            NetworkError::RouterDetached
            | NetworkError::TopologyTooDeep { .. }
            | NetworkError::Registry(_) => Self::Internal,
        }
    }
}

impl From<&TopologyError> for OperationError {
    fn from(err: &TopologyError) -> Self {
        match err {
            TopologyError::UnknownRouter(_) => Self::Internal,
            TopologyError::Network(e) => Self::from(e),
        }
    }
}
