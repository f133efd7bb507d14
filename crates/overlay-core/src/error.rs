//! Routing error types.

use thiserror::Error;

use crate::types::{ConnectionId, PeerId};

/// Errors from the Index Registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An entity with the same unique key is already registered.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// A lookup the caller expected to succeed found nothing.
    #[error("missing key: {0}")]
    MissingKey(String),
}

/// Errors from routing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// Target peer does not exist anywhere in the reachable tree.
    #[error("peer with id \"{0}\" was not found")]
    PeerNotFound(PeerId),

    /// Target peer exists but declined the connection.
    #[error("connection to peer \"{0}\" was rejected")]
    ConnectionRejected(PeerId),

    /// Request made on behalf of a peer the handling router does not know.
    #[error("tried to perform operation on behalf of peer \"{0}\", who is not registered")]
    AccessDenied(PeerId),

    /// Connection does not exist or does not match the packet endpoints.
    #[error("connection \"{0}\" does not exist or does not link these peers")]
    InvalidConnection(ConnectionId),

    /// Local misuse: the connection has already been closed on this side.
    #[error("connection \"{0}\" is closed")]
    ConnectionClosed(ConnectionId),

    /// Request reached a router that has been disposed.
    #[error("router has been detached from the tree")]
    RouterDetached,

    /// Router construction exceeded the configured depth.
    #[error("routing tree exceeds maximum depth of {max}")]
    TopologyTooDeep {
        /// Configured maximum depth.
        max: usize,
    },

    /// A routing invariant was violated.
    #[error("routing invariant violated: {0}")]
    Registry(#[from] RegistryError),
}

impl NetworkError {
    /// Returns true for the client-diagnosable kinds.
    ///
    /// These describe the request, never a bug in the routing layer.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::PeerNotFound(_)
                | Self::ConnectionRejected(_)
                | Self::AccessDenied(_)
                | Self::InvalidConnection(_)
        )
    }

    /// Returns true if this error is fatal for the caller.
    ///
    /// Fatal errors indicate a stale or forged identity, a broken tree, or a
    /// routing bug. Everything else is an ordinary outcome of a request.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::AccessDenied(_)
            | Self::RouterDetached
            | Self::TopologyTooDeep { .. }
            | Self::Registry(_) => true,

            Self::PeerNotFound(_)
            | Self::ConnectionRejected(_)
            | Self::InvalidConnection(_)
            | Self::ConnectionClosed(_) => false,
        }
    }
}
