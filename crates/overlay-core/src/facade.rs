//! Facade contracts between adjacent tree levels.
//!
//! A [`ParentFacade`] is what a child (peer or router) calls on the node
//! above it. A [`ChildFacade`] is what a router calls on something beneath
//! it. Routers implement both, which lets them nest to any depth; peers only
//! implement the child side; a transport bridge implements whichever side it
//! stands in for.
//!
//! Calls that cross a facade are the only suspension points of the routing
//! layer.

use std::{
    fmt,
    hash::{Hash, Hasher},
    rc::Rc,
};

use async_trait::async_trait;

use crate::{
    error::NetworkError,
    types::{ConnectionId, ConnectionRecord, Packet, PeerId, PeerInfo},
};

/// What a parent calls on a thing beneath it.
#[async_trait(?Send)]
pub trait ChildFacade {
    /// Offer a new connection to `connection.server`. `Ok(false)` rejects it.
    async fn open_connection(&self, connection: &ConnectionRecord) -> Result<bool, NetworkError>;

    /// Deliver a packet to `packet.target`.
    async fn receive_packet(&self, packet: Packet) -> Result<(), NetworkError>;

    /// Tell `target` that the far side closed `connection`.
    async fn close_connection(
        &self,
        target: &PeerId,
        connection: &ConnectionId,
        reason: &str,
    ) -> Result<(), NetworkError>;
}

/// What a child calls on the node above it.
#[async_trait(?Send)]
pub trait ParentFacade {
    /// Depth of the node behind this facade. The root is at depth 0.
    fn depth(&self) -> usize;

    /// Register a peer reachable through `facade`, returning its id.
    async fn register_peer(&self, name: &str, facade: ChildLink) -> Result<PeerId, NetworkError>;

    /// Remove a peer and close every connection touching it.
    async fn remove_peer(&self, id: &PeerId) -> Result<(), NetworkError>;

    /// Open a connection from `client` to `server`.
    async fn open_connection(
        &self,
        client: &PeerId,
        server: &PeerId,
    ) -> Result<ConnectionRecord, NetworkError>;

    /// Close `connection` on behalf of `source`.
    async fn close_connection(
        &self,
        source: &PeerId,
        connection: &ConnectionId,
        reason: &str,
    ) -> Result<(), NetworkError>;

    /// Every peer in the tree.
    async fn get_peers(&self) -> Result<Vec<PeerInfo>, NetworkError>;

    /// Ids of every peer registered under `name`.
    async fn find_peers_by_name(&self, name: &str) -> Result<Vec<PeerId>, NetworkError>;

    /// Route a packet to its target.
    async fn send_packet(&self, packet: Packet) -> Result<(), NetworkError>;

    /// Remove every peer reachable through `facade`. Best effort, never fails.
    async fn disconnect(&self, facade: &ChildLink);
}

/// Shared handle to a [`ChildFacade`], compared by identity.
///
/// Routers index peer handles by the link they were registered through, so
/// the link itself must be hashable.
#[derive(Clone)]
pub struct ChildLink(Rc<dyn ChildFacade>);

impl ChildLink {
    /// Wrap a facade.
    pub fn new(facade: Rc<dyn ChildFacade>) -> Self {
        Self(facade)
    }

    fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0).cast::<()>()
    }
}

impl std::ops::Deref for ChildLink {
    type Target = dyn ChildFacade;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for ChildLink {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.addr(), other.addr())
    }
}

impl Eq for ChildLink {}

impl Hash for ChildLink {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for ChildLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChildLink").field(&self.addr()).finish()
    }
}
