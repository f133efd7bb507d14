//! Routing Node
//!
//! One element of the routing tree. Knows every peer registered beneath it
//! and the connections whose endpoints first meet at this node.
//!
//! ## Responsibilities
//!
//! - Registration: forward peer registration to the root, remember the
//!   assigned id locally keyed to the link it arrived through
//! - Connection setup: create a connection at the lowest node that knows
//!   both endpoints, delegate upward otherwise
//! - Packet routing: validate packets against the connection record, then
//!   forward them down towards the target
//! - Teardown: close every connection touching a removed peer, and cascade
//!   removal upward
//!
//! ## Design
//!
//! - Two facades: the router itself is the parent-facing facade; a small
//!   relay holding a weak reference is its child-facing facade
//! - Access control per hop: every request names a peer that must be known
//!   at the handling node
//! - Local first: registries are updated before any far side is notified,
//!   and no registry borrow is held across a facade call

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use async_trait::async_trait;

use crate::{
    config::RouterConfig,
    env::Environment,
    error::NetworkError,
    facade::{ChildFacade, ChildLink, ParentFacade},
    registry::{IndexRegistry, Indexed},
    types::{ConnectionId, ConnectionRecord, Packet, PeerId, PeerInfo},
};

/// Close reason used when a peer leaves with connections still open.
pub const PEER_DISCONNECTED: &str = "peer disconnected";

/// A peer as known by one router.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Peer id
    pub id: PeerId,
    /// Peer name
    pub name: String,
    /// Link to the peer, or to the child router relaying it
    pub facade: ChildLink,
}

impl PeerHandle {
    /// Externally visible projection.
    pub fn info(&self) -> PeerInfo {
        PeerInfo { id: self.id.clone(), name: self.name.clone() }
    }
}

/// Secondary keys of the peer registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerKey {
    /// Every peer reached through one link
    Facade(ChildLink),
    /// Every peer with one name
    Name(String),
}

impl Indexed for PeerHandle {
    type Key = PeerId;
    type SharedKey = PeerKey;

    fn key(&self) -> PeerId {
        self.id.clone()
    }

    fn shared_keys(&self) -> Vec<PeerKey> {
        vec![PeerKey::Facade(self.facade.clone()), PeerKey::Name(self.name.clone())]
    }
}

/// Secondary keys of the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    /// Connections opened by a peer
    Client(PeerId),
    /// Connections accepted by a peer
    Server(PeerId),
}

impl Indexed for ConnectionRecord {
    type Key = ConnectionId;
    type SharedKey = ConnectionKey;

    fn key(&self) -> ConnectionId {
        self.id.clone()
    }

    fn shared_keys(&self) -> Vec<ConnectionKey> {
        vec![ConnectionKey::Client(self.client.clone()), ConnectionKey::Server(self.server.clone())]
    }
}

/// A far-side close notification, computed while unregistering.
struct CloseNotice {
    facade: ChildLink,
    target: PeerId,
    connection: ConnectionId,
}

/// Shared router state. Implements the parent-facing facade.
struct RouterState<E: Environment> {
    env: E,
    depth: usize,
    parent: Option<Rc<dyn ParentFacade>>,
    /// This router as seen by its parent
    relay: ChildLink,
    disposed: Cell<bool>,
    peers: RefCell<IndexRegistry<PeerHandle>>,
    connections: RefCell<IndexRegistry<ConnectionRecord>>,
}

/// A routing tree node.
///
/// Cloning yields another handle to the same node.
pub struct Router<E: Environment> {
    state: Rc<RouterState<E>>,
}

impl<E: Environment> Clone for Router<E> {
    fn clone(&self) -> Self {
        Self { state: Rc::clone(&self.state) }
    }
}

impl<E: Environment> Router<E> {
    /// Create a root router. It mints peer ids itself.
    pub fn root(env: E) -> Self {
        Self::build(env, None, 0)
    }

    /// Create a router beneath `parent` with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::TopologyTooDeep` if the tree would exceed the
    /// default maximum depth.
    pub fn child(parent: Rc<dyn ParentFacade>, env: E) -> Result<Self, NetworkError> {
        Self::with_config(Some(parent), env, RouterConfig::default())
    }

    /// Create a router with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::TopologyTooDeep` if `parent` sits at or below
    /// `config.max_depth`.
    pub fn with_config(
        parent: Option<Rc<dyn ParentFacade>>,
        env: E,
        config: RouterConfig,
    ) -> Result<Self, NetworkError> {
        let depth = parent.as_ref().map_or(0, |p| p.depth() + 1);
        if depth > config.max_depth {
            return Err(NetworkError::TopologyTooDeep { max: config.max_depth });
        }

        Ok(Self::build(env, parent, depth))
    }

    fn build(env: E, parent: Option<Rc<dyn ParentFacade>>, depth: usize) -> Self {
        let state = Rc::new_cyclic(|weak: &Weak<RouterState<E>>| {
            let relay: Rc<dyn ChildFacade> = Rc::new(RouterRelay { router: weak.clone() });
            RouterState {
                env,
                depth,
                parent,
                relay: ChildLink::new(relay),
                disposed: Cell::new(false),
                peers: RefCell::new(IndexRegistry::new()),
                connections: RefCell::new(IndexRegistry::new()),
            }
        });

        Self { state }
    }

    /// The facade offered to peers and child routers beneath this node.
    pub fn connect(&self) -> Rc<dyn ParentFacade> {
        Rc::clone(&self.state) as Rc<dyn ParentFacade>
    }

    /// This node as registered at its parent.
    pub fn link(&self) -> &ChildLink {
        &self.state.relay
    }

    /// Whether this node has no parent.
    pub fn is_root(&self) -> bool {
        self.state.parent.is_none()
    }

    /// Depth in the tree (root = 0).
    pub fn depth(&self) -> usize {
        self.state.depth
    }

    /// Handle of a peer known at this node.
    pub fn peer_handle(&self, id: &PeerId) -> Option<PeerHandle> {
        self.state.peers.borrow().find(id).cloned()
    }

    /// Connection registered at this node.
    pub fn connection_record(&self, id: &ConnectionId) -> Option<ConnectionRecord> {
        self.state.connections.borrow().find(id).cloned()
    }

    /// Peers known at this node, in registration order.
    pub fn local_peers(&self) -> Vec<PeerInfo> {
        self.state.peers.borrow().values().map(PeerHandle::info).collect()
    }

    /// Connections registered at this node, in creation order.
    pub fn local_connections(&self) -> Vec<ConnectionRecord> {
        self.state.connections.borrow().values().cloned().collect()
    }

    /// Number of peers known at this node.
    pub fn peer_count(&self) -> usize {
        self.state.peers.borrow().len()
    }

    /// Number of connections registered at this node.
    pub fn connection_count(&self) -> usize {
        self.state.connections.borrow().len()
    }

    /// Whether [`Router::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.get()
    }

    /// Detach this node from its parent. Idempotent.
    ///
    /// Every peer relayed through this node is removed from all ancestors and
    /// their connections are closed. Local registries are left as they are,
    /// but the node refuses registration, connection setup, packets and
    /// closes from then on with `NetworkError::RouterDetached`.
    pub async fn dispose(&self) {
        if self.state.disposed.replace(true) {
            return;
        }
        if let Some(parent) = &self.state.parent {
            tracing::debug!(depth = self.state.depth, "router detaching from parent");
            parent.disconnect(&self.state.relay).await;
        }
    }
}

impl<E: Environment> fmt::Debug for Router<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("depth", &self.state.depth)
            .field("peer_count", &self.peer_count())
            .field("connection_count", &self.connection_count())
            .finish()
    }
}

impl<E: Environment> RouterState<E> {
    fn knows(&self, id: &PeerId) -> bool {
        self.peers.borrow().contains(id)
    }

    fn ensure_attached(&self) -> Result<(), NetworkError> {
        if self.disposed.get() { Err(NetworkError::RouterDetached) } else { Ok(()) }
    }

    fn ensure_known(&self, id: &PeerId) -> Result<(), NetworkError> {
        self.ensure_attached()?;
        if self.knows(id) { Ok(()) } else { Err(NetworkError::AccessDenied(id.clone())) }
    }

    /// Unregister a connection and resolve who must hear about it.
    fn detach(
        &self,
        record: &ConnectionRecord,
        source: &PeerId,
    ) -> Result<CloseNotice, NetworkError> {
        let target =
            record.other_end(source).ok_or_else(|| NetworkError::AccessDenied(source.clone()))?;

        let facade = self.peers.borrow().get(target)?.facade.clone();
        self.connections.borrow_mut().unregister(&record.id);

        Ok(CloseNotice { facade, target: target.clone(), connection: record.id.clone() })
    }

    async fn notify_close(notice: CloseNotice, reason: &str) {
        let CloseNotice { facade, target, connection } = notice;
        if let Err(e) = facade.close_connection(&target, &connection, reason).await {
            tracing::warn!(%target, %connection, error = %e, "close notification failed");
        }
    }
}

#[async_trait(?Send)]
impl<E: Environment> ParentFacade for RouterState<E> {
    fn depth(&self) -> usize {
        self.depth
    }

    async fn register_peer(&self, name: &str, facade: ChildLink) -> Result<PeerId, NetworkError> {
        self.ensure_attached()?;
        let id = match &self.parent {
            Some(parent) => parent.register_peer(name, self.relay.clone()).await?,
            None => PeerId::new(self.env.next_id()),
        };

        self.peers.borrow_mut().register(PeerHandle { id: id.clone(), name: name.to_string(), facade })?;
        tracing::debug!(peer = %id, name, depth = self.depth, "peer registered");

        Ok(id)
    }

    async fn remove_peer(&self, id: &PeerId) -> Result<(), NetworkError> {
        if !self.knows(id) {
            return Ok(());
        }

        let touching: Vec<ConnectionRecord> = {
            let connections = self.connections.borrow();
            let mut touching: Vec<ConnectionRecord> =
                connections.find_all(&ConnectionKey::Client(id.clone())).into_iter().cloned().collect();
            for record in connections.find_all(&ConnectionKey::Server(id.clone())) {
                if !touching.iter().any(|t| t.id == record.id) {
                    touching.push(record.clone());
                }
            }
            touching
        };

        let mut notices = Vec::with_capacity(touching.len());
        for record in &touching {
            match self.detach(record, id) {
                Ok(notice) => notices.push(notice),
                Err(e) => tracing::error!(peer = %id, connection = %record.id, error = %e, "failed to detach connection"),
            }
        }
        self.peers.borrow_mut().unregister(id);
        tracing::debug!(peer = %id, closed = notices.len(), depth = self.depth, "peer removed");

        for notice in notices {
            RouterState::<E>::notify_close(notice, PEER_DISCONNECTED).await;
        }

        // A detached subtree is already gone from every ancestor
        if let Some(parent) = self.parent.as_ref().filter(|_| !self.disposed.get()) {
            parent.remove_peer(id).await?;
        }

        Ok(())
    }

    async fn open_connection(
        &self,
        client: &PeerId,
        server: &PeerId,
    ) -> Result<ConnectionRecord, NetworkError> {
        self.ensure_known(client)?;

        let server_facade = self.peers.borrow().find(server).map(|h| h.facade.clone());
        let Some(server_facade) = server_facade else {
            return match &self.parent {
                Some(parent) => parent.open_connection(client, server).await,
                None => Err(NetworkError::PeerNotFound(server.clone())),
            };
        };

        let record = ConnectionRecord {
            id: ConnectionId::new(self.env.next_id()),
            client: client.clone(),
            server: server.clone(),
        };

        if !server_facade.open_connection(&record).await? {
            tracing::debug!(%client, %server, "connection rejected");
            return Err(NetworkError::ConnectionRejected(server.clone()));
        }

        self.connections.borrow_mut().register(record.clone())?;
        tracing::debug!(connection = %record.id, %client, %server, depth = self.depth, "connection opened");

        Ok(record)
    }

    async fn close_connection(
        &self,
        source: &PeerId,
        connection: &ConnectionId,
        reason: &str,
    ) -> Result<(), NetworkError> {
        self.ensure_known(source)?;

        let record = self.connections.borrow().find(connection).cloned();
        let Some(record) = record else {
            if let Some(parent) = &self.parent {
                parent.close_connection(source, connection, reason).await?;
            } else {
                tracing::debug!(%source, %connection, "close for unknown connection ignored");
            }
            return Ok(());
        };

        let notice = self.detach(&record, source)?;
        tracing::debug!(%connection, %source, reason, depth = self.depth, "connection closed");
        RouterState::<E>::notify_close(notice, reason).await;

        Ok(())
    }

    async fn get_peers(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        self.ensure_attached()?;
        match &self.parent {
            Some(parent) => parent.get_peers().await,
            None => Ok(self.peers.borrow().values().map(PeerHandle::info).collect()),
        }
    }

    async fn find_peers_by_name(&self, name: &str) -> Result<Vec<PeerId>, NetworkError> {
        self.ensure_attached()?;
        match &self.parent {
            Some(parent) => parent.find_peers_by_name(name).await,
            None => Ok(self
                .peers
                .borrow()
                .find_all(&PeerKey::Name(name.to_string()))
                .into_iter()
                .map(|h| h.id.clone())
                .collect()),
        }
    }

    async fn send_packet(&self, packet: Packet) -> Result<(), NetworkError> {
        self.ensure_known(&packet.source)?;

        let record = self.connections.borrow().find(&packet.connection).cloned();
        let Some(record) = record else {
            return match &self.parent {
                Some(parent) => parent.send_packet(packet).await,
                None => Err(NetworkError::InvalidConnection(packet.connection)),
            };
        };

        if !record.links(&packet.source, &packet.target) {
            return Err(NetworkError::InvalidConnection(packet.connection));
        }

        let target = self.peers.borrow().get(&packet.target).map(|h| h.facade.clone());
        let target = target.inspect_err(|e| {
            tracing::error!(connection = %record.id, error = %e, "connection outlived its target");
        })?;

        tracing::trace!(
            connection = %packet.connection,
            source = %packet.source,
            target = %packet.target,
            len = packet.data.len(),
            "forwarding packet"
        );
        target.receive_packet(packet).await
    }

    async fn disconnect(&self, facade: &ChildLink) {
        let ids: Vec<PeerId> = self
            .peers
            .borrow()
            .find_all(&PeerKey::Facade(facade.clone()))
            .into_iter()
            .map(|h| h.id.clone())
            .collect();

        tracing::debug!(count = ids.len(), depth = self.depth, "disconnecting link");
        for id in ids {
            if let Err(e) = self.remove_peer(&id).await {
                tracing::warn!(peer = %id, error = %e, "peer removal during disconnect failed");
            }
        }
    }
}

/// Child-facing facade of a router: a transparent relay to the addressed
/// peer's own facade.
struct RouterRelay<E: Environment> {
    router: Weak<RouterState<E>>,
}

impl<E: Environment> RouterRelay<E> {
    fn resolve(&self, target: &PeerId) -> Result<ChildLink, NetworkError> {
        let router = self.router.upgrade().ok_or_else(|| NetworkError::PeerNotFound(target.clone()))?;
        let facade = router.peers.borrow().find(target).map(|h| h.facade.clone());
        facade.ok_or_else(|| NetworkError::PeerNotFound(target.clone()))
    }
}

#[async_trait(?Send)]
impl<E: Environment> ChildFacade for RouterRelay<E> {
    async fn open_connection(&self, connection: &ConnectionRecord) -> Result<bool, NetworkError> {
        self.resolve(&connection.server)?.open_connection(connection).await
    }

    async fn receive_packet(&self, packet: Packet) -> Result<(), NetworkError> {
        self.resolve(&packet.target)?.receive_packet(packet).await
    }

    async fn close_connection(
        &self,
        target: &PeerId,
        connection: &ConnectionId,
        reason: &str,
    ) -> Result<(), NetworkError> {
        self.resolve(target)?.close_connection(target, connection, reason).await
    }
}
