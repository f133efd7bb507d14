//! Peer Endpoint
//!
//! A leaf of the routing tree: one addressable actor. Peers are outbound-only
//! until [`Peer::enable_host`] is called.

use std::{
    cell::{Cell, OnceCell, RefCell},
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    connection::{Connection, ConnectionTable},
    env::Environment,
    error::NetworkError,
    facade::{ChildFacade, ChildLink, ParentFacade},
    types::{ConnectionId, ConnectionRecord, Packet, PeerId, PeerInfo},
};

type ConnectionHandler = Box<dyn FnMut(&Connection)>;

struct PeerState {
    id: PeerId,
    name: String,
    parent: Rc<dyn ParentFacade>,
    /// This peer as registered at its parent
    link: ChildLink,
    host_enabled: Cell<bool>,
    disposed: Cell<bool>,
    connections: Rc<ConnectionTable>,
    handlers: RefCell<Vec<ConnectionHandler>>,
    /// Accepted inbound connections not yet taken by [`Peer::accept`].
    /// Only ids are queued; the live object stays in `connections`.
    incoming: RefCell<VecDeque<ConnectionId>>,
    incoming_ready: Notify,
}

impl PeerState {
    fn new_connection(&self, id: ConnectionId, remote: PeerId) -> Connection {
        Connection::new(
            id,
            remote,
            self.id.clone(),
            Rc::clone(&self.parent),
            Rc::downgrade(&self.connections),
        )
    }

    /// Run every `on_connection` handler. Handlers may register more
    /// handlers; those run from the next inbound connection on.
    fn dispatch(&self, connection: &Connection) {
        let mut handlers = std::mem::take(&mut *self.handlers.borrow_mut());
        for handler in &mut handlers {
            handler(connection);
        }

        let mut slot = self.handlers.borrow_mut();
        handlers.append(&mut slot);
        *slot = handlers;
    }

    fn queue_incoming(&self, id: ConnectionId) {
        {
            let live = self.connections.borrow();
            let mut incoming = self.incoming.borrow_mut();
            incoming.retain(|queued| live.contains_key(queued));
            incoming.push_back(id);
        }
        self.incoming_ready.notify_one();
    }

    /// Oldest queued connection that is still live.
    fn next_incoming(&self) -> Option<Connection> {
        let live = self.connections.borrow();
        let mut incoming = self.incoming.borrow_mut();
        while let Some(id) = incoming.pop_front() {
            if let Some(connection) = live.get(&id) {
                return Some(connection.clone());
            }
        }
        None
    }
}

/// An addressable endpoint attached to a router.
///
/// Cloning yields another handle to the same peer.
#[derive(Clone)]
pub struct Peer {
    state: Rc<PeerState>,
}

impl Peer {
    /// Register a new peer with `parent`.
    ///
    /// Without a name the peer is called `anon.<random id>`.
    ///
    /// # Errors
    ///
    /// Propagates registration failures from the tree.
    pub async fn make<E: Environment>(
        parent: Rc<dyn ParentFacade>,
        name: Option<&str>,
        env: &E,
    ) -> Result<Self, NetworkError> {
        let name = name.map_or_else(|| format!("anon.{}", env.next_id()), str::to_string);

        let facade = Rc::new(PeerFacade { peer: OnceCell::new() });
        let link = ChildLink::new(Rc::clone(&facade) as Rc<dyn ChildFacade>);
        let id = parent.register_peer(&name, link.clone()).await?;

        let state = Rc::new(PeerState {
            id,
            name,
            parent,
            link,
            host_enabled: Cell::new(false),
            disposed: Cell::new(false),
            connections: Rc::new(ConnectionTable::default()),
            handlers: RefCell::new(Vec::new()),
            incoming: RefCell::new(VecDeque::new()),
            incoming_ready: Notify::new(),
        });
        // Freshly created cell, cannot already be set
        let _ = facade.peer.set(Rc::downgrade(&state));

        tracing::debug!(peer = %state.id, name = %state.name, "peer created");
        Ok(Self { state })
    }

    /// Peer id, assigned by the root.
    pub fn id(&self) -> &PeerId {
        &self.state.id
    }

    /// Peer name.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Link this peer was registered through.
    pub fn link(&self) -> &ChildLink {
        &self.state.link
    }

    /// Start accepting inbound connections. Idempotent.
    pub fn enable_host(&self) {
        self.state.host_enabled.set(true);
    }

    /// Whether inbound connections are accepted.
    pub fn is_hosting(&self) -> bool {
        self.state.host_enabled.get()
    }

    /// Whether [`Peer::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.get()
    }

    /// Register a handler for inbound connections.
    ///
    /// Handlers run synchronously before the connection is accepted; calling
    /// [`Connection::reject`] inside one vetoes it.
    pub fn on_connection(&self, handler: impl FnMut(&Connection) + 'static) {
        self.state.handlers.borrow_mut().push(Box::new(handler));
    }

    /// Next accepted inbound connection that is still open.
    ///
    /// Connections closed before they are taken are skipped. Returns `None`
    /// once the peer is disposed.
    pub async fn accept(&self) -> Option<Connection> {
        loop {
            if self.state.disposed.get() {
                return None;
            }
            if let Some(connection) = self.state.next_incoming() {
                return Some(connection);
            }
            self.state.incoming_ready.notified().await;
        }
    }

    /// Open a connection to `server`.
    ///
    /// A peer cannot connect to itself: the request is refused here and never
    /// reaches the tree, whereas a router asked directly would accept it for a
    /// hosting peer.
    ///
    /// # Errors
    ///
    /// - `NetworkError::PeerNotFound` if no such peer exists
    /// - `NetworkError::ConnectionRejected` if it does not accept, or is this
    ///   peer
    /// - `NetworkError::AccessDenied` if this peer has been removed
    pub async fn connect(&self, server: &PeerId) -> Result<Connection, NetworkError> {
        if server == &self.state.id {
            return Err(NetworkError::ConnectionRejected(server.clone()));
        }

        let record = self.state.parent.open_connection(&self.state.id, server).await?;
        let connection = self.state.new_connection(record.id.clone(), record.server);
        self.state.connections.borrow_mut().insert(record.id, connection.clone());

        Ok(connection)
    }

    /// Live connection by id.
    pub fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.state.connections.borrow().get(id).cloned()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.state.connections.borrow().len()
    }

    /// Every peer in the tree.
    pub async fn get_peers(&self) -> Result<Vec<PeerInfo>, NetworkError> {
        self.state.parent.get_peers().await
    }

    /// Ids of every peer called `name`.
    pub async fn find_peers_by_name(&self, name: &str) -> Result<Vec<PeerId>, NetworkError> {
        self.state.parent.find_peers_by_name(name).await
    }

    /// Leave the network. Idempotent.
    ///
    /// Every live connection is closed locally first; the tree then closes
    /// them for the far sides with reason `"peer disconnected"`.
    pub async fn dispose(&self) {
        if self.state.disposed.replace(true) {
            return;
        }

        let open: Vec<Connection> =
            self.state.connections.borrow_mut().drain().map(|(_, c)| c).collect();
        for connection in &open {
            connection.finish_local();
        }
        self.state.incoming.borrow_mut().clear();
        self.state.incoming_ready.notify_waiters();

        tracing::debug!(peer = %self.state.id, closed = open.len(), "peer disposing");
        self.state.parent.disconnect(&self.state.link).await;
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .field("hosting", &self.state.host_enabled.get())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Child-facing facade of a peer.
struct PeerFacade {
    peer: OnceCell<Weak<PeerState>>,
}

impl PeerFacade {
    fn owner(&self) -> Option<Rc<PeerState>> {
        self.peer.get().and_then(Weak::upgrade)
    }
}

#[async_trait(?Send)]
impl ChildFacade for PeerFacade {
    async fn open_connection(&self, record: &ConnectionRecord) -> Result<bool, NetworkError> {
        let Some(peer) = self.owner() else {
            return Ok(false);
        };
        if !peer.host_enabled.get() || peer.disposed.get() {
            return Ok(false);
        }

        let connection = peer.new_connection(record.id.clone(), record.client.clone());
        peer.dispatch(&connection);
        if !connection.is_open() {
            tracing::debug!(peer = %peer.id, connection = %record.id, "inbound connection vetoed");
            return Ok(false);
        }

        peer.connections.borrow_mut().insert(record.id.clone(), connection);
        peer.queue_incoming(record.id.clone());

        Ok(true)
    }

    async fn receive_packet(&self, packet: Packet) -> Result<(), NetworkError> {
        let Some(peer) = self.owner() else {
            return Ok(());
        };
        let connection = peer.connections.borrow().get(&packet.connection).cloned();

        match connection {
            Some(connection) => connection.deliver(packet.data),
            // The connection may have just closed on this side
            None => tracing::trace!(connection = %packet.connection, "dropping packet for unknown connection"),
        }

        Ok(())
    }

    async fn close_connection(
        &self,
        _target: &PeerId,
        connection: &ConnectionId,
        reason: &str,
    ) -> Result<(), NetworkError> {
        let Some(peer) = self.owner() else {
            return Ok(());
        };
        let removed = peer.connections.borrow_mut().remove(connection);
        if let Some(removed) = removed {
            peer.incoming.borrow_mut().retain(|queued| queued != connection);
            removed.finish_remote(reason);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::SequentialEnv, router::Router};

    #[tokio::test]
    async fn make_registers_with_parent() {
        let env = SequentialEnv::new();
        let router = Router::root(env.clone());
        let peer = Peer::make(router.connect(), Some("alice"), &env).await.unwrap();

        let handle = router.peer_handle(peer.id()).unwrap();
        assert_eq!(handle.name, "alice");
        assert_eq!(&handle.facade, peer.link());
    }

    #[tokio::test]
    async fn anonymous_name_has_prefix() {
        let env = SequentialEnv::new();
        let router = Router::root(env.clone());
        let peer = Peer::make(router.connect(), None, &env).await.unwrap();

        assert!(peer.name().starts_with("anon."));
        assert_ne!(peer.name(), "anon.");
    }

    #[tokio::test]
    async fn enable_host_is_idempotent() {
        let env = SequentialEnv::new();
        let router = Router::root(env.clone());
        let peer = Peer::make(router.connect(), None, &env).await.unwrap();

        assert!(!peer.is_hosting());
        peer.enable_host();
        peer.enable_host();
        assert!(peer.is_hosting());
    }

    #[tokio::test]
    async fn connecting_to_self_is_rejected() {
        let env = SequentialEnv::new();
        let router = Router::root(env.clone());
        let peer = Peer::make(router.connect(), None, &env).await.unwrap();
        peer.enable_host();

        let result = peer.connect(peer.id()).await;
        assert_eq!(result.err(), Some(NetworkError::ConnectionRejected(peer.id().clone())));
        assert_eq!(router.connection_count(), 0);
    }

    #[tokio::test]
    async fn handlers_added_during_dispatch_are_kept() {
        let env = SequentialEnv::new();
        let router = Router::root(env.clone());
        let client = Peer::make(router.connect(), None, &env).await.unwrap();
        let server = Peer::make(router.connect(), None, &env).await.unwrap();
        server.enable_host();

        let seen = Rc::new(Cell::new(0));
        let nested = Rc::clone(&seen);
        let handle = server.clone();
        server.on_connection(move |_| {
            let nested = Rc::clone(&nested);
            handle.on_connection(move |_| nested.set(nested.get() + 1));
        });

        client.connect(server.id()).await.unwrap();
        assert_eq!(seen.get(), 0);

        client.connect(server.id()).await.unwrap();
        assert_eq!(seen.get(), 1);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let env = SequentialEnv::new();
        let router = Router::root(env.clone());
        let peer = Peer::make(router.connect(), None, &env).await.unwrap();

        peer.dispose().await;
        peer.dispose().await;

        assert!(peer.is_disposed());
        assert_eq!(router.peer_count(), 0);
        assert!(peer.accept().await.is_none());
    }
}
