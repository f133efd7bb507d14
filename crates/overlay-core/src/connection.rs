//! Peer-side connection object.
//!
//! A [`Connection`] is owned by exactly one peer (the local endpoint) and
//! talks to the network through that peer's parent link.
//!
//! # State machine
//!
//! ```text
//! Open ──end()/dispose()/reject()──▶ Closed (ended locally, no end event)
//!   │
//!   └──far side or network closes──▶ Closed (end event delivered once)
//! ```
//!
//! `Closed` is terminal.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    rc::{Rc, Weak},
};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};

use crate::{
    error::NetworkError,
    facade::ParentFacade,
    types::{ConnectionId, Packet, PeerId},
};

/// Close reason used when a connection is disposed without one.
pub const CONNECTION_DISPOSED: &str = "connection disposed";

/// A peer's table of live connections, keyed by connection id.
pub(crate) type ConnectionTable = RefCell<HashMap<ConnectionId, Connection>>;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Packets can be sent and received
    Open,
    /// Terminal
    Closed,
}

/// Delivered once when the far side (or the network) closes a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndEvent {
    /// Reason given by whoever closed the connection
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lifecycle {
    Open,
    /// Closed by the far side
    Ended(EndEvent),
    /// Closed on this side
    Finished,
}

struct Inner {
    id: ConnectionId,
    /// Remote endpoint
    peer: PeerId,
    /// Local endpoint
    owner: PeerId,
    parent: Rc<dyn ParentFacade>,
    table: Weak<ConnectionTable>,
    lifecycle: watch::Sender<Lifecycle>,
    packets_tx: RefCell<Option<mpsc::UnboundedSender<Bytes>>>,
    packets_rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

/// One endpoint's handle to a bidirectional, ordered channel.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<Inner>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer: PeerId,
        owner: PeerId,
        parent: Rc<dyn ParentFacade>,
        table: Weak<ConnectionTable>,
    ) -> Self {
        let (packets_tx, packets_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle::Open);

        Self {
            inner: Rc::new(Inner {
                id,
                peer,
                owner,
                parent,
                table,
                lifecycle,
                packets_tx: RefCell::new(Some(packets_tx)),
                packets_rx: Mutex::new(packets_rx),
            }),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Id of the remote endpoint.
    pub fn peer(&self) -> &PeerId {
        &self.inner.peer
    }

    /// Id of the local endpoint.
    pub fn owner(&self) -> &PeerId {
        &self.inner.owner
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        match *self.inner.lifecycle.borrow() {
            Lifecycle::Open => ConnectionState::Open,
            Lifecycle::Ended(_) | Lifecycle::Finished => ConnectionState::Closed,
        }
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The end event, if the far side has closed the connection.
    pub fn end_event(&self) -> Option<EndEvent> {
        match &*self.inner.lifecycle.borrow() {
            Lifecycle::Ended(event) => Some(event.clone()),
            Lifecycle::Open | Lifecycle::Finished => None,
        }
    }

    /// Send a payload to the remote endpoint.
    ///
    /// Returns once the packet has been handed to the remote peer, so sends
    /// awaited one after another arrive in order.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::ConnectionClosed` without touching the network
    /// if this side is closed, `NetworkError::InvalidConnection` if the
    /// connection is already gone from the tree.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), NetworkError> {
        if !self.is_open() {
            return Err(NetworkError::ConnectionClosed(self.inner.id.clone()));
        }

        let packet = Packet {
            source: self.inner.owner.clone(),
            target: self.inner.peer.clone(),
            connection: self.inner.id.clone(),
            data: data.into(),
        };

        self.inner.parent.send_packet(packet).await
    }

    /// Next payload from the remote endpoint, in send order.
    ///
    /// Returns `None` once the connection is closed and every payload
    /// received before that has been consumed.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inner.packets_rx.lock().await.recv().await
    }

    /// Next payload if one is already queued.
    pub fn try_recv(&self) -> Option<Bytes> {
        self.inner.packets_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Wait until the connection is closed.
    ///
    /// Returns the end event when the far side closed it, `None` when it was
    /// ended on this side.
    pub async fn closed(&self) -> Option<EndEvent> {
        let mut rx = self.inner.lifecycle.subscribe();
        let state = rx.wait_for(|s| *s != Lifecycle::Open).await.ok()?;
        match &*state {
            Lifecycle::Ended(event) => Some(event.clone()),
            Lifecycle::Open | Lifecycle::Finished => None,
        }
    }

    /// Close the connection with `reason`.
    ///
    /// The local transition happens before the network is told, so the
    /// connection is unusable as soon as this is called. Only the far side
    /// observes `reason`. Calling it on a closed connection does nothing.
    ///
    /// # Errors
    ///
    /// Propagates `NetworkError::AccessDenied` if the owning peer is no
    /// longer registered.
    pub async fn end(&self, reason: &str) -> Result<(), NetworkError> {
        if !self.finish(Lifecycle::Finished) {
            return Ok(());
        }
        self.detach();

        tracing::debug!(connection = %self.inner.id, owner = %self.inner.owner, reason, "ending connection");
        self.inner.parent.close_connection(&self.inner.owner, &self.inner.id, reason).await
    }

    /// Close with the reason `"connection disposed"`. Idempotent.
    pub async fn dispose(&self) {
        if let Err(e) = self.end(CONNECTION_DISPOSED).await {
            tracing::debug!(connection = %self.inner.id, error = %e, "dispose after network teardown");
        }
    }

    /// Close locally without telling the network.
    ///
    /// Inside an `on_connection` handler this vetoes the inbound connection.
    pub fn reject(&self) {
        if self.finish(Lifecycle::Finished) {
            self.detach();
        }
    }

    pub(crate) fn deliver(&self, data: Bytes) {
        if let Some(tx) = self.inner.packets_tx.borrow().as_ref() {
            // Receiver lives as long as `inner`
            let _ = tx.send(data);
        }
    }

    /// Far side closed the connection. Emits the end event at most once.
    pub(crate) fn finish_remote(&self, reason: &str) {
        let event = EndEvent { reason: reason.to_string() };
        if self.finish(Lifecycle::Ended(event)) {
            tracing::debug!(connection = %self.inner.id, owner = %self.inner.owner, reason, "connection ended by far side");
        }
    }

    /// Owning peer went away.
    pub(crate) fn finish_local(&self) {
        self.finish(Lifecycle::Finished);
    }

    fn finish(&self, next: Lifecycle) -> bool {
        let changed = self.inner.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Open {
                *state = next;
                true
            } else {
                false
            }
        });

        if changed {
            self.inner.packets_tx.borrow_mut().take();
        }
        changed
    }

    fn detach(&self) {
        if let Some(table) = self.inner.table.upgrade() {
            table.borrow_mut().remove(&self.inner.id);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}
