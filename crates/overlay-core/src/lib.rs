//! Virtual overlay network.
//!
//! A simulated packet-switched topology that gives distributed code real
//! connection semantics (registration, connection setup and rejection,
//! ordered delivery, graceful and forced teardown) without a physical
//! transport.
//!
//! ## Architecture
//!
//! ```text
//!                Router (root: mints peer ids)
//!               /                          \
//!        Router (leaf)                 Router (leaf)
//!          |      |                         |
//!        Peer    Peer                      Peer
//!         └─ Connection ─────────────── Connection ─┘
//! ```
//!
//! - Requests travel up the tree until a router knows the target, then down
//!   to it
//! - A connection is registered only at the lowest router that knows both
//!   endpoints
//! - Every hop checks that the requesting peer is registered beneath it
//!
//! Everything runs on one thread; facade calls are the only suspension
//! points.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod env;
pub mod error;
pub mod facade;
pub mod peer;
pub mod registry;
pub mod router;
pub mod types;

pub use config::RouterConfig;
pub use connection::{CONNECTION_DISPOSED, Connection, ConnectionState, EndEvent};
pub use env::{Environment, SequentialEnv, SystemEnv};
pub use error::{NetworkError, RegistryError};
pub use facade::{ChildFacade, ChildLink, ParentFacade};
pub use peer::Peer;
pub use registry::{IndexRegistry, Indexed};
pub use router::{ConnectionKey, PEER_DISCONNECTED, PeerHandle, PeerKey, Router};
pub use types::{ConnectionId, ConnectionRecord, Packet, PeerId, PeerInfo};
