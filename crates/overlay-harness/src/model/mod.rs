//! Reference model for model-based testing.
//!
//! The model tracks which peers exist, which connections are open, and what
//! each endpoint has observed, without any routing. It is the oracle the
//! real tree is checked against.
//!
//! # Design Principles
//!
//! - Simplicity: the model should be obviously correct
//! - Outcomes, not mechanics: it records what callers observe, never how
//!   requests travel
//! - Deterministic: same operations, same state

mod network;
pub mod operation;

pub use network::{ConnectionView, ModelNetwork, ObservableState};
pub use operation::{
    ConnectionSlot, END_REASON, Operation, OperationError, OperationResult, PeerSlot, RouterSlot,
    Side, SmallPayload, peer_name, resolve,
};
