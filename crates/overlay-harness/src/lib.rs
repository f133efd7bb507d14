//! Deterministic simulation harness for the overlay network.
//!
//! Seeded id generation, a tree builder, and a reference model. Operations
//! are applied to both the model and a real tree, and their observable
//! states are compared.
//!
//! # Example
//!
//! ```rust,ignore
//! use overlay_harness::{ModelNetwork, Operation, SimEnv, SimNetwork, Topology, run};
//!
//! run(async {
//!     let mut real = SimNetwork::new(Topology::balanced(SimEnv::with_seed(1), 2, 2)?);
//!     let mut model = ModelNetwork::balanced(2, 2);
//!
//!     let op = Operation::AddPeer { router: 3, name: 0 };
//!     assert_eq!(real.apply(&op).await, model.apply(&op));
//!     assert_eq!(real.observable_state(), model.observable_state());
//! })?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod model;
pub mod sim_env;
pub mod sim_network;
pub mod topology;

pub use model::{
    ConnectionView, ModelNetwork, ObservableState, Operation, OperationError, OperationResult,
    Side, SmallPayload,
};
pub use sim_env::SimEnv;
pub use sim_network::{SimNetwork, run};
pub use topology::{RouterId, Topology, TopologyError};
