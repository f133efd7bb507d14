//! Fuzz target for tree routing
//!
//! Apply arbitrary operation sequences to a real tree and to the reference
//! model.
//!
//! # Strategy
//!
//! - Shape: small trees of varying fanout and depth
//! - Operations: peer churn, connection churn and payloads in any order
//! - Addressing: every slot wraps, so stale and disposed targets are common
//!
//! # Invariants
//!
//! - Real and model outcomes agree on every operation
//! - Observable state (open flags, end reasons, payload order, placement)
//!   agrees after the sequence
//! - Every open connection is registered at exactly one router
//! - Every active peer is known on its whole path to the root
//! - NEVER panic inside the routing layer

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use overlay_harness::{ModelNetwork, Operation, SimEnv, SimNetwork, Topology, run};

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    fanout: u8,
    depth: u8,
    ops: Vec<Operation>,
}

fuzz_target!(|scenario: Scenario| {
    let fanout = usize::from(scenario.fanout % 3) + 1;
    let depth = usize::from(scenario.depth % 3);
    let ops: Vec<Operation> = scenario.ops.into_iter().take(256).collect();

    let Ok(topology) = Topology::balanced(SimEnv::with_seed(scenario.seed), fanout, depth) else {
        return;
    };
    let mut real = SimNetwork::new(topology);
    let mut model = ModelNetwork::balanced(fanout, depth);

    let Ok(()) = run(async {
        for (i, op) in ops.iter().enumerate() {
            let real_result = real.apply(op).await;
            let model_result = model.apply(op);
            assert_eq!(real_result, model_result, "divergence at operation {i}: {op:?}");

            if let Err(violation) = real.check_invariants() {
                panic!("invariant violated after operation {i} ({op:?}): {violation}");
            }
        }
    }) else {
        return;
    };

    assert_eq!(real.observable_state(), model.observable_state());
});
