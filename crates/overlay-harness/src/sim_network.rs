//! Real routing tree driven by model operations.
//!
//! Mirrors [`ModelNetwork`](crate::ModelNetwork) slot for slot: peers and
//! connections are kept in the order they were created so the same
//! [`Operation`] addresses the same entity on both sides.

use bytes::Bytes;
use overlay_core::{Connection, Environment, Peer, PeerId};

use crate::{
    model::{
        ConnectionView, END_REASON, ObservableState, Operation, OperationError, OperationResult,
        Side, peer_name, resolve,
    },
    topology::{RouterId, Topology},
};

/// Run `future` to completion on a fresh current-thread runtime.
///
/// # Errors
///
/// Returns the I/O error if the runtime cannot be built.
pub fn run<F: Future>(future: F) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread().build()?;
    Ok(runtime.block_on(future))
}

struct SimConnection {
    client: Connection,
    server: Connection,
    to_client: Vec<Vec<u8>>,
    to_server: Vec<Vec<u8>>,
}

impl SimConnection {
    fn side(&self, side: Side) -> &Connection {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    fn drain(&mut self) {
        while let Some(data) = self.client.try_recv() {
            self.to_client.push(data.to_vec());
        }
        while let Some(data) = self.server.try_recv() {
            self.to_server.push(data.to_vec());
        }
    }
}

/// A real tree plus the peers and connections created on it.
pub struct SimNetwork<E: Environment> {
    topology: Topology<E>,
    peers: Vec<Peer>,
    connections: Vec<SimConnection>,
}

impl<E: Environment> SimNetwork<E> {
    /// Wrap an existing topology.
    pub fn new(topology: Topology<E>) -> Self {
        Self { topology, peers: Vec::new(), connections: Vec::new() }
    }

    /// The underlying tree.
    pub fn topology(&self) -> &Topology<E> {
        &self.topology
    }

    /// Peer by slot.
    pub fn peer(&self, slot: usize) -> Option<&Peer> {
        self.peers.get(slot)
    }

    /// Apply an operation to the real tree.
    pub async fn apply(&mut self, op: &Operation) -> OperationResult {
        match op {
            Operation::AddPeer { router, name } => {
                let router = resolve(*router, self.topology.len())
                    .and_then(|index| self.topology.router_ids().nth(index));
                let Some(router) = router else {
                    return OperationResult::Error(OperationError::Internal);
                };
                match self.topology.add_peer(router, Some(&peer_name(*name))).await {
                    Ok(peer) => {
                        self.peers.push(peer);
                        OperationResult::Ok
                    },
                    Err(e) => OperationResult::Error(OperationError::from(&e)),
                }
            },
            Operation::EnableHost { peer } => match self.resolve_peer(*peer) {
                Some(peer) => {
                    peer.enable_host();
                    OperationResult::Ok
                },
                None => OperationResult::Error(OperationError::NoPeers),
            },
            Operation::Connect { client, server } => {
                let (Some(client), Some(server)) = (self.resolve_peer(*client), self.resolve_peer(*server))
                else {
                    return OperationResult::Error(OperationError::NoPeers);
                };
                let (client, server) = (client.clone(), server.clone());
                self.connect(&client, &server).await
            },
            Operation::Send { connection, side, payload } => {
                let Some(connection) = self.resolve_connection(*connection) else {
                    return OperationResult::Error(OperationError::NoConnections);
                };
                let endpoint = connection.side(*side).clone();
                match endpoint.send(Bytes::from(payload.to_bytes())).await {
                    Ok(()) => OperationResult::Ok,
                    Err(e) => OperationResult::Error(OperationError::from(&e)),
                }
            },
            Operation::End { connection, side } => {
                let Some(connection) = self.resolve_connection(*connection) else {
                    return OperationResult::Error(OperationError::NoConnections);
                };
                let endpoint = connection.side(*side).clone();
                match endpoint.end(END_REASON).await {
                    Ok(()) => OperationResult::Ok,
                    Err(e) => OperationResult::Error(OperationError::from(&e)),
                }
            },
            Operation::DisposeConnection { connection, side } => {
                let Some(connection) = self.resolve_connection(*connection) else {
                    return OperationResult::Error(OperationError::NoConnections);
                };
                connection.side(*side).clone().dispose().await;
                OperationResult::Ok
            },
            Operation::DisposePeer { peer } => match self.resolve_peer(*peer) {
                Some(peer) => {
                    peer.clone().dispose().await;
                    OperationResult::Ok
                },
                None => OperationResult::Error(OperationError::NoPeers),
            },
            Operation::FindByName { name } => {
                let Some(root) = self.topology.router(self.topology.root()) else {
                    return OperationResult::Error(OperationError::Internal);
                };
                match root.connect().find_peers_by_name(&peer_name(*name)).await {
                    Ok(ids) => OperationResult::Found(ids.iter().filter_map(|id| self.slot_of(id)).collect()),
                    Err(e) => OperationResult::Error(OperationError::from(&e)),
                }
            },
        }
    }

    async fn connect(&mut self, client: &Peer, server: &Peer) -> OperationResult {
        let outbound = match client.connect(server.id()).await {
            Ok(connection) => connection,
            Err(e) => return OperationResult::Error(OperationError::from(&e)),
        };
        let Some(inbound) = server.connection(outbound.id()) else {
            tracing::error!(connection = %outbound.id(), "accepted connection missing at server");
            return OperationResult::Error(OperationError::Internal);
        };

        self.connections.push(SimConnection {
            client: outbound,
            server: inbound,
            to_client: Vec::new(),
            to_server: Vec::new(),
        });
        OperationResult::Ok
    }

    fn resolve_peer(&self, slot: u8) -> Option<&Peer> {
        resolve(slot, self.peers.len()).and_then(|i| self.peers.get(i))
    }

    fn resolve_connection(&self, slot: u8) -> Option<&SimConnection> {
        resolve(slot, self.connections.len()).and_then(|i| self.connections.get(i))
    }

    fn slot_of(&self, id: &PeerId) -> Option<usize> {
        self.peers.iter().position(|p| p.id() == id)
    }

    /// Extract observable state for comparison.
    ///
    /// Takes every payload queued at a connection endpoint.
    pub fn observable_state(&mut self) -> ObservableState {
        let active_peers = self
            .peers
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_disposed())
            .map(|(slot, _)| slot)
            .collect();

        let mut connections = Vec::with_capacity(self.connections.len());
        for connection in &mut self.connections {
            connection.drain();
            connections.push(ConnectionView {
                client_open: connection.client.is_open(),
                server_open: connection.server.is_open(),
                client_end: connection.client.end_event().map(|e| e.reason),
                server_end: connection.server.end_event().map(|e| e.reason),
                to_client: connection.to_client.clone(),
                to_server: connection.to_server.clone(),
                homes: self
                    .topology
                    .homes_of(connection.client.id())
                    .into_iter()
                    .map(RouterId::index)
                    .collect(),
            });
        }

        ObservableState { active_peers, connections }
    }

    /// Check structural invariants of the tree.
    ///
    /// # Errors
    ///
    /// Describes the first violated invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        let open = self.connections.iter().filter(|c| c.client.is_open()).count();
        let registered = self.topology.connection_count();
        if open != registered {
            return Err(format!("{open} open connections but {registered} registrations"));
        }

        for connection in &self.connections {
            if connection.client.is_open() != connection.server.is_open() {
                return Err(format!("connection {} is half open", connection.client.id()));
            }
        }

        for peer in self.peers.iter().filter(|p| !p.is_disposed()) {
            let Some(home) = self.home_router(peer) else {
                return Err(format!("active peer {} has no router", peer.id()));
            };
            for router in self.topology.path_to_root(home) {
                let known = self.topology.router(router).and_then(|r| r.peer_handle(peer.id()));
                if known.is_none() {
                    return Err(format!(
                        "peer {} missing at router {} above its home",
                        peer.id(),
                        router.index()
                    ));
                }
            }
        }

        let Some(root) = self.topology.router(self.topology.root()) else {
            return Err("topology has no root".to_string());
        };
        let active = self.peers.iter().filter(|p| !p.is_disposed()).count();
        if root.peer_count() != active {
            return Err(format!("root knows {} peers, {active} are active", root.peer_count()));
        }

        Ok(())
    }

    /// Router a peer was registered at: the one whose handle points at the
    /// peer itself rather than a child router.
    fn home_router(&self, peer: &Peer) -> Option<RouterId> {
        self.topology.router_ids().find(|id| {
            self.topology
                .router(*id)
                .and_then(|router| router.peer_handle(peer.id()))
                .is_some_and(|h| &h.facade == peer.link())
        })
    }
}

impl<E: Environment> std::fmt::Debug for SimNetwork<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("topology", &self.topology)
            .field("peers", &self.peers)
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::SmallPayload, sim_env::SimEnv};

    fn network() -> SimNetwork<SimEnv> {
        SimNetwork::new(Topology::balanced(SimEnv::with_seed(3), 2, 2).unwrap())
    }

    #[test]
    fn connect_send_and_end() {
        run(async {
            let mut net = network();
            net.apply(&Operation::AddPeer { router: 3, name: 0 }).await;
            net.apply(&Operation::AddPeer { router: 4, name: 1 }).await;
            net.apply(&Operation::EnableHost { peer: 1 }).await;

            assert_eq!(net.apply(&Operation::Connect { client: 0, server: 1 }).await, OperationResult::Ok);

            let payload = SmallPayload { seed: 1, size_class: 1 };
            net.apply(&Operation::Send { connection: 0, side: Side::Client, payload }).await;

            let state = net.observable_state();
            assert_eq!(state.connections[0].homes, [1]);
            assert_eq!(state.connections[0].to_server, [vec![1, 2, 3, 4]]);
            net.check_invariants().unwrap();

            net.apply(&Operation::End { connection: 0, side: Side::Server }).await;

            let state = net.observable_state();
            assert_eq!(state.connections[0].client_end.as_deref(), Some(END_REASON));
            assert!(state.connections[0].homes.is_empty());
            net.check_invariants().unwrap();
        })
        .unwrap();
    }

    #[test]
    fn operations_on_empty_network() {
        run(async {
            let mut net = network();

            assert_eq!(
                net.apply(&Operation::DisposePeer { peer: 0 }).await,
                OperationResult::Error(OperationError::NoPeers)
            );
            assert_eq!(
                net.apply(&Operation::DisposeConnection { connection: 0, side: Side::Client }).await,
                OperationResult::Error(OperationError::NoConnections)
            );
            assert_eq!(net.apply(&Operation::FindByName { name: 0 }).await, OperationResult::Found(vec![]));
        })
        .unwrap();
    }
}
