//! Model network - the reference implementation.
//!
//! Flat bookkeeping with no routing at all: a connection is a pair of peer
//! indices and a flag. Where the tree would have placed it is computed from
//! the router parent table.

use overlay_core::{CONNECTION_DISPOSED, PEER_DISCONNECTED};

use super::operation::{
    END_REASON, Operation, OperationError, OperationResult, Side, peer_name, resolve,
};

/// What a connection looks like from outside the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionView {
    /// Client endpoint still open
    pub client_open: bool,
    /// Server endpoint still open
    pub server_open: bool,
    /// End reason observed by the client
    pub client_end: Option<String>,
    /// End reason observed by the server
    pub server_end: Option<String>,
    /// Payloads received by the client, in order
    pub to_client: Vec<Vec<u8>>,
    /// Payloads received by the server, in order
    pub to_server: Vec<Vec<u8>>,
    /// Routers holding the connection record
    pub homes: Vec<usize>,
}

/// Observable state for oracle comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservableState {
    /// Registered (not disposed) peers, by slot
    pub active_peers: Vec<usize>,
    /// Every connection ever opened, in creation order
    pub connections: Vec<ConnectionView>,
}

#[derive(Debug, Clone)]
struct ModelPeer {
    router: usize,
    name: String,
    hosting: bool,
    disposed: bool,
}

#[derive(Debug, Clone)]
struct ModelConnection {
    client: usize,
    server: usize,
    home: usize,
    open: bool,
    client_end: Option<String>,
    server_end: Option<String>,
    to_client: Vec<Vec<u8>>,
    to_server: Vec<Vec<u8>>,
}

impl ModelConnection {
    fn close(&mut self, closer: Side, reason: &str) {
        self.open = false;
        match closer {
            Side::Client => self.server_end = Some(reason.to_string()),
            Side::Server => self.client_end = Some(reason.to_string()),
        }
    }

    fn touches(&self, peer: usize) -> Option<Side> {
        if self.client == peer {
            Some(Side::Client)
        } else if self.server == peer {
            Some(Side::Server)
        } else {
            None
        }
    }
}

/// Reference model of a routing tree with peers.
#[derive(Debug, Clone)]
pub struct ModelNetwork {
    parents: Vec<Option<usize>>,
    peers: Vec<ModelPeer>,
    connections: Vec<ModelConnection>,
}

impl ModelNetwork {
    /// A complete tree with the same breadth-first numbering as
    /// `Topology::balanced`.
    pub fn balanced(fanout: usize, depth: usize) -> Self {
        let mut parents = vec![None];
        let mut level = vec![0];

        for _ in 0..depth {
            let mut next = Vec::new();
            for &parent in &level {
                for _ in 0..fanout {
                    next.push(parents.len());
                    parents.push(Some(parent));
                }
            }
            level = next;
        }

        Self { parents, peers: Vec::new(), connections: Vec::new() }
    }

    /// Number of routers.
    pub fn router_count(&self) -> usize {
        self.parents.len()
    }

    /// Number of peers ever added.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of connections ever opened.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Apply an operation.
    pub fn apply(&mut self, op: &Operation) -> OperationResult {
        match op {
            Operation::AddPeer { router, name } => {
                let Some(router) = resolve(*router, self.router_count()) else {
                    return OperationResult::Error(OperationError::Internal);
                };
                self.peers.push(ModelPeer {
                    router,
                    name: peer_name(*name),
                    hosting: false,
                    disposed: false,
                });
                OperationResult::Ok
            },
            Operation::EnableHost { peer } => match resolve(*peer, self.peers.len()) {
                Some(peer) => {
                    self.peers[peer].hosting = true;
                    OperationResult::Ok
                },
                None => OperationResult::Error(OperationError::NoPeers),
            },
            Operation::Connect { client, server } => {
                let len = self.peers.len();
                match (resolve(*client, len), resolve(*server, len)) {
                    (Some(client), Some(server)) => self.connect(client, server),
                    _ => OperationResult::Error(OperationError::NoPeers),
                }
            },
            Operation::Send { connection, side, payload } => {
                let Some(index) = resolve(*connection, self.connections.len()) else {
                    return OperationResult::Error(OperationError::NoConnections);
                };
                let connection = &mut self.connections[index];
                if !connection.open {
                    return OperationResult::Error(OperationError::ConnectionClosed);
                }
                match side {
                    Side::Client => connection.to_server.push(payload.to_bytes()),
                    Side::Server => connection.to_client.push(payload.to_bytes()),
                }
                OperationResult::Ok
            },
            Operation::End { connection, side } => self.end(*connection, *side, END_REASON),
            Operation::DisposeConnection { connection, side } => {
                self.end(*connection, *side, CONNECTION_DISPOSED)
            },
            Operation::DisposePeer { peer } => match resolve(*peer, self.peers.len()) {
                Some(peer) => {
                    self.dispose_peer(peer);
                    OperationResult::Ok
                },
                None => OperationResult::Error(OperationError::NoPeers),
            },
            Operation::FindByName { name } => {
                let name = peer_name(*name);
                OperationResult::Found(
                    self.peers
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| !p.disposed && p.name == name)
                        .map(|(slot, _)| slot)
                        .collect(),
                )
            },
        }
    }

    fn end(&mut self, slot: u8, side: Side, reason: &str) -> OperationResult {
        let Some(index) = resolve(slot, self.connections.len()) else {
            return OperationResult::Error(OperationError::NoConnections);
        };
        let connection = &mut self.connections[index];
        if connection.open {
            connection.close(side, reason);
        }
        OperationResult::Ok
    }

    fn connect(&mut self, client: usize, server: usize) -> OperationResult {
        if client == server {
            return OperationResult::Error(OperationError::ConnectionRejected);
        }
        if self.peers[client].disposed {
            return OperationResult::Error(OperationError::AccessDenied);
        }
        if self.peers[server].disposed {
            return OperationResult::Error(OperationError::PeerNotFound);
        }
        if !self.peers[server].hosting {
            return OperationResult::Error(OperationError::ConnectionRejected);
        }

        let home = self.lowest_common_router(self.peers[client].router, self.peers[server].router);
        self.connections.push(ModelConnection {
            client,
            server,
            home,
            open: true,
            client_end: None,
            server_end: None,
            to_client: Vec::new(),
            to_server: Vec::new(),
        });

        OperationResult::Ok
    }

    fn dispose_peer(&mut self, peer: usize) {
        if self.peers[peer].disposed {
            return;
        }
        self.peers[peer].disposed = true;

        for connection in self.connections.iter_mut().filter(|c| c.open) {
            if let Some(side) = connection.touches(peer) {
                connection.close(side, PEER_DISCONNECTED);
            }
        }
    }

    fn ancestors(&self, router: usize) -> Vec<usize> {
        let mut path = vec![router];
        let mut current = router;
        while let Some(parent) = self.parents[current] {
            path.push(parent);
            current = parent;
        }
        path
    }

    fn lowest_common_router(&self, a: usize, b: usize) -> usize {
        let above_a = self.ancestors(a);
        self.ancestors(b).into_iter().find(|r| above_a.contains(r)).unwrap_or(0)
    }

    /// Extract observable state for comparison.
    pub fn observable_state(&self) -> ObservableState {
        let active_peers =
            self.peers.iter().enumerate().filter(|(_, p)| !p.disposed).map(|(slot, _)| slot).collect();

        let connections = self
            .connections
            .iter()
            .map(|c| ConnectionView {
                client_open: c.open,
                server_open: c.open,
                client_end: c.client_end.clone(),
                server_end: c.server_end.clone(),
                to_client: c.to_client.clone(),
                to_server: c.to_server.clone(),
                homes: if c.open { vec![c.home] } else { Vec::new() },
            })
            .collect();

        ObservableState { active_peers, connections }
    }
}
