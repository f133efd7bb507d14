//! Tree builder for simulated networks.
//!
//! Routers are numbered in creation order; the root is always router 0.

use overlay_core::{ConnectionId, Environment, NetworkError, Peer, Router, RouterConfig};
use thiserror::Error;

/// Position of a router inside a [`Topology`].
///
/// Only handed out by the topology that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterId(usize);

impl RouterId {
    /// Creation index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Errors from building or addressing a [`Topology`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// The id was not handed out by this topology.
    #[error("router {0} is not part of this topology")]
    UnknownRouter(usize),

    /// The routing layer refused the request.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// A tree of routers sharing one environment.
pub struct Topology<E: Environment> {
    env: E,
    config: RouterConfig,
    routers: Vec<Router<E>>,
    parents: Vec<Option<RouterId>>,
}

impl<E: Environment> Topology<E> {
    /// A tree holding only a root.
    pub fn new(env: E) -> Self {
        Self::with_config(env, RouterConfig::default())
    }

    /// A tree holding only a root; routers added later use `config`.
    pub fn with_config(env: E, config: RouterConfig) -> Self {
        let root = Router::root(env.clone());
        Self { env, config, routers: vec![root], parents: vec![None] }
    }

    /// A complete tree where every router above `depth` has `fanout`
    /// children. Routers are created breadth first.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::TopologyTooDeep` if `depth` exceeds the
    /// default maximum.
    pub fn balanced(env: E, fanout: usize, depth: usize) -> Result<Self, TopologyError> {
        let mut topology = Self::new(env);
        let mut level = vec![topology.root()];

        for _ in 0..depth {
            let mut next = Vec::with_capacity(level.len() * fanout);
            for &parent in &level {
                for _ in 0..fanout {
                    next.push(topology.add_router(parent)?);
                }
            }
            level = next;
        }

        Ok(topology)
    }

    /// The root router.
    pub fn root(&self) -> RouterId {
        RouterId(0)
    }

    /// Add a router beneath `parent`.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownRouter` if `parent` belongs to another tree
    /// - `NetworkError::TopologyTooDeep` past the configured depth
    pub fn add_router(&mut self, parent: RouterId) -> Result<RouterId, TopologyError> {
        let parent_facade = self.known(parent)?.connect();
        let router = Router::with_config(Some(parent_facade), self.env.clone(), self.config)?;
        let id = RouterId(self.routers.len());

        self.routers.push(router);
        self.parents.push(Some(parent));
        tracing::trace!(router = id.0, parent = parent.0, "router added");

        Ok(id)
    }

    /// Register a peer at `at`.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownRouter` if `at` belongs to another tree
    /// - Registration failures from the routing layer
    pub async fn add_peer(&self, at: RouterId, name: Option<&str>) -> Result<Peer, TopologyError> {
        let parent = self.known(at)?.connect();
        Ok(Peer::make(parent, name, &self.env).await?)
    }

    fn known(&self, id: RouterId) -> Result<&Router<E>, TopologyError> {
        self.router(id).ok_or(TopologyError::UnknownRouter(id.0))
    }

    /// Router by id, `None` if `id` belongs to another tree.
    pub fn router(&self, id: RouterId) -> Option<&Router<E>> {
        self.routers.get(id.0)
    }

    /// Parent of `id`, `None` for the root or an unknown id.
    pub fn parent(&self, id: RouterId) -> Option<RouterId> {
        self.parents.get(id.0).copied().flatten()
    }

    /// Every router id, in creation order.
    pub fn router_ids(&self) -> impl Iterator<Item = RouterId> + use<E> {
        (0..self.routers.len()).map(RouterId)
    }

    /// Routers without children.
    pub fn leaves(&self) -> Vec<RouterId> {
        self.router_ids().filter(|id| !self.parents.contains(&Some(*id))).collect()
    }

    /// Number of routers.
    pub fn len(&self) -> usize {
        self.routers.len()
    }

    /// Always false: a topology has at least its root.
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// The shared environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Ancestors of `id` from itself up to the root. Empty for an unknown id.
    pub fn path_to_root(&self, id: RouterId) -> Vec<RouterId> {
        let mut path = Vec::new();
        let mut current = self.router(id).map(|_| id);
        while let Some(id) = current {
            path.push(id);
            current = self.parent(id);
        }
        path
    }

    /// Deepest router that has both `a` and `b` in its subtree.
    pub fn lowest_common_router(&self, a: RouterId, b: RouterId) -> Option<RouterId> {
        let above_a = self.path_to_root(a);
        self.path_to_root(b).into_iter().find(|id| above_a.contains(id))
    }

    /// Routers holding a registration of `connection`.
    pub fn homes_of(&self, connection: &ConnectionId) -> Vec<RouterId> {
        self.router_ids()
            .zip(&self.routers)
            .filter(|(_, router)| router.connection_record(connection).is_some())
            .map(|(id, _)| id)
            .collect()
    }

    /// Connections registered anywhere in the tree.
    pub fn connection_count(&self) -> usize {
        self.routers.iter().map(Router::connection_count).sum()
    }
}

impl<E: Environment> std::fmt::Debug for Topology<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology").field("routers", &self.routers).field("parents", &self.parents).finish()
    }
}
