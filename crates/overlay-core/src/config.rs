//! Router configuration.

/// Default bound on the depth of a routing tree.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Router configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Deepest level a router may be attached at (root = 0).
    ///
    /// Bounds how far any request can be delegated upward.
    pub max_depth: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH }
    }
}
