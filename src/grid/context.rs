use super::service::Grid;
use crate::config::GridConfig;
use crate::membership::types::NodeId;
use crate::storage::StateStore;

use std::sync::Arc;

/// What a running task or a stage predicate can see of the grid.
#[derive(Clone)]
pub struct GridContext {
    grid: Arc<Grid>,
}

impl GridContext {
    pub fn new(grid: Arc<Grid>) -> Self {
        Self { grid }
    }

    pub fn node_id(&self) -> NodeId {
        self.grid.node_id()
    }

    pub fn is_coordinator(&self) -> bool {
        self.grid.is_coordinator()
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.grid.members()
    }

    pub fn storage(&self) -> Arc<dyn StateStore> {
        self.grid.storage().clone()
    }

    pub fn config(&self) -> &GridConfig {
        self.grid.config()
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }
}
