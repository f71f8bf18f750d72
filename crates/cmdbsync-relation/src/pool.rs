//! Reusable scratch buffers for chain construction.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use crate::types::RelationItem;

/// Free list of node buffers. A buffer goes back to the pool, cleared,
/// when its [`PooledNodes`] guard drops.
#[derive(Debug, Default)]
pub struct NodePool {
    free: Mutex<Vec<Vec<RelationItem>>>,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> PooledNodes<'_> {
        let nodes = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        PooledNodes { pool: self, nodes }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, mut nodes: Vec<RelationItem>) {
        nodes.clear();
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(nodes);
    }
}

pub struct PooledNodes<'a> {
    pool: &'a NodePool,
    nodes: Vec<RelationItem>,
}

impl Deref for PooledNodes<'_> {
    type Target = Vec<RelationItem>;

    fn deref(&self) -> &Self::Target {
        &self.nodes
    }
}

impl DerefMut for PooledNodes<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.nodes
    }
}

impl Drop for PooledNodes<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.nodes));
    }
}
