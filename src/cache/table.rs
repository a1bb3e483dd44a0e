use std::sync::Arc;

use dashmap::DashMap;
use itertools::Itertools;

use crate::cache::cell::AssetCell;
use crate::handle::Handle;
use crate::loader::AssetLoader;

/// Concurrent handle -> cell map. Entries are created once and never removed until the
/// whole cache shuts down, so a cell reference obtained here stays valid for the manager's
/// entire lifetime. Lookups take the sharded read path; only the rare "brand-new handle"
/// insert holds a shard lock.
pub(crate) struct CacheTable<L: AssetLoader> {
    cells: DashMap<Handle, Arc<AssetCell<L>>>,
}

impl<L: AssetLoader> CacheTable<L> {
    pub(crate) fn new() -> Self {
        Self {
            cells: DashMap::with_capacity(128),
        }
    }

    /// Returns the existing cell for an identical resource (decided by `loader.hash()`) or
    /// inserts a new unloaded one. A loader that loses the insert race is simply dropped,
    /// the raced winner's cell is what everyone shares.
    pub(crate) fn intern(&self, loader: L) -> (Handle, Arc<AssetCell<L>>) {
        let handle = Handle(loader.hash());

        if let Some(cell) = self.cells.get(&handle) {
            return (handle, cell.value().clone());
        }

        let cell = self
            .cells
            .entry(handle)
            .or_insert_with(|| Arc::new(AssetCell::new(loader)))
            .value()
            .clone();
        (handle, cell)
    }

    pub(crate) fn cell(&self, handle: Handle) -> Option<Arc<AssetCell<L>>> {
        self.cells.get(&handle).map(|entry| entry.value().clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.cells.len()
    }

    /// Snapshot of all entries. Collected up front so callers do not hold shard locks
    /// while running unload bodies.
    pub(crate) fn entries(&self) -> Vec<(Handle, Arc<AssetCell<L>>)> {
        self.cells
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect_vec()
    }
}
