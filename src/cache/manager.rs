use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, info, trace, warn};

use crate::cache::cell::{
    AssetCell, CellState, LoadOutcome, RefAcquire, UnloadOutcome,
};
use crate::cache::table::CacheTable;
use crate::error::AssetError;
use crate::handle::Handle;
use crate::io::source::{AssetSource, DirectorySource};
use crate::loader::{AssetLoader, LoadContext};
use crate::memory::scratch::ScratchPool;
use crate::tasks::{CacheTask, TaskPool, WorkerPool};

pub struct ManagerOptions {
    /// Root directory the default [`DirectorySource`] serves content from.
    pub content_root: String,
    /// Worker count for the default pool created by [`AssetManager::new`].
    pub workers: usize,
    pub scratch_arenas: usize,
    pub scratch_retain_bytes: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            content_root: "_data".to_string(),
            workers: 4,
            scratch_arenas: 4,
            scratch_retain_bytes: 4 << 20,
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    unloads: AtomicU64,
    scheduled: AtomicU64,
}

/// Point-in-time snapshot of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub unloads: u64,
    pub scheduled: u64,
    pub cells: usize,
}

struct ManagerShared<L: AssetLoader> {
    table: CacheTable<L>,
    scratch: ScratchPool,
    source: Arc<dyn AssetSource>,
    pool: Arc<dyn TaskPool>,
    counters: Counters,
}

/// The cache façade. Owns the cell table, the scratch pool and a handle to the task pool;
/// everything behind one `Arc`, so clones are cheap and scheduled work keeps the cache
/// alive until it ran.
///
/// One manager serves one resource family (mirroring one resolver per asset type); run
/// several managers side by side for textures, meshes, shaders and so on.
pub struct AssetManager<L: AssetLoader> {
    shared: Arc<ManagerShared<L>>,
}

impl<L: AssetLoader> Clone for AssetManager<L> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<L: AssetLoader + 'static> AssetManager<L> {
    /// Convenience constructor: directory content source plus an owned [`WorkerPool`].
    pub fn new(options: ManagerOptions) -> Self {
        let source = Arc::new(DirectorySource::new(&options.content_root));
        let pool = Arc::new(WorkerPool::new(options.workers));
        Self::with_parts(source, pool, options)
    }

    pub fn with_parts(
        source: Arc<dyn AssetSource>,
        pool: Arc<dyn TaskPool>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                table: CacheTable::new(),
                scratch: ScratchPool::new(options.scratch_arenas, options.scratch_retain_bytes),
                source,
                pool,
                counters: Counters::default(),
            }),
        }
    }

    /// Registers the resource in the cache table without loading it. Returns the existing
    /// handle when an identical resource (by `loader.hash()`) was interned before.
    pub fn intern(&self, loader: L) -> Handle {
        self.shared.table.intern(loader).0
    }

    /// Synchronous load: interns the resource and drives the cell's load transition on the
    /// calling thread. Succeeds without re-running the loader body when the resource is
    /// already loaded or being loaded elsewhere.
    pub fn load(&self, loader: L) -> Result<Handle, AssetError> {
        let (handle, cell) = self.shared.table.intern(loader);
        self.shared.load_cell(&cell)?;
        Ok(handle)
    }

    /// Fire-and-forget load on the task pool. The resource is interned immediately so the
    /// caller has a handle to poll with [`Self::try_get`]; failures of the scheduled body
    /// are logged and swallowed, there is no caller left to report them to.
    pub fn schedule_load(&self, loader: L) -> Handle {
        let (handle, _cell) = self.shared.table.intern(loader);
        self.schedule_task(CacheTask::Load(handle));
        handle
    }

    /// Unloads the resource if (and only if) no references are outstanding. Returns
    /// whether the cell ended up unloaded.
    pub fn unload(&self, handle: Handle) -> bool {
        let Some(cell) = self.shared.table.cell(handle) else {
            warn!("Unload for unknown handle {}", handle);
            return false;
        };
        self.shared.unload_cell(&cell) != UnloadOutcome::Referenced
    }

    pub fn schedule_unload(&self, handle: Handle) {
        self.schedule_task(CacheTask::Unload(handle));
    }

    /// Takes a reference, loading on demand if the cell was evicted back to unloaded.
    /// Blocks while another thread holds the load/unload transition.
    pub fn get(&self, handle: Handle) -> Result<ResourceRef<L>, AssetError> {
        let cell = self.shared.table.cell(handle).ok_or(AssetError::NotFound)?;
        loop {
            match cell.add_reference() {
                RefAcquire::Acquired => {
                    self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(ResourceRef { cell });
                }
                RefAcquire::Unavailable => {
                    self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
                    self.shared.load_cell(&cell)?;
                }
                RefAcquire::Saturated => {
                    return Err(AssetError::Unexpected(
                        "reference count saturated".to_string(),
                    ));
                }
            }
        }
    }

    /// Non-blocking fast path: a reference if the resource is loaded right now, `None`
    /// while it is loading, unloading or unloaded. Meant to be cheap enough to call once
    /// per frame from a time-critical thread.
    pub fn try_get(&self, handle: Handle) -> Option<ResourceRef<L>> {
        let cell = self.shared.table.cell(handle)?;
        match cell.add_reference_if_cached() {
            RefAcquire::Acquired => {
                self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(ResourceRef { cell })
            }
            RefAcquire::Unavailable | RefAcquire::Saturated => {
                self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Gives a reference back. Equivalent to dropping it; exists so call sites can spell
    /// out the release explicitly.
    pub fn unget(&self, resource: ResourceRef<L>) {
        drop(resource);
    }

    /// Diagnostic state of a cell, `None` for handles never interned.
    pub fn state(&self, handle: Handle) -> Option<CellState> {
        self.shared.table.cell(handle).map(|cell| cell.snapshot())
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.shared.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            loads: counters.loads.load(Ordering::Relaxed),
            load_failures: counters.load_failures.load(Ordering::Relaxed),
            unloads: counters.unloads.load(Ordering::Relaxed),
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            cells: self.shared.table.len(),
        }
    }

    /// Force-unloads every cell that holds no references and reports the cells that are
    /// still referenced (those leak under a caller that never releases them). Also runs
    /// from `Drop`, calling it explicitly just makes the result observable.
    pub fn shutdown(&self) -> usize {
        self.shared.sweep()
    }

    fn schedule_task(&self, task: CacheTask) {
        self.shared.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        let shared = self.shared.clone();
        self.shared.pool.schedule(Box::new(move || {
            shared.run_task(task);
        }));
    }
}

impl<L: AssetLoader> ManagerShared<L> {
    fn load_cell(&self, cell: &AssetCell<L>) -> Result<(), AssetError> {
        let mut lease = self.scratch.acquire();
        let mut ctx = LoadContext {
            source: self.source.as_ref(),
            scratch: &mut *lease,
        };
        match cell.load(&mut ctx) {
            Ok(LoadOutcome::Performed) => {
                self.counters.loads.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(LoadOutcome::AlreadyLoaded) => Ok(()),
            Err(err) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn unload_cell(&self, cell: &AssetCell<L>) -> UnloadOutcome {
        let mut lease = self.scratch.acquire();
        let outcome = cell.unload(&mut *lease);
        if outcome == UnloadOutcome::Performed {
            self.counters.unloads.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    fn run_task(&self, task: CacheTask) {
        match task {
            CacheTask::Load(handle) => {
                let Some(cell) = self.table.cell(handle) else {
                    error!("Scheduled load for unknown handle {}", handle);
                    return;
                };
                if let Err(err) = self.load_cell(&cell) {
                    error!("Scheduled load of {} failed: {}", handle, err);
                }
            }
            CacheTask::Unload(handle) => {
                let Some(cell) = self.table.cell(handle) else {
                    error!("Scheduled unload for unknown handle {}", handle);
                    return;
                };
                if self.unload_cell(&cell) == UnloadOutcome::Referenced {
                    trace!("Scheduled unload of {} skipped, still referenced", handle);
                }
            }
        }
    }

    fn sweep(&self) -> usize {
        let mut leaked = 0;
        for (handle, cell) in self.table.entries() {
            match self.unload_cell(&cell) {
                UnloadOutcome::Referenced => {
                    warn!("Cell {} still referenced at shutdown, leaking it", handle);
                    leaked += 1;
                }
                UnloadOutcome::Performed => trace!("Swept {} during shutdown", handle),
                UnloadOutcome::AlreadyUnloaded => {}
            }
        }
        if leaked == 0 {
            info!("Cache shutdown clean, {} cells swept", self.table.len());
        }
        leaked
    }
}

impl<L: AssetLoader> Drop for ManagerShared<L> {
    fn drop(&mut self) {
        self.sweep();
    }
}

/// A counted reference to a loaded resource. The referenced resource cannot be unloaded
/// while any of these are alive; dropping one releases the count (same as
/// [`AssetManager::unget`]).
pub struct ResourceRef<L: AssetLoader> {
    cell: Arc<AssetCell<L>>,
}

impl<L: AssetLoader> ResourceRef<L> {
    pub fn view(&self) -> &L::View {
        // Safety: this ResourceRef owns one of the counted references until it drops.
        unsafe { self.cell.loader_ref() }.view()
    }
}

impl<L: AssetLoader> Deref for ResourceRef<L> {
    type Target = L::View;

    fn deref(&self) -> &L::View {
        self.view()
    }
}

impl<L: AssetLoader> Drop for ResourceRef<L> {
    fn drop(&mut self) {
        self.cell.remove_reference();
    }
}
