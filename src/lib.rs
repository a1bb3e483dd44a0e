//! Concurrent asset cache: loads, shares and evicts engine resources (textures, meshes,
//! shaders, raw blobs) across worker threads without data races, double-loads or
//! use-after-unload.
//!
//! The moving parts, leaf first:
//!
//! * [`loader::AssetLoader`] — the capability a resource type supplies: `{hash, load,
//!   unload, view}`. The cache is generic over it and never learns about file formats.
//! * [`handle::Handle`] — stable content-derived identifier, independent of load state.
//! * [`cache::cell::AssetCell`] — one per distinct handle: an atomic state word that is
//!   simultaneously the reference count, plus the owning loader. See the module docs for
//!   the full state machine.
//! * [`cache::manager::AssetManager`] — the façade: `load`/`schedule_load`, `unload`/
//!   `schedule_unload`, `get`/`try_get`/`unget`. Owns the cell table and the scratch pool,
//!   dispatches async work onto a [`tasks::TaskPool`].
//! * [`memory::scratch`] — pooled scratch arenas leased to loader bodies so decoding does
//!   not contend on a global allocator lock.
//!
//! A typical flow: `manager.load(TextureLoader::new("ui/cursor.qoi"))` returns a handle;
//! render code calls `manager.try_get(handle)` once per frame and draws whatever is
//! already resident; a streaming system calls `schedule_load`/`schedule_unload` as the
//! camera moves. Whoever wins a cell's load transition runs the loader exactly once, every
//! other thread either piggybacks on the result or cooperatively waits.

pub mod cache;
pub mod error;
pub mod handle;
pub mod io;
pub mod loader;
pub mod memory;
pub mod tasks;

pub use cache::cell::CellState;
pub use cache::manager::{AssetManager, CacheStats, ManagerOptions, ResourceRef};
pub use error::AssetError;
pub use handle::Handle;
pub use io::blob::BlobLoader;
pub use io::source::{AssetSource, DirectorySource, MemorySource};
pub use loader::{AssetLoader, LoadContext};
pub use memory::scratch::{ScratchArena, ScratchLease, ScratchPool};
pub use tasks::{Job, TaskPool, WorkerPool};
