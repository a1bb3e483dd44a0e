use crate::error::AssetError;
use crate::io::source::AssetSource;
use crate::memory::scratch::ScratchArena;

/// Everything a loader invocation gets to work with: the read-only content source and a
/// scratch arena for decode buffers. The arena is leased for this one call only, do not
/// stash buffers from it in the resource itself.
pub struct LoadContext<'a> {
    pub source: &'a dyn AssetSource,
    pub scratch: &'a mut ScratchArena,
}

/// The capability a resource type supplies to become load/unloadable by the cache.
///
/// The cache never inspects the produced resource value, it only hands out the typed
/// [`AssetLoader::view`] once a cell is observed in a loaded state. `load` and `unload`
/// are always executed by exactly one thread at a time per cell, so they take `&mut self`;
/// `view` may be called concurrently from many readers, which is why the trait requires
/// [`Sync`].
pub trait AssetLoader: Send + Sync {
    /// Read-only projection of the loaded resource handed out by the manager.
    type View: ?Sized;

    /// Identity of the underlying resource. Equal hashes mean "same cached resource",
    /// see [`crate::handle::hash_bytes`].
    fn hash(&self) -> u64;

    fn load(&mut self, ctx: &mut LoadContext<'_>) -> Result<(), AssetError>;

    /// Releases the loaded resource value. Must not fail; by the time this runs the cell
    /// owns the unloading transition and no references are outstanding.
    fn unload(&mut self, scratch: &mut ScratchArena);

    fn view(&self) -> &Self::View;
}
