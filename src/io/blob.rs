use log::trace;

use crate::error::AssetError;
use crate::handle::hash_bytes;
use crate::io::source::canonicalize_path;
use crate::loader::{AssetLoader, LoadContext};
use crate::memory::scratch::ScratchArena;

/// The simplest useful loader: the raw bytes of one file. Real engines layer format
/// specific loaders (textures, meshes, shaders) over the same trait; the cache does not
/// care about the difference.
pub struct BlobLoader {
    path: String,
    bytes: Option<Box<[u8]>>,
}

impl BlobLoader {
    pub fn new(path: &str) -> Self {
        Self {
            path: canonicalize_path(path),
            bytes: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl AssetLoader for BlobLoader {
    type View = [u8];

    fn hash(&self) -> u64 {
        hash_bytes(self.path.as_bytes())
    }

    fn load(&mut self, ctx: &mut LoadContext<'_>) -> Result<(), AssetError> {
        // Stage the read through the leased arena so repeated loads reuse its capacity,
        // then shrink into an exact-sized allocation that lives as long as the resource.
        let mut staging = ctx.scratch.take_buffer();
        let result = ctx.source.read_into(&self.path, &mut staging);

        match result {
            Ok(read) => {
                trace!("Loaded blob {} ({} bytes)", self.path, read);
                self.bytes = Some(staging.as_slice().into());
                ctx.scratch.recycle(staging);
                Ok(())
            }
            Err(err) => {
                ctx.scratch.recycle(staging);
                Err(err)
            }
        }
    }

    fn unload(&mut self, _scratch: &mut ScratchArena) {
        self.bytes = None;
    }

    fn view(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or(&[])
    }
}
