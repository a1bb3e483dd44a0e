use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{trace, warn};

use crate::error::AssetError;

/// Read-only content the loaders pull their bytes from. Implementations must be callable
/// from multiple loader threads at once.
pub trait AssetSource: Send + Sync {
    fn contains(&self, path: &str) -> bool;

    /// Appends the file contents to `buf` (which usually comes from the scratch arena)
    /// and returns the number of bytes read.
    fn read_into(&self, path: &str, buf: &mut Vec<u8>) -> Result<usize, AssetError>;

    fn read(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        let mut buf = Vec::new();
        self.read_into(path, &mut buf)?;
        Ok(buf)
    }
}

/// Canonical form for asset paths: forward slashes, lowercase. Content shipped by tools on
/// different platforms disagrees about both, the cache must not.
pub fn canonicalize_path(path: &str) -> String {
    path.replace('\\', "/").to_ascii_lowercase()
}

/// Filesystem-backed content source rooted at a single directory.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(canonicalize_path(path))
    }
}

impl AssetSource for DirectorySource {
    fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn read_into(&self, path: &str, buf: &mut Vec<u8>) -> Result<usize, AssetError> {
        let resolved = self.resolve(path);
        let mut file = File::open(&resolved).map_err(|err| {
            warn!("Could not locate {}!", path);
            AssetError::from(err)
        })?;

        if let Ok(metadata) = file.metadata() {
            buf.reserve(metadata.len() as usize);
        }

        let read = file.read_to_end(buf)?;
        trace!("Loading {} from {}", path, self.root.display());
        Ok(read)
    }
}

/// In-memory content source, used for blob assets and tests.
#[derive(Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.insert(canonicalize_path(path), contents.into());
    }
}

impl AssetSource for MemorySource {
    fn contains(&self, path: &str) -> bool {
        self.files.contains_key(&canonicalize_path(path))
    }

    fn read_into(&self, path: &str, buf: &mut Vec<u8>) -> Result<usize, AssetError> {
        match self.files.get(&canonicalize_path(path)) {
            Some(contents) => {
                buf.extend_from_slice(contents);
                Ok(contents.len())
            }
            None => {
                warn!("Could not locate {}!", path);
                Err(AssetError::NotFound)
            }
        }
    }
}
