use std::fmt::{Display, Formatter};
use std::hash::Hasher;

/// Stable identifier for a cacheable resource, derived from hashing the resource's
/// identifying bytes (usually its canonical path). Two loaders that hash identically are
/// the same cached resource. A handle stays valid for the whole manager lifetime and is
/// never reused for a different logical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub(crate) u64);

impl Handle {
    pub fn from_bytes(identity: &[u8]) -> Self {
        Handle(hash_bytes(identity))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// SipHash with the std default keys: deterministic for the process lifetime, which is all
/// the stability the cache table needs.
pub fn hash_bytes(identity: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write(identity);
    hasher.finish()
}
