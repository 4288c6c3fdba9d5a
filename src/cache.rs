use std::num::NonZeroUsize;

use lru::LruCache;

use crate::{Slab, SlabResult};

/// Soft cap on resident decoded tiles per reader.
const TILE_CACHE_ITEMS: usize = 256;

/// Bounded LRU cache of decoded tiles, keyed by archive-internal path.
///
/// Purely a latency optimization: eviction or a zero-hit cache never changes
/// what the reader returns.
pub(crate) struct TileCache {
    inner: LruCache<String, Slab>,
}

impl TileCache {
    pub(crate) fn new() -> Self {
        TileCache {
            inner: LruCache::new(NonZeroUsize::new(TILE_CACHE_ITEMS).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Fetch the tile at `path`, decoding through `load` on a miss.
    pub(crate) fn get_or_load(
        &mut self,
        path: &str,
        load: impl FnOnce() -> SlabResult<Slab>,
    ) -> SlabResult<Slab> {
        if let Some(slab) = self.inner.get(path) {
            return Ok(slab.clone());
        }
        let slab = load()?;
        self.inner.put(path.to_string(), slab.clone());
        Ok(slab)
    }
}
