//! In-memory metatile cache.
//!
//! Two flavors: the LRU mode caps the number of concurrently open
//! metatiles and hands dirty victims back for write-back; the
//! scarce-memory mode keeps at most one metatile per lod (enough for
//! read-mostly traversals). Write mode requires the LRU flavor.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::meta::MetaTile;
use crate::tile::{Lod, TileId};

/// Default soft cap on concurrently open metatiles in LRU mode.
pub const DEFAULT_LIMIT: usize = 64;

enum Store {
    Lru(LruCache<TileId, Entry>),
    /// One metatile per lod.
    Scarce(BTreeMap<Lod, (TileId, Entry)>),
}

struct Entry {
    meta: MetaTile,
    dirty: bool,
}

/// Cache of loaded metatiles keyed by origin.
pub struct MetaCache {
    store: Store,
}

impl MetaCache {
    /// LRU cache with write-back support.
    pub fn lru(limit: usize) -> Self {
        MetaCache {
            store: Store::Lru(LruCache::new(
                NonZeroUsize::new(limit.max(1)).unwrap(),
            )),
        }
    }

    /// Scarce-memory cache: one metatile per lod, read-only use.
    pub fn scarce() -> Self {
        MetaCache {
            store: Store::Scarce(BTreeMap::new()),
        }
    }

    pub fn contains(&self, origin: TileId) -> bool {
        match &self.store {
            Store::Lru(cache) => cache.contains(&origin),
            Store::Scarce(map) => {
                matches!(map.get(&origin.lod), Some((id, _)) if *id == origin)
            }
        }
    }

    pub fn get(&mut self, origin: TileId) -> Option<&MetaTile> {
        match &mut self.store {
            Store::Lru(cache) => cache.get(&origin).map(|e| &e.meta),
            Store::Scarce(map) => match map.get(&origin.lod) {
                Some((id, entry)) if *id == origin => Some(&entry.meta),
                _ => None,
            },
        }
    }

    /// Mutable access; marks the metatile dirty.
    pub fn get_mut(&mut self, origin: TileId) -> Option<&mut MetaTile> {
        match &mut self.store {
            Store::Lru(cache) => cache.get_mut(&origin).map(|e| {
                e.dirty = true;
                &mut e.meta
            }),
            Store::Scarce(map) => match map.get_mut(&origin.lod) {
                Some((id, entry)) if *id == origin => {
                    entry.dirty = true;
                    Some(&mut entry.meta)
                }
                _ => None,
            },
        }
    }

    /// Insert a metatile. Returns an evicted dirty metatile that the
    /// caller must persist, if any.
    #[must_use]
    pub fn insert(
        &mut self,
        origin: TileId,
        meta: MetaTile,
        dirty: bool,
    ) -> Option<(TileId, MetaTile)> {
        let entry = Entry { meta, dirty };
        match &mut self.store {
            Store::Lru(cache) => {
                let mut evicted = None;
                if cache.len() == cache.cap().get() && !cache.contains(&origin) {
                    if let Some((id, victim)) = cache.pop_lru() {
                        if victim.dirty {
                            evicted = Some((id, victim.meta));
                        }
                    }
                }
                cache.put(origin, entry);
                evicted
            }
            Store::Scarce(map) => {
                let previous = map.insert(origin.lod, (origin, entry));
                match previous {
                    Some((id, victim)) if victim.dirty && id != origin => Some((id, victim.meta)),
                    _ => None,
                }
            }
        }
    }

    /// Drain every dirty metatile for persisting; entries stay cached and
    /// become clean.
    pub fn take_dirty(&mut self) -> Vec<(TileId, MetaTile)> {
        let mut out = Vec::new();
        match &mut self.store {
            Store::Lru(cache) => {
                for (id, entry) in cache.iter_mut() {
                    if entry.dirty {
                        entry.dirty = false;
                        out.push((*id, entry.meta.clone()));
                    }
                }
            }
            Store::Scarce(map) => {
                for (id, entry) in map.values_mut() {
                    if entry.dirty {
                        entry.dirty = false;
                        out.push((*id, entry.meta.clone()));
                    }
                }
            }
        }
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn clear(&mut self) {
        match &mut self.store {
            Store::Lru(cache) => cache.clear(),
            Store::Scarce(map) => map.clear(),
        }
    }
}
