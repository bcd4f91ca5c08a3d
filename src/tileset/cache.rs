//! LRU cache of open tile archives.
//!
//! A tileset touches one archive per super-tile and file group; keeping
//! them all open exhausts file descriptors on deep datasets. The cache
//! holds archives in LRU order and evicts when the process-wide open-file
//! budget runs out. A dirty archive is flushed before eviction.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use uuid::Uuid;

use crate::error::Result;
use crate::openfiles;
use crate::tile::TileId;
use crate::tilar::{CreateMode, OpenMode, Options, Tilar};

/// Archive file groups of a plain tileset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    /// Meshes and atlases, two slots per tile.
    Tiles,
    /// Navtiles, one slot per tile.
    Navtiles,
    /// Metatiles, one slot per metatile.
    Metas,
}

impl Group {
    pub fn files_per_tile(&self) -> u8 {
        match self {
            Group::Tiles => 2,
            Group::Navtiles | Group::Metas => 1,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Group::Tiles => "tiles",
            Group::Navtiles => "navtiles",
            Group::Metas => "metatiles",
        }
    }

    /// On-disk name of the archive holding super-tile `id`.
    pub fn archive_name(&self, id: TileId) -> String {
        format!("{}-{}.tilar", self.prefix(), id)
    }
}

/// Keyed LRU of open archives belonging to one tileset root.
pub struct ArchiveCache {
    root: PathBuf,
    binary_order: u8,
    uuid: Uuid,
    read_only: bool,
    archives: LruCache<(Group, TileId), Tilar>,
}

impl ArchiveCache {
    /// Hard cap on archives held per tileset regardless of the global
    /// budget.
    const LOCAL_LIMIT: usize = 64;

    pub fn new(root: &Path, binary_order: u8, uuid: Uuid, read_only: bool) -> Self {
        ArchiveCache {
            root: root.to_path_buf(),
            binary_order,
            uuid,
            read_only,
            archives: LruCache::new(NonZeroUsize::new(Self::LOCAL_LIMIT).unwrap()),
        }
    }

    fn options(&self, group: Group) -> Options {
        Options::new(self.binary_order, group.files_per_tile(), self.uuid)
    }

    pub fn path(&self, group: Group, archive: TileId) -> PathBuf {
        self.root.join(group.archive_name(archive))
    }

    /// Archive for `(group, archive)`, opened (or created, in write mode)
    /// on demand.
    pub fn archive(&mut self, group: Group, archive: TileId) -> Result<Tilar> {
        let key = (group, archive);
        if let Some(existing) = self.archives.get(&key) {
            return Ok(existing.clone());
        }

        // stay under the process-wide open-file budget
        while openfiles::over_threshold() && !self.archives.is_empty() {
            self.evict_one()?;
        }

        let path = self.path(group, archive);
        let tilar = if self.read_only {
            Tilar::open_with_options(&path, self.options(group), OpenMode::ReadOnly)?
        } else {
            Tilar::create(&path, self.options(group), CreateMode::AppendOrTruncate)?
        };

        if self.archives.len() >= Self::LOCAL_LIMIT {
            self.evict_one()?;
        }
        self.archives.put(key, tilar.clone());
        Ok(tilar)
    }

    fn evict_one(&mut self) -> Result<()> {
        if let Some((_, archive)) = self.archives.pop_lru() {
            if archive.is_dirty() {
                archive.flush()?;
            }
        }
        Ok(())
    }

    /// Flush every dirty archive.
    pub fn flush(&mut self) -> Result<()> {
        for (_, archive) in self.archives.iter() {
            if archive.is_dirty() {
                archive.flush()?;
            }
        }
        Ok(())
    }

    /// Drop cached archives, discarding unflushed changes.
    pub fn clear(&mut self) {
        for (_, archive) in self.archives.iter() {
            if archive.is_dirty() {
                archive.discard_changes();
            }
        }
        self.archives.clear();
    }
}
