//! Tileset: a coherent collection of tiles (meshes, atlases, navtiles and
//! metadata) over one reference frame.
//!
//! The tileset binds the driver (physical storage), the tile index
//! (existence and flags), the metatile tree (per-tile metadata) and the
//! config into one unit. Writes go through [`TileSet::set_tile`], which
//! stores the payload streams and pushes derived metadata up the
//! quad-tree; nothing is visible to a fresh open until [`TileSet::flush`].

pub mod aggregated;
pub mod cache;
pub mod config;
pub mod driver;
pub mod glue;
pub mod merge;
pub mod metacache;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::atlas::RawAtlas;
use crate::cancel::CancelToken;
use crate::error::{Result, TileStoreError};
use crate::index::{TileFlags, TileSetIndex};
use crate::math::Extents3;
use crate::mesh::Mesh;
use crate::meta::{MetaNode, MetaTile};
use crate::navtile::NavTile;
use crate::registry::{self, NodeInfo, ReferenceFrame, Registry};
use crate::tile::{parent, LodRange, TileFile, TileId, TileRange};

pub use config::{
    AggregatedOptions, DriverOptions, LocalOptions, MapConfig, PlainOptions, RemoteOptions,
    TileSetProperties,
};
pub use driver::{Driver, File, OpenMode};

/// Creation behavior over existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    FailIfExists,
    /// Replace existing content, bumping the revision.
    Overwrite,
}

/// One tile's content as handed to / read from a tileset.
#[derive(Debug, Clone, Default)]
pub struct Tile {
    pub mesh: Option<Mesh>,
    pub atlas: Option<RawAtlas>,
    pub navtile: Option<NavTile>,
    pub credits: BTreeSet<u16>,
    /// Tile borrowed from another surface (glue bookkeeping).
    pub alien: bool,
}

/// Options for [`clone_tile_set`].
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    pub tileset_id: Option<String>,
    pub lod_range: Option<LodRange>,
}

/// An open tileset.
pub struct TileSet {
    root: PathBuf,
    driver: RefCell<Driver>,
    properties: TileSetProperties,
    reference_frame: ReferenceFrame,
    index: TileSetIndex,
    metacache: RefCell<metacache::MetaCache>,
    read_only: bool,
    metadata_changed: bool,
    cancel: Option<CancelToken>,
}

/// Create a new tileset at `path`.
pub fn create_tile_set(
    path: &Path,
    properties: &TileSetProperties,
    mode: CreateMode,
) -> Result<TileSet> {
    let reference_frame = Registry::system()
        .reference_frame(&properties.reference_frame)?
        .clone();

    let mut properties = properties.clone();
    let config_path = path.join(File::Config.name());
    if config_path.exists() {
        match mode {
            CreateMode::FailIfExists => {
                return Err(TileStoreError::StorageAlreadyExists(path.to_path_buf()));
            }
            CreateMode::Overwrite => {
                // continue the revision chain of the replaced content
                if let Ok(data) = fs::read_to_string(&config_path) {
                    if let Ok(old) = config::load_config(&data, &config_path) {
                        properties.revision = old.revision + 1;
                    }
                }
            }
        }
    }

    info!(id = %properties.id, path = %path.display(), revision = properties.revision,
        "Creating tileset");

    let driver = Driver::create(path, &properties.driver)?;
    let mut tileset = TileSet {
        root: path.to_path_buf(),
        driver: RefCell::new(driver),
        properties,
        reference_frame,
        index: TileSetIndex::default(),
        metacache: RefCell::new(metacache::MetaCache::lru(metacache::DEFAULT_LIMIT)),
        read_only: false,
        metadata_changed: true,
        cancel: None,
    };
    tileset.flush()?;
    Ok(tileset)
}

/// Open an existing tileset.
pub fn open_tile_set(path: &Path, mode: OpenMode) -> Result<TileSet> {
    let config_path = path.join(File::Config.name());
    let data = fs::read_to_string(&config_path)
        .map_err(|_| TileStoreError::NoSuchTileSet(path.display().to_string()))?;
    let properties = config::load_config(&data, &config_path)?;
    let reference_frame = Registry::system()
        .reference_frame(&properties.reference_frame)?
        .clone();

    let mut driver = Driver::open(path, &properties.driver, mode)?;
    let index = {
        let source = driver.input_file(File::TileIndex)?;
        TileSetIndex::load(&mut source.bytes(), &path.join(File::TileIndex.name()))?
    };

    let read_only = mode == OpenMode::ReadOnly;
    let metacache = if read_only {
        metacache::MetaCache::scarce()
    } else {
        metacache::MetaCache::lru(metacache::DEFAULT_LIMIT)
    };

    debug!(id = %properties.id, path = %path.display(), "Opened tileset");

    Ok(TileSet {
        root: path.to_path_buf(),
        driver: RefCell::new(driver),
        properties,
        reference_frame,
        index,
        metacache: RefCell::new(metacache),
        read_only,
        metadata_changed: false,
        cancel: None,
    })
}

/// Copy `src` into a new tileset at `path` without recoding tiles.
pub fn clone_tile_set(path: &Path, src: &TileSet, options: &CloneOptions) -> Result<TileSet> {
    let mut properties = src.properties.clone();
    if let Some(id) = &options.tileset_id {
        properties.id = id.clone();
    }
    // fresh physical identity; non-plain sources materialize as plain
    properties.driver = match &src.properties.driver {
        DriverOptions::Plain(plain) => {
            DriverOptions::plain(plain.binary_order, plain.meta_unused_bits)
        }
        _ => DriverOptions::plain(5, src.reference_frame.meta_binary_order),
    };
    properties.revision = 0;
    properties.lod_range = LodRange::empty();
    properties.tile_range = TileRange::invalid();

    let mut dst = create_tile_set(path, &properties, CreateMode::FailIfExists)?;
    dst.paste(src, options.lod_range)?;
    dst.flush()?;
    Ok(dst)
}

impl TileSet {
    pub fn id(&self) -> &str {
        &self.properties.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn properties(&self) -> &TileSetProperties {
        &self.properties
    }

    pub fn reference_frame(&self) -> &ReferenceFrame {
        &self.reference_frame
    }

    pub fn tile_index(&self) -> &TileSetIndex {
        &self.index
    }

    pub fn lod_range(&self) -> LodRange {
        self.properties.lod_range
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Attach a cancellation token checked at loop boundaries.
    pub fn watch(&mut self, cancel: CancelToken) {
        self.cancel = Some(cancel);
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(TileStoreError::ReadOnly(format!(
                "tileset <{}>",
                self.properties.id
            )));
        }
        Ok(())
    }

    /// Whether a real tile (mesh or atlas) exists at `tile`.
    pub fn exists(&self, tile: TileId) -> bool {
        self.index.real(tile)
    }

    /// Whether the tile's mesh covers the whole tile footprint.
    pub fn fully_covered(&self, tile: TileId) -> bool {
        self.index.tile_index.get(tile) & TileFlags::WATERTIGHT.bits() != 0
    }

    /// Raw tile index flag word.
    pub fn tile_flags(&self, tile: TileId) -> u8 {
        self.index.tile_index.get(tile)
    }

    fn meta_origin(&self, tile: TileId) -> TileId {
        registry::meta_id(tile, self.reference_frame.meta_binary_order)
    }

    fn meta_path(&self, origin: TileId) -> PathBuf {
        self.root
            .join(crate::tile::as_filename(origin, TileFile::Meta, None))
    }

    fn write_metatile(&self, origin: TileId, meta: &MetaTile) -> Result<()> {
        let mut buffer = Vec::new();
        meta.save(&mut buffer)?;
        let mut sink = self
            .driver
            .borrow_mut()
            .output_tile(origin, TileFile::Meta)?;
        sink.write(&buffer);
        sink.close()
    }

    /// Make sure the metatile at `origin` is cached; `create` allows
    /// materializing a fresh one. Returns whether it exists afterwards.
    fn ensure_metatile(&self, origin: TileId, create: bool) -> Result<bool> {
        if self.metacache.borrow().contains(origin) {
            return Ok(true);
        }

        let loaded = {
            let source = self.driver.borrow_mut().input_tile(origin, TileFile::Meta);
            match source {
                Ok(source) => Some(MetaTile::load(
                    &mut source.bytes(),
                    self.reference_frame.meta_binary_order,
                    &self.meta_path(origin),
                )?),
                Err(TileStoreError::NoSuchTile(_)) => None,
                Err(e) => return Err(e),
            }
        };

        let (meta, exists) = match loaded {
            Some(meta) => (meta, true),
            None if create => (
                MetaTile::new(origin, self.reference_frame.meta_binary_order),
                true,
            ),
            None => return Ok(false),
        };

        let evicted = self.metacache.borrow_mut().insert(origin, meta, false);
        if let Some((id, victim)) = evicted {
            self.write_metatile(id, &victim)?;
        }
        Ok(exists)
    }

    /// Metadata record of one tile; virtual parent nodes included.
    pub fn get_meta_node(&self, tile: TileId) -> Result<MetaNode> {
        let origin = self.meta_origin(tile);
        if !self.ensure_metatile(origin, false)? {
            return Err(TileStoreError::NoSuchTile(tile.to_string()));
        }
        self.metacache
            .borrow_mut()
            .get(origin)
            .and_then(|meta| meta.get(tile).cloned())
            .ok_or_else(|| TileStoreError::NoSuchTile(tile.to_string()))
    }

    /// Whole metatile containing `tile`.
    pub fn get_meta_tile(&self, tile: TileId) -> Result<MetaTile> {
        let origin = self.meta_origin(tile);
        if !self.ensure_metatile(origin, false)? {
            return Err(TileStoreError::NoSuchTile(format!("metatile {origin}")));
        }
        self.metacache
            .borrow_mut()
            .get(origin)
            .cloned()
            .ok_or_else(|| TileStoreError::NoSuchTile(format!("metatile {origin}")))
    }

    /// Read one tile's content.
    pub fn get_tile(&self, tile: TileId) -> Result<Tile> {
        if !self.exists(tile) {
            return Err(TileStoreError::NoSuchTile(tile.to_string()));
        }
        let flags = self.index.tile_index.get(tile);
        let mut driver = self.driver.borrow_mut();

        let mesh = if flags & TileFlags::MESH.bits() != 0 {
            let source = driver.input_tile(tile, TileFile::Mesh)?;
            Some(Mesh::load(source.bytes(), Path::new(source.name()))?)
        } else {
            None
        };
        let atlas = if flags & TileFlags::ATLAS.bits() != 0 {
            let source = driver.input_tile(tile, TileFile::Atlas)?;
            Some(RawAtlas::load(source.bytes(), Path::new(source.name()))?)
        } else {
            None
        };
        let navtile = if flags & TileFlags::NAVTILE.bits() != 0 {
            let source = driver.input_tile(tile, TileFile::Navtile)?;
            Some(NavTile::load(source.bytes(), Path::new(source.name()))?)
        } else {
            None
        };
        drop(driver);

        let credits = self
            .get_meta_node(tile)
            .map(|node| node.credits().clone())
            .unwrap_or_default();

        Ok(Tile {
            mesh,
            atlas,
            navtile,
            credits,
            alien: flags & TileFlags::ALIEN.bits() != 0,
        })
    }

    /// Raw payload stream, for paste and the aggregated view.
    pub fn input_tile(&self, tile: TileId, kind: TileFile) -> Result<crate::streams::DataSource> {
        self.driver.borrow_mut().input_tile(tile, kind)
    }

    /// Normalize physical extents into the reference frame's unit cube
    /// (the subtree root's spatial extents, the frame's vertical range).
    ///
    /// The same normalization applies at every lod, so parent nodes can
    /// merge child extents directly; only the stored precision is
    /// per-lod.
    fn normalized_extents(&self, tile: TileId, extents: &Extents3) -> Result<Extents3> {
        if !extents.is_valid() {
            return Ok(Extents3::zero());
        }
        let root = &self.reference_frame.subtree_root(tile)?.extents;
        let size = root.size();
        let (h0, h1) = self.reference_frame.height_range;
        let norm = |v: glam::DVec3| {
            glam::DVec3::new(
                ((v.x - root.ll.x) / size.x).clamp(0.0, 1.0),
                ((v.y - root.ll.y) / size.y).clamp(0.0, 1.0),
                ((v.z - h0) / (h1 - h0)).clamp(0.0, 1.0),
            )
        };
        Ok(Extents3::new(norm(extents.ll), norm(extents.ur)))
    }

    /// Texel size: `sqrt(meshArea / textureArea)`. Internally textured
    /// submeshes contribute their atlas image area, externally textured
    /// ones the bound layer's tile area.
    fn compute_texel_size(&self, mesh: &Mesh, atlas: Option<&RawAtlas>) -> Result<f64> {
        let (mesh_area, _) = mesh.area();
        let mut texture_area = 0.0;
        let mut atlas_image = 0usize;
        for sm in &mesh.submeshes {
            if sm.has_internal_texture() {
                if let Some(atlas) = atlas {
                    texture_area += atlas.area(atlas_image)? * sm.uv_area_scale;
                    atlas_image += 1;
                }
            } else if sm.has_external_texture() {
                let layer = Registry::system().bound_layer("world-ortho")?;
                texture_area += layer.tile_area() * sm.uv_area_scale;
            }
        }
        if texture_area <= 0.0 || mesh_area <= 0.0 {
            return Ok(0.0);
        }
        Ok((mesh_area / texture_area).sqrt())
    }

    /// Store one tile: payload streams plus derived metadata.
    pub fn set_tile(&mut self, tile: TileId, content: &Tile) -> Result<()> {
        self.check_writable()?;
        self.check_cancelled()?;

        let mesh = content.mesh.as_ref().filter(|m| !m.is_empty());
        if content.mesh.is_none() && content.atlas.is_some() {
            return Err(TileStoreError::InconsistentInput(format!(
                "tile {tile}: atlas without a mesh"
            )));
        }
        if content.mesh.is_none() && content.navtile.is_some() {
            return Err(TileStoreError::InconsistentInput(format!(
                "tile {tile}: navtile without a mesh"
            )));
        }
        if let (Some(mesh), Some(atlas)) = (&content.mesh, &content.atlas) {
            let textured = mesh
                .submeshes
                .iter()
                .filter(|sm| sm.has_internal_texture())
                .count();
            if textured != atlas.len() {
                return Err(TileStoreError::InconsistentInput(format!(
                    "tile {tile}: {textured} textured submeshes vs {} atlas images",
                    atlas.len()
                )));
            }
        }

        debug!(tile = %tile, "Writing tile");

        // payload streams first; metadata failure leaves them unreferenced
        if let Some(mesh) = &content.mesh {
            let data = mesh.save()?;
            let mut sink = self.driver.borrow_mut().output_tile(tile, TileFile::Mesh)?;
            sink.write(&data);
            sink.close()?;
        }
        if let Some(atlas) = &content.atlas {
            let data = atlas.save();
            let mut sink = self
                .driver
                .borrow_mut()
                .output_tile(tile, TileFile::Atlas)?;
            sink.write(&data);
            sink.close()?;
        }
        if let Some(navtile) = &content.navtile {
            let data = navtile.save()?;
            let mut sink = self
                .driver
                .borrow_mut()
                .output_tile(tile, TileFile::Navtile)?;
            sink.write(&data);
            sink.close()?;
        }

        // derive the metanode
        let node_info = NodeInfo::new(&self.reference_frame, tile)?;
        let mut node = MetaNode::default();
        if let Some(mesh) = mesh {
            node.set_geometry(true);
            node.set_internal_texture_count(
                content.atlas.as_ref().map(|a| a.len()).unwrap_or(0),
            )?;
            let physical = mesh.extents();
            node.extents = self.normalized_extents(tile, &physical)?;
            node.height_range = match &content.navtile {
                Some(navtile) => navtile.height_range(),
                None => (
                    physical.ll.z.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16,
                    physical.ur.z.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16,
                ),
            };
            let texel = self.compute_texel_size(mesh, content.atlas.as_ref())?;
            if texel > 0.0 {
                node.texel_size = texel as f32;
                node.set_flags(node.flags() | crate::meta::NodeFlags::APPLY_TEXEL_SIZE);
            }
        }
        node.set_navtile(content.navtile.is_some());
        node.add_credits(content.credits.iter().copied());

        // spatial division footprint
        self.properties
            .spatial_division_extents
            .entry(node_info.srs.clone())
            .and_modify(|e| *e = e.unite(&node_info.extents))
            .or_insert(node_info.extents);

        let mut flags = TileFlags::empty();
        if content.mesh.is_some() {
            flags |= TileFlags::MESH;
        }
        if content.atlas.is_some() {
            flags |= TileFlags::ATLAS;
        }
        if content.navtile.is_some() {
            flags |= TileFlags::NAVTILE;
        }
        if content.mesh.as_ref().is_some_and(|m| m.watertight()) {
            flags |= TileFlags::WATERTIGHT;
        }
        if content.alien {
            flags |= TileFlags::ALIEN;
        }

        self.update_node(tile, node, flags.bits())
    }

    /// Attach a navtile to a tile that already has geometry.
    pub fn set_nav_tile(&mut self, tile: TileId, navtile: &NavTile) -> Result<()> {
        self.check_writable()?;
        let mut node = self.get_meta_node(tile)?;
        if !node.geometry() {
            return Err(TileStoreError::NoSuchTile(format!(
                "tile {tile} has no geometry to attach a navtile to"
            )));
        }

        let data = navtile.save()?;
        let mut sink = self
            .driver
            .borrow_mut()
            .output_tile(tile, TileFile::Navtile)?;
        sink.write(&data);
        sink.close()?;

        node.set_navtile(true);
        node.height_range = navtile.height_range();
        let flags = self.index.tile_index.get(tile) | TileFlags::NAVTILE.bits();
        self.update_node(tile, node, flags)
    }

    /// Record a reference tile: no own content, points into the parent
    /// surface stack.
    pub fn add_reference(&mut self, tile: TileId, reference: u8) -> Result<()> {
        self.check_writable()?;
        if self.index.real(tile) {
            return Err(TileStoreError::InconsistentInput(format!(
                "tile {tile} has content, cannot become a reference tile"
            )));
        }
        let mut node = MetaNode::default();
        node.set_reference(reference)?;
        self.update_node(tile, node, TileFlags::REFERENCE.bits())
    }

    /// Write a metanode and update metadata up the tree: the tile-index
    /// word, the reference index, and every ancestor's child flags and
    /// geometry extents.
    pub fn update_node(&mut self, tile: TileId, node: MetaNode, flags: u8) -> Result<()> {
        let origin = self.meta_origin(tile);
        self.ensure_metatile(origin, true)?;
        {
            let mut cache = self.metacache.borrow_mut();
            let meta = cache.get_mut(origin).expect("metatile ensured above");
            meta.set(tile, node.clone())?;
        }

        let masked = flags
            & (TileFlags::CONTENT | TileFlags::NONMETA | TileFlags::REFERENCE | TileFlags::ALIEN)
                .bits();
        self.index.tile_index.set(tile, masked);
        if node.reference() != 0 {
            self.index.references.set(tile, node.reference());
        }
        self.metadata_changed = true;

        // ascend: reconstruct parents from the in-memory metatile grid
        let mut child = tile;
        let mut child_extents = node.extents;
        while child.lod > 0 {
            let parent_id = parent(child, 1);
            let parent_origin = self.meta_origin(parent_id);
            self.ensure_metatile(parent_origin, true)?;

            let mut cache = self.metacache.borrow_mut();
            let meta = cache.get_mut(parent_origin).expect("metatile ensured above");
            let mut parent_node = meta.get(parent_id).cloned().unwrap_or_default();
            parent_node.set_child_from_id(child, true);
            parent_node.extents = parent_node.extents.merge(&child_extents);
            meta.set(parent_id, parent_node.clone())?;
            drop(cache);

            child_extents = parent_node.extents;
            child = parent_id;
        }
        Ok(())
    }

    /// Persist all dirty state: metatiles, tile index, config.
    ///
    /// A failure mid-flush leaves the tileset read-only; the caller must
    /// discard it.
    pub fn flush(&mut self) -> Result<()> {
        self.check_writable()?;
        let result = self.flush_inner();
        if result.is_err() {
            self.read_only = true;
        }
        result
    }

    fn flush_inner(&mut self) -> Result<()> {
        // refresh aggregate ranges
        let (lod_range, tile_range) = self.index.tile_index.ranges(TileFlags::REAL.bits());
        self.properties.lod_range = lod_range;
        self.properties.tile_range = tile_range;

        let mut metatiles = 0;
        if self.metadata_changed {
            let dirty = self.metacache.borrow_mut().take_dirty();
            metatiles = dirty.len();
            for (origin, meta) in dirty {
                self.write_metatile(origin, &meta)?;
            }

            let mut buffer = Vec::new();
            self.index.save(&mut buffer)?;
            let mut sink = self.driver.borrow().output_file(File::TileIndex)?;
            sink.write(&buffer);
            sink.close()?;
        }

        let json = config::save_config(&self.properties)?;
        let mut sink = self.driver.borrow().output_file(File::Config)?;
        sink.write(json.as_bytes());
        sink.close()?;

        self.driver.borrow_mut().flush()?;
        self.metadata_changed = false;

        info!(id = %self.properties.id, metatiles, "Flushed tileset");
        Ok(())
    }

    /// Copy tiles from `src` without recoding; metanode values are copied
    /// verbatim.
    pub fn paste(&mut self, src: &TileSet, lod_range: Option<LodRange>) -> Result<()> {
        self.check_writable()?;
        if src.properties.reference_frame != self.properties.reference_frame {
            return Err(TileStoreError::IncompatibleTileSet(format!(
                "cannot paste <{}> ({}) into <{}> ({})",
                src.properties.id,
                src.properties.reference_frame,
                self.properties.id,
                self.properties.reference_frame
            )));
        }

        let mut tiles = Vec::new();
        src.index.tile_index.for_each(|tile, flags| {
            if flags & TileFlags::REAL.bits() == 0 {
                return;
            }
            if let Some(range) = &lod_range {
                if !range.contains(tile.lod) {
                    return;
                }
            }
            tiles.push((tile, flags));
        });

        info!(from = %src.properties.id, into = %self.properties.id, tiles = tiles.len(),
            "Pasting tiles");

        for (tile, flags) in tiles {
            self.check_cancelled()?;

            for (bit, kind) in [
                (TileFlags::MESH, TileFile::Mesh),
                (TileFlags::ATLAS, TileFile::Atlas),
                (TileFlags::NAVTILE, TileFile::Navtile),
            ] {
                if flags & bit.bits() == 0 {
                    continue;
                }
                let data = src.input_tile(tile, kind)?.read_all();
                let mut sink = self.driver.borrow_mut().output_tile(tile, kind)?;
                sink.write(&data);
                sink.close()?;
            }

            let node = src.get_meta_node(tile)?;
            self.update_node(tile, node, flags)?;

            // spatial footprint travels with the tiles
            let node_info = NodeInfo::new(&self.reference_frame, tile)?;
            self.properties
                .spatial_division_extents
                .entry(node_info.srs.clone())
                .and_modify(|e| *e = e.unite(&node_info.extents))
                .or_insert(node_info.extents);
        }
        Ok(())
    }

    /// Client-facing configuration of this single tileset.
    pub fn map_config(&self) -> MapConfig {
        MapConfig {
            reference_frame: self.properties.reference_frame.clone(),
            srs: Registry::system()
                .srs_ids(&self.reference_frame),
            surfaces: vec![config::surface_config(&self.properties, &self.root)],
            glues: Vec::new(),
            virtual_surfaces: Vec::new(),
            credits: self.properties.credits.clone(),
            bound_layers: self.properties.bound_layers.clone(),
            position: self.properties.position,
        }
    }

    /// Replace stored properties (position, credits and the like).
    pub fn set_properties(&mut self, properties: TileSetProperties) -> Result<()> {
        self.check_writable()?;
        self.properties = properties;
        Ok(())
    }

    pub fn set_position(&mut self, position: [f64; 3]) -> Result<()> {
        self.check_writable()?;
        self.properties.position = position;
        Ok(())
    }

    pub fn externally_changed(&self) -> bool {
        self.driver.borrow().externally_changed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::solid_jpeg;
    use crate::mesh::SubMesh;
    use glam::{DVec2, DVec3};

    fn properties(id: &str) -> TileSetProperties {
        TileSetProperties::new(id, "melown2015")
    }

    /// A small textured mesh inside the melown2015 root extents.
    pub(crate) fn sample_tile(height: f64) -> Tile {
        let submesh = SubMesh {
            vertices: vec![
                DVec3::new(0.0, 0.0, height),
                DVec3::new(1000.0, 0.0, height),
                DVec3::new(1000.0, 1000.0, height + 50.0),
                DVec3::new(0.0, 1000.0, height),
            ],
            tc: vec![
                DVec2::new(0.0, 0.0),
                DVec2::new(1.0, 0.0),
                DVec2::new(1.0, 1.0),
                DVec2::new(0.0, 1.0),
            ],
            faces: vec![[0, 1, 2], [0, 2, 3]],
            faces_tc: vec![[0, 1, 2], [0, 2, 3]],
            ..Default::default()
        };
        let mut mesh = Mesh::default();
        mesh.add(submesh);

        let mut atlas = RawAtlas::new();
        atlas.add(solid_jpeg(64, 64, 100));

        Tile {
            mesh: Some(mesh),
            atlas: Some(atlas),
            navtile: None,
            credits: [42u16].into_iter().collect(),
            alien: false,
        }
    }

    #[test]
    fn create_open_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts");

        create_tile_set(&path, &properties("hills"), CreateMode::FailIfExists).unwrap();
        assert!(matches!(
            create_tile_set(&path, &properties("hills"), CreateMode::FailIfExists),
            Err(TileStoreError::StorageAlreadyExists(_))
        ));

        // overwrite bumps the revision
        let ts = create_tile_set(&path, &properties("hills"), CreateMode::Overwrite).unwrap();
        assert_eq!(ts.properties().revision, 1);

        let ts = open_tile_set(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(ts.id(), "hills");
        assert!(ts.is_read_only());
        assert!(!ts.exists(TileId::new(3, 4, 5)));
    }

    #[test]
    fn set_and_get_tile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts");
        let mut ts =
            create_tile_set(&path, &properties("hills"), CreateMode::FailIfExists).unwrap();

        let tile = TileId::new(3, 4, 5);
        ts.set_tile(tile, &sample_tile(100.0)).unwrap();
        assert!(ts.exists(tile));
        assert!(ts.fully_covered(tile));

        let back = ts.get_tile(tile).unwrap();
        assert!(back.mesh.is_some());
        assert!(back.atlas.is_some());
        assert_eq!(back.credits.iter().copied().collect::<Vec<_>>(), vec![42]);

        let node = ts.get_meta_node(tile).unwrap();
        assert!(node.geometry());
        assert_eq!(node.internal_texture_count(), 1);
        assert_eq!(node.height_range, (100, 150));

        assert!(matches!(
            ts.get_tile(TileId::new(3, 0, 0)),
            Err(TileStoreError::NoSuchTile(_))
        ));
    }

    #[test]
    fn metadata_propagates_to_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts");
        let mut ts =
            create_tile_set(&path, &properties("hills"), CreateMode::FailIfExists).unwrap();

        let tile = TileId::new(3, 4, 5);
        ts.set_tile(tile, &sample_tile(0.0)).unwrap();
        ts.flush().unwrap();

        // parent chain carries child flags up to the root
        let parent_node = ts.get_meta_node(TileId::new(2, 2, 2)).unwrap();
        assert!(!parent_node.real());
        assert!(parent_node.has_child(crate::tile::child_index(tile)));
        assert!(!parent_node.extents.is_degenerate());

        let root_node = ts.get_meta_node(TileId::new(0, 0, 0)).unwrap();
        assert!(root_node.child_flags().bits() != 0);
    }

    #[test]
    fn flush_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts");
        let tile = TileId::new(3, 4, 5);
        {
            let mut ts =
                create_tile_set(&path, &properties("hills"), CreateMode::FailIfExists).unwrap();
            ts.set_tile(tile, &sample_tile(7.0)).unwrap();
            ts.flush().unwrap();
        }

        let ts = open_tile_set(&path, OpenMode::ReadOnly).unwrap();
        assert!(ts.exists(tile));
        assert_eq!(ts.lod_range(), LodRange::new(3, 3));
        assert_eq!(ts.properties().tile_range, TileRange::new(4, 5, 4, 5));

        let node = ts.get_meta_node(tile).unwrap();
        assert!(node.geometry());
        assert_eq!(node.credits().iter().copied().collect::<Vec<_>>(), vec![42]);

        let tile_back = ts.get_tile(tile).unwrap();
        assert_eq!(tile_back.mesh.unwrap().submeshes.len(), 1);
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts");
        create_tile_set(&path, &properties("hills"), CreateMode::FailIfExists).unwrap();

        let mut ts = open_tile_set(&path, OpenMode::ReadOnly).unwrap();
        assert!(matches!(
            ts.set_tile(TileId::new(1, 0, 0), &sample_tile(0.0)),
            Err(TileStoreError::ReadOnly(_))
        ));
        assert!(matches!(ts.flush(), Err(TileStoreError::ReadOnly(_))));
    }

    #[test]
    fn inconsistent_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts");
        let mut ts =
            create_tile_set(&path, &properties("hills"), CreateMode::FailIfExists).unwrap();

        // atlas without mesh
        let mut atlas_only = Tile::default();
        let mut atlas = RawAtlas::new();
        atlas.add(solid_jpeg(4, 4, 1));
        atlas_only.atlas = Some(atlas);
        assert!(matches!(
            ts.set_tile(TileId::new(1, 0, 0), &atlas_only),
            Err(TileStoreError::InconsistentInput(_))
        ));

        // atlas image count mismatch
        let mut bad = sample_tile(0.0);
        bad.atlas.as_mut().unwrap().add(solid_jpeg(4, 4, 2));
        assert!(matches!(
            ts.set_tile(TileId::new(1, 0, 0), &bad),
            Err(TileStoreError::InconsistentInput(_))
        ));
    }

    #[test]
    fn navtile_requires_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts");
        let mut ts =
            create_tile_set(&path, &properties("hills"), CreateMode::FailIfExists).unwrap();

        assert!(ts
            .set_nav_tile(TileId::new(2, 1, 1), &NavTile::flat(5))
            .is_err());

        let tile = TileId::new(2, 1, 1);
        ts.set_tile(tile, &sample_tile(0.0)).unwrap();
        ts.set_nav_tile(tile, &NavTile::flat(5)).unwrap();

        let node = ts.get_meta_node(tile).unwrap();
        assert!(node.navtile());
        assert_eq!(node.height_range, (5, 5));

        let back = ts.get_tile(tile).unwrap();
        assert_eq!(back.navtile.unwrap().height_range(), (5, 5));
    }

    #[test]
    fn paste_copies_tiles_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut src =
            create_tile_set(&dir.path().join("src"), &properties("src"), CreateMode::FailIfExists)
                .unwrap();
        src.set_tile(TileId::new(3, 4, 5), &sample_tile(10.0)).unwrap();
        src.set_tile(TileId::new(4, 8, 10), &sample_tile(20.0)).unwrap();
        src.flush().unwrap();

        let mut dst =
            create_tile_set(&dir.path().join("dst"), &properties("dst"), CreateMode::FailIfExists)
                .unwrap();
        dst.paste(&src, None).unwrap();
        dst.flush().unwrap();

        assert!(dst.exists(TileId::new(3, 4, 5)));
        assert!(dst.exists(TileId::new(4, 8, 10)));
        let node = dst.get_meta_node(TileId::new(3, 4, 5)).unwrap();
        assert_eq!(node.height_range, (10, 60));

        // lod filter
        let mut partial = create_tile_set(
            &dir.path().join("partial"),
            &properties("partial"),
            CreateMode::FailIfExists,
        )
        .unwrap();
        partial.paste(&src, Some(LodRange::new(4, 4))).unwrap();
        assert!(!partial.exists(TileId::new(3, 4, 5)));
        assert!(partial.exists(TileId::new(4, 8, 10)));
    }

    #[test]
    fn clone_produces_equal_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut src =
            create_tile_set(&dir.path().join("src"), &properties("src"), CreateMode::FailIfExists)
                .unwrap();
        src.set_tile(TileId::new(3, 4, 5), &sample_tile(10.0)).unwrap();
        src.flush().unwrap();

        let options = CloneOptions {
            tileset_id: Some("copy".into()),
            lod_range: None,
        };
        let copy = clone_tile_set(&dir.path().join("copy"), &src, &options).unwrap();
        assert_eq!(copy.id(), "copy");
        assert!(copy.exists(TileId::new(3, 4, 5)));

        let reopened = open_tile_set(&dir.path().join("copy"), OpenMode::ReadOnly).unwrap();
        assert!(reopened.exists(TileId::new(3, 4, 5)));
    }

    #[test]
    fn cancellation_interrupts_paste() {
        let dir = tempfile::tempdir().unwrap();
        let mut src =
            create_tile_set(&dir.path().join("src"), &properties("src"), CreateMode::FailIfExists)
                .unwrap();
        src.set_tile(TileId::new(3, 4, 5), &sample_tile(10.0)).unwrap();
        src.flush().unwrap();

        let mut dst =
            create_tile_set(&dir.path().join("dst"), &properties("dst"), CreateMode::FailIfExists)
                .unwrap();
        let token = CancelToken::new();
        dst.watch(token.clone());
        token.cancel();
        assert!(matches!(
            dst.paste(&src, None),
            Err(TileStoreError::Interrupted)
        ));
    }
}
