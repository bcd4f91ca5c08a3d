//! Storage: an ordered stack of tilesets plus the glues that resolve
//! their overlap.
//!
//! `storage.conf` is the single source of truth for the stack and the
//! glue catalog. All mutating operations are read-modify-write cycles
//! over it, guarded by the user-supplied storage locker; glue builds
//! additionally take a per-glue sublock.

pub mod config;
pub mod gluerules;
pub mod locking;
pub mod paths;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{Result, TileStoreError};
use crate::index::{self, TileFlags, TileIndex};
use crate::tile::LodRange;
use crate::tileset::glue::{self, GlueEntry};
use crate::tileset::{
    self, clone_tile_set, create_tile_set, open_tile_set, CloneOptions, MapConfig, OpenMode,
    TileSet, TileSetProperties,
};

pub use config::{
    ExtraProperties, GlueRecord, StorageProperties, StoredTileset, TrashItem,
    VirtualSurfaceRecord,
};
pub use gluerules::GlueRule;
pub use locking::{ScopedLock, StorageLocker};

/// Creation behavior over an existing storage.
pub use crate::tileset::CreateMode;

/// Where to put an added tileset relative to the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    /// Anchor tileset; `None` anchors at the stack boundary.
    pub anchor: Option<String>,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Below,
    Above,
}

impl Location {
    /// Top of the stack.
    pub fn top() -> Self {
        Location {
            anchor: None,
            direction: Direction::Below,
        }
    }

    /// Bottom of the stack.
    pub fn bottom() -> Self {
        Location {
            anchor: None,
            direction: Direction::Above,
        }
    }

    pub fn above(anchor: impl Into<String>) -> Self {
        Location {
            anchor: Some(anchor.into()),
            direction: Direction::Above,
        }
    }

    pub fn below(anchor: impl Into<String>) -> Self {
        Location {
            anchor: Some(anchor.into()),
            direction: Direction::Below,
        }
    }
}

/// Options of [`Storage::add`] and glue generation.
#[derive(Clone, Default)]
pub struct AddOptions {
    /// On id collision, derive a fresh versioned id instead of failing.
    pub bump_version: bool,
    /// Tags attached to the added tileset.
    pub tags: BTreeSet<String>,
    /// Limit pasted content to these lods.
    pub filter: Option<LodRange>,
    /// Simulate without modifying anything.
    pub dry_run: bool,
    /// Allow overwriting an existing glue.
    pub overwrite: bool,
    /// External locking API.
    pub locker: Option<Arc<dyn StorageLocker>>,
}

/// An open storage.
pub struct Storage {
    root: PathBuf,
    properties: StorageProperties,
    read_only: bool,
}

/// Create a new storage directory tree.
pub fn create_storage(
    path: &Path,
    properties: &StorageProperties,
    mode: CreateMode,
) -> Result<Storage> {
    crate::registry::Registry::system().reference_frame(&properties.reference_frame)?;

    let config_path = paths::config_path(path);
    let mut properties = properties.clone();
    if config_path.exists() {
        match mode {
            CreateMode::FailIfExists => {
                return Err(TileStoreError::StorageAlreadyExists(path.to_path_buf()));
            }
            CreateMode::Overwrite => {
                if let Ok(data) = fs::read_to_string(&config_path) {
                    if let Ok(old) = config::load_config(&data, &config_path) {
                        properties.revision = old.revision + 1;
                    }
                }
            }
        }
    }

    fs::create_dir_all(path.join("tilesets"))?;
    fs::create_dir_all(path.join("glues"))?;

    let mut storage = Storage {
        root: path.to_path_buf(),
        properties,
        read_only: false,
    };
    storage.save_config()?;
    info!(path = %path.display(), "Created storage");
    Ok(storage)
}

/// Open an existing storage.
pub fn open_storage(path: &Path, mode: OpenMode) -> Result<Storage> {
    let config_path = paths::config_path(path);
    let data = fs::read_to_string(&config_path)
        .map_err(|_| TileStoreError::NoSuchTileSet(format!("storage {}", path.display())))?;
    let properties = config::load_config(&data, &config_path)?;
    Ok(Storage {
        root: path.to_path_buf(),
        properties,
        read_only: mode == OpenMode::ReadOnly,
    })
}

impl Storage {
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn properties(&self) -> &StorageProperties {
        &self.properties
    }

    pub fn reference_frame(&self) -> &str {
        &self.properties.reference_frame
    }

    /// Tileset ids in stack order, bottom to top.
    pub fn tilesets(&self) -> Vec<String> {
        self.properties
            .tilesets
            .iter()
            .map(|ts| ts.tileset_id.clone())
            .collect()
    }

    pub fn stored_tilesets(&self) -> &[StoredTileset] {
        &self.properties.tilesets
    }

    pub fn glues(&self) -> BTreeMap<Vec<String>, GlueRecord> {
        self.properties
            .glues
            .iter()
            .map(|(key, record)| (config::split_id(key), record.clone()))
            .collect()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(TileStoreError::ReadOnly(format!(
                "storage {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn save_config(&mut self) -> Result<()> {
        self.properties.revision += 1;
        let json = config::save_config(&self.properties)?;
        fs::write(paths::config_path(&self.root), json)?;
        Ok(())
    }

    /// Open one stored tileset read-only.
    pub fn open_tileset(&self, tileset_id: &str) -> Result<TileSet> {
        if !self.properties.has_tileset(tileset_id) {
            return Err(TileStoreError::NoSuchTileSet(format!(
                "tileset <{tileset_id}> not found in storage {}",
                self.root.display()
            )));
        }
        open_tile_set(
            &paths::tileset_path(&self.root, tileset_id),
            OpenMode::ReadOnly,
        )
    }

    /// Open one glue tileset read-only.
    pub fn open_glue(&self, glue_id: &[String]) -> Result<TileSet> {
        let key = config::join_id(glue_id);
        if !self.properties.glues.contains_key(&key) {
            return Err(TileStoreError::NoSuchTileSet(format!("glue <{key}>")));
        }
        open_tile_set(&paths::glue_path(&self.root, glue_id), OpenMode::ReadOnly)
    }

    /// Insert position for a location.
    fn resolve_location(&self, location: &Location) -> Result<usize> {
        Ok(match &location.anchor {
            None => match location.direction {
                Direction::Below => self.properties.tilesets.len(),
                Direction::Above => 0,
            },
            Some(anchor) => {
                let position = self
                    .properties
                    .tileset_position(anchor)
                    .ok_or_else(|| TileStoreError::NoSuchTileSet(anchor.clone()))?;
                match location.direction {
                    Direction::Below => position,
                    Direction::Above => position + 1,
                }
            }
        })
    }

    /// Add a tileset to the stack at `location`.
    ///
    /// The source is copied into the storage tree; no glue is generated
    /// (they become pending, see [`Storage::pending_glues`]).
    pub fn add(
        &mut self,
        tileset_path: &Path,
        location: &Location,
        tileset_id: Option<&str>,
        options: &AddOptions,
    ) -> Result<()> {
        self.check_writable()?;
        let _lock = ScopedLock::new(options.locker.as_ref(), "")?;

        let src = open_tile_set(tileset_path, OpenMode::ReadOnly)?;

        // nothing may change when the frames disagree
        if src.properties().reference_frame != self.properties.reference_frame {
            return Err(TileStoreError::IncompatibleTileSet(format!(
                "tileset <{}> uses reference frame <{}>, storage uses <{}>",
                src.id(),
                src.properties().reference_frame,
                self.properties.reference_frame
            )));
        }

        let base_id = tileset_id.unwrap_or(src.id()).to_string();
        let (stored_id, version) = if self.properties.has_tileset(&base_id) {
            if !options.bump_version {
                return Err(TileStoreError::InconsistentInput(format!(
                    "tileset <{base_id}> already present in the stack"
                )));
            }
            let version = self
                .properties
                .tilesets
                .iter()
                .filter(|ts| ts.base_id == base_id)
                .map(|ts| ts.version + 1)
                .max()
                .unwrap_or(1);
            (format!("{base_id}.{version}"), version)
        } else {
            (base_id.clone(), 0)
        };

        let position = self.resolve_location(location)?;

        if options.dry_run {
            info!(tileset = %stored_id, position, "Dry run: tileset would be added");
            return Ok(());
        }

        info!(tileset = %stored_id, position, "Adding tileset to storage");

        // copy the content into the storage tree
        let destination = paths::tileset_path(&self.root, &stored_id);
        let mut added = clone_tile_set(
            &destination,
            &src,
            &CloneOptions {
                tileset_id: Some(stored_id.clone()),
                lod_range: options.filter,
            },
        )?;

        // a re-added tileset continues its trashed revision chain
        if let Some(trashed) = self.properties.trash_bin.get(&stored_id) {
            let mut properties = added.properties().clone();
            properties.revision = trashed.revision + 1;
            added.set_properties(properties)?;
            added.flush()?;
        }

        self.properties.tilesets.insert(
            position,
            StoredTileset {
                tileset_id: stored_id.clone(),
                base_id,
                version,
                tags: options.tags.clone(),
            },
        );
        self.properties.trash_bin.remove(&stored_id);
        self.save_config()
    }

    /// Remove tilesets (into the trash bin) and every glue or virtual
    /// surface that references them.
    pub fn remove(
        &mut self,
        tileset_ids: &[String],
        locker: Option<&Arc<dyn StorageLocker>>,
    ) -> Result<()> {
        self.check_writable()?;
        let _lock = ScopedLock::new(locker, "")?;

        for tileset_id in tileset_ids {
            let position = self
                .properties
                .tileset_position(tileset_id)
                .ok_or_else(|| TileStoreError::NoSuchTileSet(tileset_id.clone()))?;
            self.properties.tilesets.remove(position);

            // record the revision so a re-add continues the chain
            let tileset_root = paths::tileset_path(&self.root, tileset_id);
            let revision = open_tile_set(&tileset_root, OpenMode::ReadOnly)
                .map(|ts| ts.properties().revision)
                .unwrap_or(0);
            self.properties
                .trash_bin
                .insert(tileset_id.clone(), TrashItem { revision });

            let trash = paths::trash_path(&self.root, tileset_id);
            if let Some(parent) = trash.parent() {
                fs::create_dir_all(parent)?;
            }
            if trash.exists() {
                fs::remove_dir_all(&trash)?;
            }
            if tileset_root.exists() {
                fs::rename(&tileset_root, &trash)?;
            }
            info!(tileset = %tileset_id, "Moved tileset to trash");
        }

        // cascade: drop glues and virtual surfaces referencing removed ids
        let referenced = |key: &str| {
            config::split_id(key)
                .iter()
                .any(|member| tileset_ids.contains(member))
        };
        let removed_glues: Vec<String> = self
            .properties
            .glues
            .keys()
            .filter(|key| referenced(key))
            .cloned()
            .collect();
        for key in removed_glues {
            if let Some(record) = self.properties.glues.remove(&key) {
                let path = self.root.join(&record.path);
                if path.exists() {
                    let _ = fs::remove_dir_all(&path);
                }
                info!(glue = %key, "Removed glue");
            }
        }
        let removed_surfaces: Vec<String> = self
            .properties
            .virtual_surfaces
            .keys()
            .filter(|key| referenced(key))
            .cloned()
            .collect();
        for key in removed_surfaces {
            if let Some(record) = self.properties.virtual_surfaces.remove(&key) {
                let path = self.root.join(&record.path);
                if path.exists() {
                    let _ = fs::remove_dir_all(&path);
                }
            }
        }

        self.save_config()
    }

    /// Footprint index of each stored tileset (sphere of influence of its
    /// mesh tiles), loaded in parallel.
    fn footprints(&self) -> Result<Vec<TileIndex>> {
        let range = self
            .properties
            .tilesets
            .iter()
            .map(|ts| {
                self.open_tileset(&ts.tileset_id)
                    .map(|t| t.properties().lod_range)
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .fold(LodRange::empty(), LodRange::unite);

        self.properties
            .tilesets
            .par_iter()
            .map(|ts| {
                let tileset = self.open_tileset(&ts.tileset_id)?;
                Ok(tileset
                    .tile_index()
                    .tile_index
                    .sphere_of_influence(range, TileFlags::MESH.bits()))
            })
            .collect()
    }

    /// Glue ids required by the overlap rules: subsequences of the stack
    /// (two or more members) whose footprints pairwise overlap and whose
    /// tags pass the glue rules.
    fn required_glues(&self) -> Result<BTreeSet<Vec<String>>> {
        let count = self.properties.tilesets.len();
        if count < 2 {
            return Ok(BTreeSet::new());
        }
        if count > 16 {
            warn!(
                tilesets = count,
                "glue discovery over a very deep stack; this enumerates all subsets"
            );
        }

        let footprints = self.footprints()?;
        let mut overlap = vec![vec![false; count]; count];
        for i in 0..count {
            for j in i + 1..count {
                let crossing = index::intersect(&footprints[i], &footprints[j]);
                overlap[i][j] = !crossing.is_empty();
                overlap[j][i] = overlap[i][j];
            }
        }

        let rules = self.load_glue_rules()?;
        let mut required = BTreeSet::new();
        for mask in 1u32..(1 << count) {
            if mask.count_ones() < 2 {
                continue;
            }
            let members: Vec<usize> = (0..count).filter(|i| mask & (1 << i) != 0).collect();
            let all_overlap = members
                .iter()
                .enumerate()
                .all(|(k, &i)| members[k + 1..].iter().all(|&j| overlap[i][j]));
            if !all_overlap {
                continue;
            }

            let stored: Vec<&StoredTileset> = members
                .iter()
                .map(|&i| &self.properties.tilesets[i])
                .collect();
            if !gluerules::check(&rules, &stored) {
                continue;
            }

            required.insert(
                members
                    .iter()
                    .map(|&i| self.properties.tilesets[i].tileset_id.clone())
                    .collect(),
            );
        }
        Ok(required)
    }

    fn load_glue_rules(&self) -> Result<Vec<GlueRule>> {
        let path = paths::glue_rules_path(&self.root);
        if !path.exists() {
            return Ok(Vec::new());
        }
        gluerules::parse_rules(&fs::read_to_string(&path)?)
    }

    /// Glues that should exist but whose tileset directory is absent.
    pub fn pending_glues(&self, tileset_id: Option<&str>) -> Result<BTreeSet<Vec<String>>> {
        let mut pending = BTreeSet::new();
        for id in self.required_glues()? {
            if let Some(filter) = tileset_id {
                if !id.iter().any(|member| member == filter) {
                    continue;
                }
            }
            let built = paths::glue_path(&self.root, &id)
                .join(tileset::File::Config.name())
                .exists();
            if !built {
                pending.insert(id);
            }
        }
        Ok(pending)
    }

    /// Build exactly one glue.
    pub fn generate_glue(&mut self, glue_id: &[String], options: &AddOptions) -> Result<()> {
        self.check_writable()?;
        let _storage_lock = ScopedLock::new(options.locker.as_ref(), "")?;

        let world = self.tilesets();
        glue::glue_indices(&world, glue_id)?;

        let key = config::join_id(glue_id);
        let path = paths::glue_path(&self.root, glue_id);
        if path.join(tileset::File::Config.name()).exists() && !options.overwrite {
            return Err(TileStoreError::StorageAlreadyExists(path));
        }

        if options.dry_run {
            info!(glue = %key, "Dry run: glue would be generated");
            return Ok(());
        }

        let _glue_lock = ScopedLock::new(options.locker.as_ref(), &key)?;
        info!(glue = %key, "Generating glue");

        let sources: Vec<TileSet> = glue_id
            .iter()
            .map(|member| self.open_tileset(member))
            .collect::<Result<_>>()?;
        let source_refs: Vec<&TileSet> = sources.iter().collect();

        let mut properties = TileSetProperties::new(&key, &self.properties.reference_frame);
        properties.driver = tileset::DriverOptions::plain(5, 5);
        let mode = if options.overwrite {
            CreateMode::Overwrite
        } else {
            CreateMode::FailIfExists
        };
        let mut glue_tileset = create_tile_set(&path, &properties, mode)?;
        glue::create_glue(&mut glue_tileset, &source_refs)?;
        glue_tileset.flush()?;

        let relative = path
            .strip_prefix(&self.root)
            .map(|p| p.to_path_buf())
            .unwrap_or(path.clone());
        self.properties
            .glues
            .insert(key, GlueRecord { path: relative });
        self.save_config()
    }

    /// Build every pending glue that references `tileset_id`.
    pub fn generate_glues(&mut self, tileset_id: &str, options: &AddOptions) -> Result<()> {
        let pending = self.pending_glues(Some(tileset_id))?;
        info!(tileset = %tileset_id, pending = pending.len(), "Generating pending glues");
        for id in pending {
            self.generate_glue(&id, options)?;
        }
        Ok(())
    }

    /// Register an aggregated read-only view over a subset of tilesets.
    pub fn create_virtual_surface(
        &mut self,
        tileset_ids: &[String],
        mode: CreateMode,
        locker: Option<&Arc<dyn StorageLocker>>,
    ) -> Result<()> {
        self.check_writable()?;
        let _lock = ScopedLock::new(locker, "")?;

        for member in tileset_ids {
            if !self.properties.has_tileset(member) {
                return Err(TileStoreError::NoSuchTileSet(member.clone()));
            }
        }

        let key = config::join_id(tileset_ids);
        let path = paths::virtual_surface_path(&self.root, tileset_ids);
        if self.properties.virtual_surfaces.contains_key(&key)
            && mode == CreateMode::FailIfExists
        {
            return Err(TileStoreError::StorageAlreadyExists(path));
        }

        let mut properties =
            TileSetProperties::new(key.clone(), &self.properties.reference_frame);
        properties.driver = tileset::DriverOptions::Aggregated(tileset::AggregatedOptions {
            storage_path: fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone()),
            tilesets: tileset_ids.iter().cloned().collect(),
            surface_references: true,
        });

        fs::create_dir_all(&path)?;
        let json = crate::tileset::config::save_config(&properties)?;
        fs::write(path.join(tileset::File::Config.name()), json)?;

        // validate: the aggregated driver must be able to assemble itself
        open_tile_set(&path, OpenMode::ReadOnly)?;

        let relative = path
            .strip_prefix(&self.root)
            .map(|p| p.to_path_buf())
            .unwrap_or(path.clone());
        self.properties
            .virtual_surfaces
            .insert(key, VirtualSurfaceRecord { path: relative });
        self.save_config()
    }

    /// Drop a registered virtual surface.
    pub fn remove_virtual_surface(
        &mut self,
        tileset_ids: &[String],
        locker: Option<&Arc<dyn StorageLocker>>,
    ) -> Result<()> {
        self.check_writable()?;
        let _lock = ScopedLock::new(locker, "")?;

        let key = config::join_id(tileset_ids);
        let record = self
            .properties
            .virtual_surfaces
            .remove(&key)
            .ok_or_else(|| TileStoreError::NoSuchTileSet(format!("virtual surface <{key}>")))?;
        let path = self.root.join(&record.path);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        self.save_config()
    }

    /// Change the tag set of a stored tileset.
    pub fn update_tags(
        &mut self,
        tileset_id: &str,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<()> {
        self.check_writable()?;
        let stored = self
            .properties
            .tilesets
            .iter_mut()
            .find(|ts| ts.tileset_id == tileset_id)
            .ok_or_else(|| TileStoreError::NoSuchTileSet(tileset_id.to_string()))?;
        stored.tags.extend(add.iter().cloned());
        stored.tags.retain(|tag| !remove.contains(tag));
        self.save_config()
    }

    /// Unified client-facing configuration: surfaces, glues, views,
    /// positions, credits and bound layers.
    pub fn map_config(&self) -> Result<MapConfig> {
        let frame = crate::registry::Registry::system()
            .reference_frame(&self.properties.reference_frame)?;

        let extra = {
            let path = paths::extra_config_path(&self.root);
            if path.exists() {
                config::load_extra_config(&fs::read_to_string(&path)?, &path)?
            } else {
                ExtraProperties::default()
            }
        };

        let mut map_config = MapConfig {
            reference_frame: self.properties.reference_frame.clone(),
            srs: crate::registry::Registry::system().srs_ids(frame),
            credits: extra.credits.clone(),
            bound_layers: extra.bound_layers.clone(),
            ..MapConfig::default()
        };

        // surfaces in stack order
        for stored in &self.properties.tilesets {
            let root = paths::tileset_path(&self.root, &stored.tileset_id);
            let config_path = root.join(tileset::File::Config.name());
            let properties = crate::tileset::config::load_config(
                &fs::read_to_string(&config_path)?,
                &config_path,
            )?;
            map_config.credits.extend(properties.credits.iter().copied());
            map_config
                .bound_layers
                .extend(properties.bound_layers.iter().cloned());
            map_config.surfaces.push(crate::tileset::config::surface_config(
                &properties,
                Path::new("tilesets").join(&stored.tileset_id).as_path(),
            ));
        }

        // glues grouped by their top surface, top of stack first, each
        // group in priority order
        let world = self.tilesets();
        for top in world.iter().rev() {
            let entries: Vec<GlueEntry> = self
                .properties
                .glues
                .keys()
                .map(|key| config::split_id(key))
                .filter(|id| id.last() == Some(top))
                .map(|id| {
                    let indices = glue::glue_indices(&world, &id)?;
                    Ok(GlueEntry { id, indices })
                })
                .collect::<Result<_>>()?;
            for entry in glue::glue_order(&world, entries) {
                let record = &self.properties.glues[&config::join_id(&entry.id)];
                let glue_root = self.root.join(&record.path);
                let config_path = glue_root.join(tileset::File::Config.name());
                let properties = crate::tileset::config::load_config(
                    &fs::read_to_string(&config_path)?,
                    &config_path,
                )?;
                map_config.glues.push(crate::tileset::config::GlueConfig {
                    id: entry.id.clone(),
                    surface: crate::tileset::config::surface_config(
                        &properties,
                        &record.path,
                    ),
                });
            }
        }

        // virtual surfaces
        for record in self.properties.virtual_surfaces.values() {
            let config_path = self
                .root
                .join(&record.path)
                .join(tileset::File::Config.name());
            let properties = crate::tileset::config::load_config(
                &fs::read_to_string(&config_path)?,
                &config_path,
            )?;
            map_config
                .virtual_surfaces
                .push(crate::tileset::config::surface_config(
                    &properties,
                    &record.path,
                ));
        }

        // position: extra override, else the top surface's
        map_config.position = match extra.position {
            Some(position) => position,
            None => match self.properties.tilesets.last() {
                Some(top) => {
                    let config_path = paths::tileset_path(&self.root, &top.tileset_id)
                        .join(tileset::File::Config.name());
                    crate::tileset::config::load_config(
                        &fs::read_to_string(&config_path)?,
                        &config_path,
                    )?
                    .position
                }
                None => [0.0; 3],
            },
        };

        Ok(map_config)
    }

    /// Whether a storage exists at `path`.
    pub fn check(path: &Path) -> bool {
        paths::config_path(path).exists()
    }
}
