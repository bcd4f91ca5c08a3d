//! Tileset properties and the `tileset.conf` JSON codec, plus the
//! plain-data map configuration emitted for clients.
//!
//! Serializers live here and only here; they never reach back into
//! tileset internals.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TileStoreError};
use crate::math::Extents2;
use crate::tile::{Lod, LodRange, TileRange};

/// Current `tileset.conf` format version.
pub const CONFIG_VERSION: u32 = 1024;

/// Options of the plain (tilar-backed) driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainOptions {
    /// Archives hold a `2^binaryOrder` square of tiles.
    pub binary_order: u8,
    /// Unused least-significant metatile id bits (the metatile blocking
    /// order).
    pub meta_unused_bits: u8,
    pub uuid: Uuid,
}

impl PlainOptions {
    pub fn new(binary_order: u8, meta_unused_bits: u8) -> Self {
        PlainOptions {
            binary_order,
            meta_unused_bits,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn tile_mask(&self) -> u32 {
        (1u32 << self.binary_order) - 1
    }
}

/// Options of the aggregated (storage union) driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedOptions {
    pub storage_path: PathBuf,
    pub tilesets: BTreeSet<String>,
    /// Keep per-tile surface references in synthesized metatiles.
    #[serde(default)]
    pub surface_references: bool,
}

/// Options of the remote (HTTP) driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOptions {
    pub url: String,
    /// Retry count; negative retries indefinitely.
    #[serde(default = "default_tries")]
    pub tries: i32,
}

fn default_tries() -> i32 {
    3
}

/// Options of the local (filesystem alias) driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalOptions {
    pub path: PathBuf,
}

/// Driver selection stored in `tileset.conf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "camelCase")]
pub enum DriverOptions {
    Plain(PlainOptions),
    Aggregated(AggregatedOptions),
    Remote(RemoteOptions),
    Local(LocalOptions),
}

impl DriverOptions {
    pub fn plain(binary_order: u8, meta_unused_bits: u8) -> Self {
        DriverOptions::Plain(PlainOptions::new(binary_order, meta_unused_bits))
    }
}

/// Complete persisted state of a tileset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileSetProperties {
    pub id: String,
    pub reference_frame: String,
    /// Bumped on every overwrite-create; pushes URLs through caches.
    pub revision: u32,
    pub driver: DriverOptions,
    #[serde(default)]
    pub credits: BTreeSet<u16>,
    #[serde(default)]
    pub bound_layers: BTreeSet<String>,
    #[serde(default)]
    pub position: [f64; 3],
    #[serde(default)]
    pub orientation: [f64; 3],
    #[serde(default = "default_texture_quality")]
    pub texture_quality: u8,
    #[serde(default)]
    pub texel_size: Option<f64>,
    #[serde(default)]
    pub vertical_adjustment: bool,
    /// Lods containing real tiles.
    pub lod_range: LodRange,
    /// Extents of real tiles at `lod_range.min`.
    pub tile_range: TileRange,
    /// Per-SRS 2D extents touched by the tileset.
    #[serde(default)]
    pub spatial_division_extents: BTreeMap<String, Extents2>,
    /// Hard bottom limit of the mergeable range.
    #[serde(default)]
    pub merge_bottom_lod: Option<Lod>,
}

fn default_texture_quality() -> u8 {
    85
}

impl TileSetProperties {
    pub fn new(id: impl Into<String>, reference_frame: impl Into<String>) -> Self {
        TileSetProperties {
            id: id.into(),
            reference_frame: reference_frame.into(),
            revision: 0,
            driver: DriverOptions::plain(5, 5),
            credits: BTreeSet::new(),
            bound_layers: BTreeSet::new(),
            position: [0.0; 3],
            orientation: [0.0; 3],
            texture_quality: 85,
            texel_size: None,
            vertical_adjustment: false,
            lod_range: LodRange::empty(),
            tile_range: TileRange::invalid(),
            spatial_division_extents: BTreeMap::new(),
            merge_bottom_lod: None,
        }
    }

    pub fn has_data(&self) -> bool {
        !self.lod_range.is_empty()
    }
}

/// The `tileset.conf` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigDocument {
    version: u32,
    has_data: bool,
    /// Tile file name templates, informative for clients.
    mesh_template: String,
    texture_template: String,
    meta_template: String,
    nav_template: String,
    #[serde(flatten)]
    properties: TileSetProperties,
}

/// Serialize properties into `tileset.conf` JSON.
pub fn save_config(properties: &TileSetProperties) -> Result<String> {
    let document = ConfigDocument {
        version: CONFIG_VERSION,
        has_data: properties.has_data(),
        mesh_template: "{lod}-{x}-{y}.bin".into(),
        texture_template: "{lod}-{x}-{y}.jpg".into(),
        meta_template: "{lod}-{x}-{y}.meta".into(),
        nav_template: "{lod}-{x}-{y}.nav".into(),
        properties: properties.clone(),
    };
    serde_json::to_string_pretty(&document)
        .map_err(|e| TileStoreError::Format(format!("cannot serialize tileset config: {e}")))
}

/// Parse `tileset.conf` JSON.
pub fn load_config(data: &str, path: &Path) -> Result<TileSetProperties> {
    let document: ConfigDocument = serde_json::from_str(data)
        .map_err(|e| TileStoreError::bad_file(path, format!("invalid tileset config: {e}")))?;
    if document.version > CONFIG_VERSION {
        return Err(TileStoreError::Version {
            path: path.to_path_buf(),
            version: document.version.min(u16::MAX as u32) as u16,
        });
    }
    Ok(document.properties)
}

/// One surface (tileset) entry of a map configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceConfig {
    pub id: String,
    pub revision: u32,
    pub lod_range: LodRange,
    pub tile_range: TileRange,
    pub root: PathBuf,
    pub mesh_template: String,
    pub texture_template: String,
    pub meta_template: String,
    pub nav_template: String,
}

/// One glue entry of a map configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlueConfig {
    pub id: Vec<String>,
    #[serde(flatten)]
    pub surface: SurfaceConfig,
}

/// Client-facing configuration: plain data, merged by the storage layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapConfig {
    pub reference_frame: String,
    pub srs: Vec<String>,
    pub surfaces: Vec<SurfaceConfig>,
    pub glues: Vec<GlueConfig>,
    pub virtual_surfaces: Vec<SurfaceConfig>,
    pub credits: BTreeSet<u16>,
    pub bound_layers: BTreeSet<String>,
    pub position: [f64; 3],
}

/// Surface entry for a tileset rooted at `root`.
pub fn surface_config(properties: &TileSetProperties, root: &Path) -> SurfaceConfig {
    let revision_suffix = format!(".r{}", properties.revision);
    SurfaceConfig {
        id: properties.id.clone(),
        revision: properties.revision,
        lod_range: properties.lod_range,
        tile_range: properties.tile_range,
        root: root.to_path_buf(),
        mesh_template: format!("{{lod}}-{{x}}-{{y}}.bin{revision_suffix}"),
        texture_template: format!("{{lod}}-{{x}}-{{y}}.jpg{revision_suffix}"),
        meta_template: format!("{{lod}}-{{x}}-{{y}}.meta{revision_suffix}"),
        nav_template: format!("{{lod}}-{{x}}-{{y}}.nav{revision_suffix}"),
    }
}
