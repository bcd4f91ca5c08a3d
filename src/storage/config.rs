//! Storage properties and the `storage.conf` / `extra.conf` JSON codecs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TileStoreError};

/// Current `storage.conf` format version.
pub const CONFIG_VERSION: u32 = 1;

/// Info about one stored tileset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTileset {
    /// Unique id inside the storage (base id plus version suffix).
    pub tileset_id: String,
    /// Base identifier without the version.
    pub base_id: String,
    pub version: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// One registered glue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlueRecord {
    pub path: PathBuf,
}

/// One trashed tileset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashItem {
    /// Revision the tileset had when it was removed; re-adding under the
    /// same name continues from here.
    pub revision: u32,
}

/// One registered virtual surface (aggregated view).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualSurfaceRecord {
    pub path: PathBuf,
}

/// The persisted state of a storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProperties {
    pub reference_frame: String,
    /// Bumped on every `storage.conf` rewrite.
    pub revision: u32,
    /// Stacked order, bottom to top.
    pub tilesets: Vec<StoredTileset>,
    /// Glues keyed by comma-joined id.
    #[serde(default)]
    pub glues: BTreeMap<String, GlueRecord>,
    /// Virtual surfaces keyed by comma-joined id.
    #[serde(default)]
    pub virtual_surfaces: BTreeMap<String, VirtualSurfaceRecord>,
    /// Removed tilesets pending garbage collection.
    #[serde(default)]
    pub trash_bin: BTreeMap<String, TrashItem>,
}

impl StorageProperties {
    pub fn new(reference_frame: impl Into<String>) -> Self {
        StorageProperties {
            reference_frame: reference_frame.into(),
            revision: 0,
            tilesets: Vec::new(),
            glues: BTreeMap::new(),
            virtual_surfaces: BTreeMap::new(),
            trash_bin: BTreeMap::new(),
        }
    }

    pub fn find_tileset(&self, tileset_id: &str) -> Option<&StoredTileset> {
        self.tilesets.iter().find(|ts| ts.tileset_id == tileset_id)
    }

    pub fn has_tileset(&self, tileset_id: &str) -> bool {
        self.find_tileset(tileset_id).is_some()
    }

    /// Stack position of a tileset.
    pub fn tileset_position(&self, tileset_id: &str) -> Option<usize> {
        self.tilesets
            .iter()
            .position(|ts| ts.tileset_id == tileset_id)
    }
}

/// Encode a glue (or virtual surface) id as a config map key.
pub fn join_id(id: &[String]) -> String {
    id.join(",")
}

/// Decode a config map key back into an id list.
pub fn split_id(key: &str) -> Vec<String> {
    key.split(',').map(|s| s.to_string()).collect()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigDocument {
    version: u32,
    #[serde(flatten)]
    properties: StorageProperties,
}

pub fn save_config(properties: &StorageProperties) -> Result<String> {
    let document = ConfigDocument {
        version: CONFIG_VERSION,
        properties: properties.clone(),
    };
    serde_json::to_string_pretty(&document)
        .map_err(|e| TileStoreError::Format(format!("cannot serialize storage config: {e}")))
}

pub fn load_config(data: &str, path: &Path) -> Result<StorageProperties> {
    let document: ConfigDocument = serde_json::from_str(data)
        .map_err(|e| TileStoreError::bad_file(path, format!("invalid storage config: {e}")))?;
    if document.version > CONFIG_VERSION {
        return Err(TileStoreError::Version {
            path: path.to_path_buf(),
            version: document.version.min(u16::MAX as u32) as u16,
        });
    }
    Ok(document.properties)
}

/// Optional `extra.conf` overrides merged into the map configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtraProperties {
    pub position: Option<[f64; 3]>,
    pub credits: BTreeSet<u16>,
    pub bound_layers: BTreeSet<String>,
}

pub fn load_extra_config(data: &str, path: &Path) -> Result<ExtraProperties> {
    serde_json::from_str(data)
        .map_err(|e| TileStoreError::bad_file(path, format!("invalid extra config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut properties = StorageProperties::new("melown2015");
        properties.revision = 2;
        properties.tilesets.push(StoredTileset {
            tileset_id: "hills".into(),
            base_id: "hills".into(),
            version: 0,
            tags: ["lidar".to_string()].into_iter().collect(),
        });
        properties.glues.insert(
            "hills,city".into(),
            GlueRecord {
                path: "glues/hills/city".into(),
            },
        );
        properties
            .trash_bin
            .insert("old".into(), TrashItem { revision: 4 });

        let json = save_config(&properties).unwrap();
        let back = load_config(&json, Path::new("storage.conf")).unwrap();
        assert_eq!(properties, back);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], 1);
        assert!(value["glues"]["hills,city"]["path"].is_string());
    }

    #[test]
    fn id_key_roundtrip() {
        let id = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(join_id(&id), "a,b,c");
        assert_eq!(split_id("a,b,c"), id);
    }

    #[test]
    fn extra_config_defaults() {
        let extra = load_extra_config("{}", Path::new("extra.conf")).unwrap();
        assert_eq!(extra, ExtraProperties::default());

        let extra = load_extra_config(
            "{\"position\": [1.0, 2.0, 3.0], \"credits\": [42]}",
            Path::new("extra.conf"),
        )
        .unwrap();
        assert_eq!(extra.position, Some([1.0, 2.0, 3.0]));
        assert!(extra.credits.contains(&42));
    }
}
