//! Storage directory layout.

use std::path::{Path, PathBuf};

/// `storage.conf` file.
pub fn config_path(root: &Path) -> PathBuf {
    root.join("storage.conf")
}

/// Optional `extra.conf` overrides.
pub fn extra_config_path(root: &Path) -> PathBuf {
    root.join("extra.conf")
}

/// Optional textual glue rules.
pub fn glue_rules_path(root: &Path) -> PathBuf {
    root.join("glue.rules")
}

/// Directory of one stored tileset.
pub fn tileset_path(root: &Path, tileset_id: &str) -> PathBuf {
    root.join("tilesets").join(tileset_id)
}

/// Directory of one glue: `glues/<id1>/<id2>/…/<idN>/`.
pub fn glue_path(root: &Path, glue_id: &[String]) -> PathBuf {
    let mut path = root.join("glues");
    for member in glue_id {
        path.push(member);
    }
    path
}

/// Directory of one virtual surface.
pub fn virtual_surface_path(root: &Path, id: &[String]) -> PathBuf {
    root.join("vs").join(id.join("_"))
}

/// Trash bin slot of a removed tileset.
pub fn trash_path(root: &Path, tileset_id: &str) -> PathBuf {
    root.join("trash").join(tileset_id)
}
