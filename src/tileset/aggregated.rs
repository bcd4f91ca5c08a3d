//! Aggregated driver: a read-only union view over a storage's selected
//! tilesets and their glues, presented as one virtual tileset.
//!
//! Surfaces rank top of stack first, each top surface preceded by its
//! glues in priority order. Payload reads forward to the topmost surface
//! owning a real tile; metatiles are synthesized by merging the source
//! metatiles with surface-reference translation.

use tracing::debug;

use crate::error::{Result, TileStoreError};
use crate::index::{TileFlags, TileSetIndex};
use crate::meta::MetaTile;
use crate::registry::{self, Registry};
use crate::streams::DataSource;
use crate::tile::{TileFile, TileId};

use super::config::AggregatedOptions;
use super::glue::{glue_indices, glue_order, GlueEntry};
use super::{File, TileSet};

struct Surface {
    tileset: TileSet,
    /// Label for diagnostics.
    id: String,
    /// 1-based storage surface index this surface stands for.
    surface_index: u8,
    /// Glue-local surface index to 1-based storage surface index.
    indices: Vec<u8>,
}

/// The assembled read-only union.
pub struct AggregatedDriver {
    surfaces: Vec<Surface>,
    combined: TileSetIndex,
    meta_binary_order: u8,
    surface_references: bool,
}

impl AggregatedDriver {
    pub fn open(options: &AggregatedOptions) -> Result<AggregatedDriver> {
        let storage =
            crate::storage::open_storage(&options.storage_path, super::OpenMode::ReadOnly)?;

        // selection in stack order
        let world: Vec<String> = storage
            .tilesets()
            .into_iter()
            .filter(|id| options.tilesets.is_empty() || options.tilesets.contains(id))
            .collect();
        if world.is_empty() {
            return Err(TileStoreError::NoSuchTileSet(format!(
                "aggregated view over {} selects no tilesets",
                options.storage_path.display()
            )));
        }

        let glues = storage.glues();
        let mut surfaces = Vec::new();

        for (position, top) in world.iter().enumerate().rev() {
            // this surface's glues, best first
            let entries: Vec<GlueEntry> = glues
                .keys()
                .filter(|id| {
                    id.last() == Some(top) && id.iter().all(|member| world.contains(member))
                })
                .map(|id| {
                    let indices = glue_indices(&world, id)?;
                    Ok(GlueEntry {
                        id: id.clone(),
                        indices,
                    })
                })
                .collect::<Result<_>>()?;

            for entry in glue_order(&world, entries) {
                let tileset = storage.open_glue(&entry.id)?;
                surfaces.push(Surface {
                    tileset,
                    id: entry.id.join(","),
                    surface_index: (position + 1) as u8,
                    indices: entry.indices.iter().map(|i| (*i + 1) as u8).collect(),
                });
            }

            let tileset = storage.open_tileset(top)?;
            surfaces.push(Surface {
                tileset,
                id: top.clone(),
                surface_index: (position + 1) as u8,
                indices: vec![(position + 1) as u8],
            });
        }

        // synthesized tile index: the union of all source flag indices
        // (reference values are per-surface and resolve during metatile
        // synthesis instead)
        let mut combined = TileSetIndex::default();
        for surface in &surfaces {
            combined
                .tile_index
                .unite_with(&surface.tileset.tile_index().tile_index);
        }

        let frame = Registry::system().reference_frame(storage.reference_frame())?;

        debug!(
            surfaces = surfaces.len(),
            storage = %options.storage_path.display(),
            "Assembled aggregated view"
        );

        Ok(AggregatedDriver {
            surfaces,
            combined,
            meta_binary_order: frame.meta_binary_order,
            surface_references: options.surface_references,
        })
    }

    pub fn combined_index(&self) -> &TileSetIndex {
        &self.combined
    }

    /// The surface serving payloads of `tile`: topmost owner of a real
    /// tile with the requested content.
    fn owner(&self, tile: TileId, bit: TileFlags) -> Option<&Surface> {
        self.surfaces.iter().find(|surface| {
            let flags = surface.tileset.tile_flags(tile);
            flags & TileFlags::REAL.bits() != 0 && flags & bit.bits() != 0
        })
    }

    /// Merge all source metatiles at `origin` into one.
    fn synthesize_metatile(&self, origin: TileId) -> Result<MetaTile> {
        let mut out = MetaTile::new(origin, self.meta_binary_order);
        let size = out.size();
        let mut references = vec![0u8; (size * size) as usize];
        let mut found = false;

        for surface in &self.surfaces {
            let meta = match surface.tileset.get_meta_tile(origin) {
                Ok(meta) => meta,
                Err(TileStoreError::NoSuchTile(_)) => continue,
                Err(e) => return Err(e),
            };
            found = true;
            out.update_from(&meta, &mut references, surface.surface_index, &surface.indices)?;
        }

        if !found {
            return Err(TileStoreError::NoSuchTile(format!("metatile {origin}")));
        }

        if self.surface_references {
            // materialize collected references on nodes without content
            for (cell, &reference) in references.iter().enumerate() {
                if reference == 0 {
                    continue;
                }
                let tile = TileId::new(
                    origin.lod,
                    origin.x + (cell as u32 % size),
                    origin.y + (cell as u32 / size),
                );
                if let Some(node) = out.get_mut(tile) {
                    if !node.real() && node.reference() == 0 {
                        let _ = node.set_reference(reference);
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn input_tile(&self, tile: TileId, kind: TileFile) -> Result<DataSource> {
        match kind {
            TileFile::Meta => {
                let origin = registry::meta_id(tile, self.meta_binary_order);
                let meta = self.synthesize_metatile(origin)?;
                let mut buffer = Vec::new();
                meta.save(&mut buffer)?;
                Ok(DataSource::from_vec(
                    crate::tile::as_filename(origin, TileFile::Meta, None),
                    "application/octet-stream",
                    buffer,
                ))
            }
            TileFile::Mesh => self.forward(tile, kind, TileFlags::MESH),
            TileFile::Atlas => self.forward(tile, kind, TileFlags::ATLAS),
            TileFile::Navtile => self.forward(tile, kind, TileFlags::NAVTILE),
            other => Err(TileStoreError::Key(format!(
                "tile file {other:?} is not served by the aggregated driver"
            ))),
        }
    }

    fn forward(&self, tile: TileId, kind: TileFile, bit: TileFlags) -> Result<DataSource> {
        let surface = self.owner(tile, bit).ok_or_else(|| {
            TileStoreError::NoSuchTile(format!("{tile} ({kind:?}) in aggregated view"))
        })?;
        debug!(tile = %tile, surface = %surface.id, "Forwarding tile read");
        surface.tileset.input_tile(tile, kind)
    }

    pub fn input_file(&self, file: File) -> Result<DataSource> {
        match file {
            File::TileIndex => {
                let mut buffer = Vec::new();
                self.combined.save(&mut buffer)?;
                Ok(DataSource::from_vec(
                    file.name(),
                    "application/octet-stream",
                    buffer,
                ))
            }
            other => Err(TileStoreError::NoSuchTileSet(format!(
                "aggregated driver has no physical {}",
                other.name()
            ))),
        }
    }
}
