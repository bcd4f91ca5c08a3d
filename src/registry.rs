//! Read-only reference-frame registry.
//!
//! The registry is the named interface to the external SRS/reference-frame
//! dictionary: it answers "which quad-tree does this planet use, what are a
//! node's spatial extents, how are metatiles blocked". Projection math
//! itself is out of scope; a node's spatial division extents are all the
//! core needs.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TileStoreError};
use crate::math::Extents2;
use crate::tile::{child_index, children, Lod, TileId};

/// A planet-scale tiling scheme: root quad-tree, SRS ids and the nodes
/// where subtrees are rooted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceFrame {
    pub id: String,
    pub description: String,
    /// Physical (output) SRS identifier.
    pub physical_srs: String,
    /// Metatile blocking: metatiles hold `2^meta_binary_order` tiles per
    /// edge.
    pub meta_binary_order: u8,
    /// Vertical range used to normalize metanode geometry extents.
    pub height_range: (f64, f64),
    /// Division nodes: subtree roots keyed by tile id.
    pub division: Vec<DivisionNode>,
}

/// One subtree root of the reference-frame division.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivisionNode {
    pub id: TileId,
    /// Spatial-division SRS of this subtree.
    pub srs: String,
    /// Spatial extents of the subtree root in its SRS.
    pub extents: Extents2,
}

impl ReferenceFrame {
    /// Subtree root governing `tile` (the deepest division node above it).
    pub fn subtree_root(&self, tile: TileId) -> Result<&DivisionNode> {
        self.division
            .iter()
            .filter(|node| {
                node.id.lod <= tile.lod
                    && crate::tile::parent(tile, tile.lod - node.id.lod) == node.id
            })
            .max_by_key(|node| node.id.lod)
            .ok_or_else(|| {
                TileStoreError::Key(format!(
                    "tile {tile} has no division node in reference frame <{}>",
                    self.id
                ))
            })
    }
}

/// Reference-frame node information: the tile, its spatial-division SRS and
/// extents, derived by subdividing from the governing subtree root.
#[derive(Debug, Clone)]
pub struct NodeInfo<'a> {
    pub reference_frame: &'a ReferenceFrame,
    pub tile: TileId,
    pub srs: String,
    pub extents: Extents2,
}

impl<'a> NodeInfo<'a> {
    /// Node info for an arbitrary tile.
    pub fn new(reference_frame: &'a ReferenceFrame, tile: TileId) -> Result<Self> {
        let root = reference_frame.subtree_root(tile)?;
        let mut extents = root.extents;
        // walk down from the subtree root, halving extents per level
        for lod in root.id.lod..tile.lod {
            let ancestor = crate::tile::parent(tile, tile.lod - lod - 1);
            extents = extents.quadrant(child_index(ancestor));
        }
        Ok(NodeInfo {
            reference_frame,
            tile,
            srs: root.srs.clone(),
            extents,
        })
    }

    /// Root node info.
    pub fn root(reference_frame: &'a ReferenceFrame) -> Result<Self> {
        NodeInfo::new(reference_frame, TileId::default())
    }

    /// Child node info; `index` uses tile child numbering.
    pub fn child(&self, index: usize) -> NodeInfo<'a> {
        NodeInfo {
            reference_frame: self.reference_frame,
            tile: children(self.tile)[index],
            srs: self.srs.clone(),
            extents: self.extents.quadrant(index),
        }
    }
}

/// A bound (external) texture layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundLayer {
    pub id: String,
    pub numeric_id: u16,
    /// Texture resolution of one tile edge in pixels.
    pub tile_size: u32,
}

impl BoundLayer {
    /// Texture area contributed by one externally textured tile.
    pub fn tile_area(&self) -> f64 {
        (self.tile_size as f64) * (self.tile_size as f64)
    }
}

/// The registry: reference frames and bound layers by id.
#[derive(Debug, Default)]
pub struct Registry {
    frames: BTreeMap<String, ReferenceFrame>,
    bound_layers: BTreeMap<String, BoundLayer>,
}

impl Registry {
    /// The built-in system registry.
    pub fn system() -> &'static Registry {
        static SYSTEM: OnceLock<Registry> = OnceLock::new();
        SYSTEM.get_or_init(|| {
            let mut registry = Registry::default();
            registry.add_frame(melown2015());
            registry.add_frame(earth_qsc());
            registry.add_bound_layer(BoundLayer {
                id: "world-ortho".into(),
                numeric_id: 1,
                tile_size: 256,
            });
            registry
        })
    }

    pub fn add_frame(&mut self, frame: ReferenceFrame) {
        self.frames.insert(frame.id.clone(), frame);
    }

    pub fn add_bound_layer(&mut self, layer: BoundLayer) {
        self.bound_layers.insert(layer.id.clone(), layer);
    }

    pub fn reference_frame(&self, id: &str) -> Result<&ReferenceFrame> {
        self.frames
            .get(id)
            .ok_or_else(|| TileStoreError::Key(format!("unknown reference frame <{id}>")))
    }

    pub fn bound_layer(&self, id: &str) -> Result<&BoundLayer> {
        self.bound_layers
            .get(id)
            .ok_or_else(|| TileStoreError::Key(format!("unknown bound layer <{id}>")))
    }

    pub fn srs_ids(&self, frame: &ReferenceFrame) -> Vec<String> {
        let mut ids: Vec<String> = frame.division.iter().map(|n| n.srs.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Quadrilateralized spherical cube frame.
fn earth_qsc() -> ReferenceFrame {
    ReferenceFrame {
        id: "earth-qsc".into(),
        description: "Earth, global, quadrilateralized spherical cube".into(),
        physical_srs: "geocentric".into(),
        meta_binary_order: 5,
        height_range: (-12_000.0, 12_000.0),
        division: vec![DivisionNode {
            id: TileId::default(),
            srs: "qsc-front".into(),
            extents: Extents2::new(-6_378_137.0, -6_378_137.0, 6_378_137.0, 6_378_137.0),
        }],
    }
}

/// The default planet-wide pseudo-mercator frame.
fn melown2015() -> ReferenceFrame {
    const WEBMERC: f64 = 20037508.342789244;
    ReferenceFrame {
        id: "melown2015".into(),
        description: "Earth, global, pseudo-mercator division".into(),
        physical_srs: "geocentric".into(),
        meta_binary_order: 5,
        height_range: (-12_000.0, 12_000.0),
        division: vec![DivisionNode {
            id: TileId::default(),
            srs: "pseudomerc".into(),
            extents: Extents2::new(-WEBMERC, -WEBMERC, WEBMERC, WEBMERC),
        }],
    }
}

/// Metatile id of the metatile containing `tile` (origin alignment).
pub fn meta_id(tile: TileId, meta_binary_order: u8) -> TileId {
    let mask = !((1u32 << meta_binary_order) - 1);
    TileId::new(tile.lod, tile.x & mask, tile.y & mask)
}

/// Range of lods, clamped so a metatile origin stays addressable.
pub fn meta_size(lod: Lod, meta_binary_order: u8) -> u32 {
    let tiles = crate::tile::tile_count(lod);
    (1u64 << meta_binary_order).min(tiles) as u32
}
