//! Metatile codec.
//!
//! A metatile is a `2^k x 2^k` block of per-tile metadata records
//! (metanodes) at one lod, persisted as a single file. Only the valid
//! sub-rectangle is encoded. Geometry extents are quantized to the lod
//! grid (`bits = lod + 2` per coordinate) and packed into a big-endian bit
//! stream; credits are stored once per metatile as per-credit cell
//! bitmaps.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::DVec3;
use half::f16;

use crate::error::{Result, TileStoreError};
use crate::math::Extents3;
use crate::tile::{child_index, Lod, TileId};

const MAGIC: &[u8; 2] = b"MT";
const VERSION: u16 = 1;

/// Geometry extents are quantized to at least this many bits.
const MIN_GEOM_BITS: u32 = 2;

/// Texel size is clamped to stay inside half-float range.
const MAX_TEXEL_SIZE: f32 = 65000.0;

bitflags::bitflags! {
    /// Metanode flag byte. Unknown bits round-trip verbatim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const GEOMETRY = 0x01;
        const NAVTILE = 0x02;
        const APPLY_TEXEL_SIZE = 0x04;
        const APPLY_DISPLAY_SIZE = 0x08;
        const UL_CHILD = 0x10;
        const UR_CHILD = 0x20;
        const LL_CHILD = 0x40;
        const LR_CHILD = 0x80;

        const CHILDREN = 0xf0;
    }
}

/// Per-tile metadata record.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaNode {
    flags: NodeFlags,
    /// Geometry bounding box, normalized to the tile's unit cube.
    pub extents: Extents3,
    /// Internal texture count when geometry is present, 1-based surface
    /// reference otherwise. The encoded byte is shared.
    texture_or_reference: u8,
    /// Projected texture resolution.
    pub texel_size: f32,
    /// LOD preference hint.
    pub display_size: u16,
    /// Min/max elevation.
    pub height_range: (i16, i16),
    credits: BTreeSet<u16>,
}

impl Default for MetaNode {
    fn default() -> Self {
        MetaNode {
            flags: NodeFlags::empty(),
            extents: Extents3::zero(),
            texture_or_reference: 0,
            texel_size: 0.0,
            display_size: 0,
            height_range: (0, 0),
            credits: BTreeSet::new(),
        }
    }
}

impl MetaNode {
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: NodeFlags) {
        self.flags = flags;
    }

    pub fn geometry(&self) -> bool {
        self.flags.contains(NodeFlags::GEOMETRY)
    }

    pub fn set_geometry(&mut self, value: bool) -> &mut Self {
        self.flags.set(NodeFlags::GEOMETRY, value);
        self
    }

    pub fn navtile(&self) -> bool {
        self.flags.contains(NodeFlags::NAVTILE)
    }

    pub fn set_navtile(&mut self, value: bool) -> &mut Self {
        self.flags.set(NodeFlags::NAVTILE, value);
        self
    }

    /// A real node carries its own geometry.
    pub fn real(&self) -> bool {
        self.geometry()
    }

    pub fn internal_texture_count(&self) -> u8 {
        if self.geometry() {
            self.texture_or_reference
        } else {
            0
        }
    }

    /// Set the internal texture count; requires geometry.
    pub fn set_internal_texture_count(&mut self, count: usize) -> Result<&mut Self> {
        if !self.geometry() {
            return Err(TileStoreError::InconsistentInput(
                "cannot set internal texture count on a tile without geometry".into(),
            ));
        }
        self.texture_or_reference = count.min(u8::MAX as usize) as u8;
        Ok(self)
    }

    /// 1-based surface reference; 0 when this is not a reference tile.
    pub fn reference(&self) -> u8 {
        if self.geometry() {
            0
        } else {
            self.texture_or_reference
        }
    }

    /// Turn the node into a reference tile; requires no geometry.
    pub fn set_reference(&mut self, reference: u8) -> Result<&mut Self> {
        if self.geometry() {
            return Err(TileStoreError::InconsistentInput(
                "cannot set reference on a tile with geometry".into(),
            ));
        }
        self.texture_or_reference = reference;
        Ok(self)
    }

    pub fn child_flags(&self) -> NodeFlags {
        self.flags & NodeFlags::CHILDREN
    }

    pub fn set_child_flags(&mut self, children: NodeFlags) {
        self.flags = (self.flags - NodeFlags::CHILDREN) | (children & NodeFlags::CHILDREN);
    }

    /// Set/clear the child bit selected by `child`'s position in its
    /// parent.
    pub fn set_child_from_id(&mut self, child: TileId, value: bool) -> &mut Self {
        let bit = NodeFlags::from_bits_retain(NodeFlags::UL_CHILD.bits() << child_index(child));
        self.flags.set(bit, value);
        self
    }

    pub fn has_child(&self, index: usize) -> bool {
        self.flags
            .contains(NodeFlags::from_bits_retain(NodeFlags::UL_CHILD.bits() << index))
    }

    /// Widen geometry extents to contain `other`'s, honoring the
    /// degenerate "no geometry" marker.
    pub fn merge_extents(&mut self, other: &MetaNode) -> &mut Self {
        self.extents = self.extents.merge(&other.extents);
        self
    }

    /// Replace content while keeping child flags intact.
    pub fn update(&mut self, other: &MetaNode) {
        let children = self.child_flags();
        *self = other.clone();
        self.set_child_flags(children);
    }

    pub fn credits(&self) -> &BTreeSet<u16> {
        &self.credits
    }

    pub fn add_credit(&mut self, credit: u16) -> &mut Self {
        self.credits.insert(credit);
        self
    }

    pub fn add_credits(&mut self, credits: impl IntoIterator<Item = u16>) -> &mut Self {
        self.credits.extend(credits);
        self
    }

    fn save(&self, out: &mut impl Write, lod: Lod) -> Result<()> {
        out.write_u8(self.flags.bits())?;
        out.write_all(&encode_geom_extents(lod, &self.extents))?;
        out.write_u8(self.texture_or_reference)?;

        let texel = self.texel_size.min(MAX_TEXEL_SIZE);
        out.write_u16::<LittleEndian>(f16::from_f32(texel).to_bits())?;
        out.write_u16::<LittleEndian>(self.display_size)?;
        out.write_i16::<LittleEndian>(self.height_range.0)?;
        out.write_i16::<LittleEndian>(self.height_range.1)?;
        Ok(())
    }

    fn load(input: &mut impl Read, lod: Lod, path: &Path) -> Result<MetaNode> {
        let flags = NodeFlags::from_bits_retain(input.read_u8()?);

        let mut block = vec![0u8; geom_len(lod)];
        input.read_exact(&mut block)?;
        let extents = decode_geom_extents(lod, &block);

        let texture_or_reference = input.read_u8()?;
        let texel_size = f16::from_bits(input.read_u16::<LittleEndian>()?).to_f32();
        let display_size = input.read_u16::<LittleEndian>()?;
        let height_min = input.read_i16::<LittleEndian>()?;
        let height_max = input.read_i16::<LittleEndian>()?;
        if height_min > height_max {
            return Err(TileStoreError::bad_file(
                path,
                format!("inconsistent height range ({height_min}, {height_max})"),
            ));
        }

        Ok(MetaNode {
            flags,
            extents,
            texture_or_reference,
            texel_size,
            display_size,
            height_range: (height_min, height_max),
            credits: BTreeSet::new(),
        })
    }
}

fn geom_bits(lod: Lod) -> u32 {
    lod as u32 + MIN_GEOM_BITS
}

/// Encoded geometry extents length in bytes: six values, bit-packed and
/// padded to a whole byte.
fn geom_len(lod: Lod) -> usize {
    ((6 * geom_bits(lod) as usize) + 7) / 8
}

fn encode_geom_extents(lod: Lod, extents: &Extents3) -> Vec<u8> {
    struct Encoder {
        block: Vec<u8>,
        bits: u32,
        max: u32,
        out_mask: u8,
    }

    impl Encoder {
        fn value(&mut self, value: f64, ceil: bool) {
            let value = value.clamp(0.0, 1.0);
            let scaled = value * self.max as f64;
            let index = if ceil { scaled.ceil() } else { scaled.floor() } as u32;
            let mut bit = 1u32 << (self.bits - 1);
            while bit != 0 {
                self.push(index & bit != 0);
                bit >>= 1;
            }
        }

        fn push(&mut self, value: bool) {
            if self.out_mask == 0 {
                self.block.push(0);
                self.out_mask = 0x80;
            }
            if value {
                *self.block.last_mut().unwrap() |= self.out_mask;
            }
            self.out_mask >>= 1;
        }
    }

    let bits = geom_bits(lod);
    let mut encoder = Encoder {
        block: vec![0],
        bits,
        max: (1u32 << bits) - 1,
        out_mask: 0x80,
    };

    encoder.value(extents.ll.x, false);
    encoder.value(extents.ur.x, true);
    encoder.value(extents.ll.y, false);
    encoder.value(extents.ur.y, true);
    encoder.value(extents.ll.z, false);
    encoder.value(extents.ur.z, true);

    encoder.block.resize(geom_len(lod), 0);
    encoder.block
}

fn decode_geom_extents(lod: Lod, block: &[u8]) -> Extents3 {
    struct Decoder<'a> {
        block: &'a [u8],
        bits: u32,
        max: f64,
        pos: usize,
        in_mask: u8,
    }

    impl Decoder<'_> {
        fn value(&mut self) -> f64 {
            let mut index = 0u32;
            let mut bit = 1u32 << (self.bits - 1);
            while bit != 0 {
                if self.pop() {
                    index |= bit;
                }
                bit >>= 1;
            }
            index as f64 / self.max
        }

        fn pop(&mut self) -> bool {
            if self.in_mask == 0 {
                self.pos += 1;
                self.in_mask = 0x80;
            }
            let value = self.block[self.pos] & self.in_mask != 0;
            self.in_mask >>= 1;
            value
        }
    }

    let bits = geom_bits(lod);
    let mut decoder = Decoder {
        block,
        bits,
        max: ((1u32 << bits) - 1) as f64,
        pos: 0,
        in_mask: 0x80,
    };

    let llx = decoder.value();
    let urx = decoder.value();
    let lly = decoder.value();
    let ury = decoder.value();
    let llz = decoder.value();
    let urz = decoder.value();

    Extents3::new(DVec3::new(llx, lly, llz), DVec3::new(urx, ury, urz))
}

fn node_size(lod: Lod) -> u8 {
    (1 // flags
        + geom_len(lod)
        + 1 // internalTextureCount/reference
        + 2 // texelSize
        + 2 // displaySize
        + 2 + 2) as u8 // height range
}

/// A `2^k x 2^k` block of metanodes at one lod.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaTile {
    origin: TileId,
    binary_order: u8,
    size: u32,
    /// Valid sub-rectangle in local coordinates, inclusive; only these
    /// nodes are persisted.
    valid: Option<(u32, u32, u32, u32)>,
    grid: Vec<MetaNode>,
}

impl MetaTile {
    /// Empty metatile anchored at `origin` (whose x/y must be multiples of
    /// `2^binary_order`).
    pub fn new(origin: TileId, binary_order: u8) -> Self {
        let size = 1u32 << binary_order;
        debug_assert!(origin.x % size == 0 && origin.y % size == 0);
        MetaTile {
            origin,
            binary_order,
            size,
            valid: None,
            grid: vec![MetaNode::default(); (size * size) as usize],
        }
    }

    pub fn origin(&self) -> TileId {
        self.origin
    }

    pub fn binary_order(&self) -> u8 {
        self.binary_order
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_none()
    }

    /// Local grid coordinates of `tile`, if it belongs to this metatile.
    fn grid_index(&self, tile: TileId) -> Option<(u32, u32)> {
        if self.origin.lod != tile.lod || tile.x < self.origin.x || tile.y < self.origin.y {
            return None;
        }
        let x = tile.x - self.origin.x;
        let y = tile.y - self.origin.y;
        if x >= self.size || y >= self.size {
            return None;
        }
        Some((x, y))
    }

    fn inside_valid(&self, x: u32, y: u32) -> bool {
        matches!(self.valid, Some((llx, lly, urx, ury))
            if x >= llx && x <= urx && y >= lly && y <= ury)
    }

    fn extend_valid(&mut self, x: u32, y: u32) {
        self.valid = Some(match self.valid {
            None => (x, y, x, y),
            Some((llx, lly, urx, ury)) => (llx.min(x), lly.min(y), urx.max(x), ury.max(y)),
        });
    }

    /// Store a node; extends the valid rectangle.
    pub fn set(&mut self, tile: TileId, node: MetaNode) -> Result<&MetaNode> {
        let (x, y) = self.grid_index(tile).ok_or_else(|| {
            TileStoreError::NoSuchTile(format!(
                "node {tile} not inside metatile {}",
                self.origin
            ))
        })?;
        self.extend_valid(x, y);
        let index = (y * self.size + x) as usize;
        self.grid[index] = node;
        Ok(&self.grid[index])
    }

    /// Node for `tile` when inside the valid rectangle.
    pub fn get(&self, tile: TileId) -> Option<&MetaNode> {
        let (x, y) = self.grid_index(tile)?;
        if !self.inside_valid(x, y) {
            return None;
        }
        Some(&self.grid[(y * self.size + x) as usize])
    }

    /// Mutable access to a stored node.
    pub fn get_mut(&mut self, tile: TileId) -> Option<&mut MetaNode> {
        let (x, y) = self.grid_index(tile)?;
        if !self.inside_valid(x, y) {
            return None;
        }
        Some(&mut self.grid[(y * self.size + x) as usize])
    }

    /// Replace a node's content, keeping its child flags.
    pub fn update(&mut self, tile: TileId, node: &MetaNode) -> Result<()> {
        let (x, y) = self.grid_index(tile).ok_or_else(|| {
            TileStoreError::NoSuchTile(format!(
                "node {tile} not inside metatile {}",
                self.origin
            ))
        })?;
        self.extend_valid(x, y);
        self.grid[(y * self.size + x) as usize].update(node);
        Ok(())
    }

    /// Visit every node in the valid rectangle.
    pub fn for_each(&self, mut op: impl FnMut(TileId, &MetaNode)) {
        let Some((llx, lly, urx, ury)) = self.valid else {
            return;
        };
        for y in lly..=ury {
            for x in llx..=urx {
                let tile = TileId::new(self.origin.lod, self.origin.x + x, self.origin.y + y);
                op(tile, &self.grid[(y * self.size + x) as usize]);
            }
        }
    }

    /// Merge another metatile of the same origin into this one, as the
    /// aggregated view does: real output nodes win, reference tiles
    /// translate through `indices` into storage surface indices, virtual
    /// nodes accumulate extents.
    pub fn update_from(
        &mut self,
        other: &MetaTile,
        references: &mut [u8],
        surface_index: u8,
        indices: &[u8],
    ) -> Result<()> {
        if self.origin != other.origin || self.binary_order != other.binary_order {
            return Err(TileStoreError::InconsistentInput(format!(
                "incompatible metatiles {} and {}",
                self.origin, other.origin
            )));
        }
        let Some((llx, lly, urx, ury)) = other.valid else {
            return Ok(());
        };
        for y in lly..=ury {
            for x in llx..=urx {
                let idx = (y * self.size + x) as usize;
                if self.grid[idx].real() {
                    continue;
                }
                let input = &other.grid[idx];

                let reference = input.reference();
                if reference != 0 {
                    if references[idx] == 0 {
                        let translated = indices
                            .get(reference as usize - 1)
                            .copied()
                            .unwrap_or(0)
                            .saturating_add(1);
                        references[idx] = translated;
                    }
                    continue;
                }

                let stored = references[idx];
                if stored != 0 && stored != surface_index {
                    continue;
                }

                self.extend_valid(x, y);
                if input.real() {
                    let mut node = input.clone();
                    node.set_child_flags(NodeFlags::empty());
                    self.grid[idx] = node;
                    continue;
                }
                self.grid[idx].merge_extents(input);
            }
        }
        Ok(())
    }

    pub fn save(&self, out: &mut impl Write) -> Result<()> {
        out.write_all(MAGIC)?;
        out.write_u16::<LittleEndian>(VERSION)?;

        out.write_u8(self.origin.lod)?;
        out.write_u32::<LittleEndian>(self.origin.x)?;
        out.write_u32::<LittleEndian>(self.origin.y)?;

        let (llx, lly, width, height) = match self.valid {
            Some((llx, lly, urx, ury)) => (llx, lly, urx - llx + 1, ury - lly + 1),
            None => (0, 0, 0, 0),
        };
        out.write_u16::<LittleEndian>(llx as u16)?;
        out.write_u16::<LittleEndian>(lly as u16)?;
        out.write_u16::<LittleEndian>(width as u16)?;
        out.write_u16::<LittleEndian>(height as u16)?;

        out.write_u8(node_size(self.origin.lod))?;

        // collect credits: map credit id -> cells of the valid rectangle
        let mut credits: BTreeMap<u16, Vec<usize>> = BTreeMap::new();
        if let Some((llx, lly, urx, ury)) = self.valid {
            let mut cell = 0usize;
            for y in lly..=ury {
                for x in llx..=urx {
                    let node = &self.grid[(y * self.size + x) as usize];
                    for &credit in node.credits() {
                        credits.entry(credit).or_default().push(cell);
                    }
                    cell += 1;
                }
            }
        }

        if credits.is_empty() || width == 0 {
            out.write_u8(0)?;
            out.write_u16::<LittleEndian>(0)?;
        } else {
            let bitmap_bytes = ((width * height) as usize + 7) / 8;
            out.write_u8(credits.len() as u8)?;
            out.write_u16::<LittleEndian>(bitmap_bytes as u16)?;
            for (credit, cells) in &credits {
                out.write_u16::<LittleEndian>(*credit)?;
                let mut bitmap = vec![0u8; bitmap_bytes];
                for &cell in cells {
                    bitmap[cell / 8] |= 0x80 >> (cell % 8);
                }
                out.write_all(&bitmap)?;
            }
        }

        if let Some((llx, lly, urx, ury)) = self.valid {
            for y in lly..=ury {
                for x in llx..=urx {
                    self.grid[(y * self.size + x) as usize].save(out, self.origin.lod)?;
                }
            }
        }
        Ok(())
    }

    pub fn load(input: &mut impl Read, binary_order: u8, path: &Path) -> Result<MetaTile> {
        let mut magic = [0u8; 2];
        input
            .read_exact(&mut magic)
            .map_err(|_| TileStoreError::bad_file(path, "file too short for a metatile"))?;
        if &magic != MAGIC {
            return Err(TileStoreError::bad_file(path, "not a metatile file"));
        }
        let version = input.read_u16::<LittleEndian>()?;
        if version > VERSION {
            return Err(TileStoreError::Version {
                path: path.to_path_buf(),
                version,
            });
        }

        let lod = input.read_u8()?;
        let x = input.read_u32::<LittleEndian>()?;
        let y = input.read_u32::<LittleEndian>()?;
        let origin = TileId::new(lod, x, y);

        let llx = input.read_u16::<LittleEndian>()? as u32;
        let lly = input.read_u16::<LittleEndian>()? as u32;
        let width = input.read_u16::<LittleEndian>()? as u32;
        let height = input.read_u16::<LittleEndian>()? as u32;

        let mut meta = MetaTile::new(origin, binary_order);
        if (width * height) as usize > meta.grid.len()
            || (width != 0 && (llx + width > meta.size || lly + height > meta.size))
        {
            return Err(TileStoreError::bad_file(
                path,
                format!("valid rectangle {width}x{height}+{llx}+{lly} exceeds metatile grid"),
            ));
        }

        let _node_size = input.read_u8()?;
        let credit_count = input.read_u8()?;
        let _credit_block_bytes = input.read_u16::<LittleEndian>()?;

        let mut credit_cells: Vec<(u16, Vec<u8>)> = Vec::new();
        if credit_count > 0 {
            let bitmap_bytes = ((width * height) as usize + 7) / 8;
            for _ in 0..credit_count {
                let credit = input.read_u16::<LittleEndian>()?;
                let mut bitmap = vec![0u8; bitmap_bytes];
                input.read_exact(&mut bitmap)?;
                credit_cells.push((credit, bitmap));
            }
        }

        if width == 0 || height == 0 {
            return Ok(meta);
        }
        meta.valid = Some((llx, lly, llx + width - 1, lly + height - 1));

        let mut cell = 0usize;
        for y in lly..lly + height {
            for x in llx..llx + width {
                let mut node = MetaNode::load(input, origin.lod, path)?;
                for (credit, bitmap) in &credit_cells {
                    if bitmap[cell / 8] & (0x80 >> (cell % 8)) != 0 {
                        node.add_credit(*credit);
                    }
                }
                meta.grid[(y * meta.size + x) as usize] = node;
                cell += 1;
            }
        }

        Ok(meta)
    }
}
