//! Tileset index: per-lod quad-tree rasters of tile flag words.
//!
//! A [`TileIndex`] is one list of flag masks indexed by lod. A tileset
//! persists two of them side by side in `tileset.index`: the flag index
//! (content bits per tile) and the reference index (1-based surface index
//! for reference tiles).

use std::io::{Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, TileStoreError};
use crate::rastermask::FlagMask;
use crate::tile::{Lod, LodRange, TileId, TileRange};

bitflags::bitflags! {
    /// Per-tile flag word stored in the flag index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TileFlags: u8 {
        const MESH = 0x01;
        const ATLAS = 0x02;
        const NAVTILE = 0x04;
        const WATERTIGHT = 0x08;
        const ALIEN = 0x10;
        const REFERENCE = 0x20;
        const NONMETA = 0x40;

        /// Tile content bits.
        const CONTENT = 0x0f;
        /// A real tile has a mesh or an atlas.
        const REAL = 0x03;
    }
}

const MAGIC: &[u8; 2] = b"TI";
const VERSION: u16 = 1;

/// List of per-lod flag masks over the quad-tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileIndex {
    min_lod: Lod,
    masks: Vec<FlagMask>,
}

impl TileIndex {
    /// Empty index with no lods at all.
    pub fn new() -> Self {
        TileIndex {
            min_lod: 0,
            masks: Vec::new(),
        }
    }

    /// Empty index covering `range`.
    pub fn with_range(range: LodRange) -> Self {
        if range.is_empty() {
            return TileIndex::new();
        }
        TileIndex {
            min_lod: range.min,
            masks: range.iter().map(FlagMask::empty).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty() || self.masks.iter().all(|m| m.is_empty())
    }

    pub fn min_lod(&self) -> Lod {
        self.min_lod
    }

    pub fn max_lod(&self) -> Lod {
        self.min_lod + self.masks.len().saturating_sub(1) as Lod
    }

    pub fn lod_range(&self) -> LodRange {
        if self.masks.is_empty() {
            LodRange::empty()
        } else {
            LodRange::new(self.min_lod, self.max_lod())
        }
    }

    /// Mask for `lod`; out-of-range lods are uniformly rejected.
    pub fn mask(&self, lod: Lod) -> Option<&FlagMask> {
        if self.masks.is_empty() || lod < self.min_lod || lod > self.max_lod() {
            return None;
        }
        Some(&self.masks[(lod - self.min_lod) as usize])
    }

    fn mask_mut(&mut self, lod: Lod) -> Option<&mut FlagMask> {
        if self.masks.is_empty() || lod < self.min_lod || lod > self.max_lod() {
            return None;
        }
        Some(&mut self.masks[(lod - self.min_lod) as usize])
    }

    /// Extend the covered lod range to include `range`.
    pub fn extend_range(&mut self, range: LodRange) {
        if range.is_empty() {
            return;
        }
        if self.masks.is_empty() {
            *self = TileIndex::with_range(range);
            return;
        }
        while self.min_lod > range.min {
            self.min_lod -= 1;
            self.masks.insert(0, FlagMask::empty(self.min_lod));
        }
        while self.max_lod() < range.max {
            let lod = self.max_lod() + 1;
            self.masks.push(FlagMask::empty(lod));
        }
    }

    pub fn get(&self, tile: TileId) -> u8 {
        self.mask(tile.lod)
            .map(|m| m.get(tile.x, tile.y))
            .unwrap_or(0)
    }

    /// Set the full flag word; extends the lod range as needed.
    pub fn set(&mut self, tile: TileId, value: u8) {
        self.extend_range(LodRange::new(tile.lod, tile.lod));
        if let Some(mask) = self.mask_mut(tile.lod) {
            mask.set(tile.x, tile.y, value);
        }
    }

    /// Bitwise update: set or clear `bits` of the tile's flag word.
    pub fn set_mask(&mut self, tile: TileId, bits: u8, value: bool) {
        self.extend_range(LodRange::new(tile.lod, tile.lod));
        if let Some(mask) = self.mask_mut(tile.lod) {
            mask.update(tile.x, tile.y, |v| if value { v | bits } else { v & !bits });
        }
    }

    /// Number of tiles whose word intersects `bits`.
    pub fn count(&self, bits: u8) -> u64 {
        self.masks.iter().map(|m| m.count_matching(bits)).sum()
    }

    /// Visit every tile whose flag word is nonzero.
    pub fn for_each(&self, mut op: impl FnMut(TileId, u8)) {
        for (i, mask) in self.masks.iter().enumerate() {
            let lod = self.min_lod + i as Lod;
            mask.for_each(|x, y, v| op(TileId::new(lod, x, y), v));
        }
    }

    /// New index with value 1 wherever the flag word intersects `bits`.
    pub fn simplify(&self, bits: u8) -> TileIndex {
        let mut out = TileIndex::with_range(self.lod_range());
        self.for_each(|tile, v| {
            if v & bits != 0 {
                out.set(tile, 1);
            }
        });
        out
    }

    /// Cell-wise union (bitwise OR) with another index.
    pub fn unite_with(&mut self, other: &TileIndex) {
        self.extend_range(other.lod_range());
        for lod in other.lod_range().iter() {
            let theirs = other.mask(lod).unwrap().clone();
            if let Some(mine) = self.mask_mut(lod) {
                mine.combine(&theirs, |a, b| a | b);
            }
        }
    }

    /// Keep only cells present (nonzero) in `other`.
    pub fn intersect_with(&mut self, other: &TileIndex) {
        for (i, mask) in self.masks.iter_mut().enumerate() {
            let lod = self.min_lod + i as Lod;
            match other.mask(lod) {
                Some(theirs) => mask.combine(theirs, |a, b| if b != 0 { a } else { 0 }),
                None => *mask = FlagMask::empty(lod),
            }
        }
    }

    /// Clear cells present (nonzero) in `other`.
    pub fn subtract_with(&mut self, other: &TileIndex) {
        for (i, mask) in self.masks.iter_mut().enumerate() {
            let lod = self.min_lod + i as Lod;
            if let Some(theirs) = other.mask(lod) {
                mask.combine(theirs, |a, b| if b != 0 { 0 } else { a });
            }
        }
    }

    /// Invert cell presence within the covered range (empty cells get
    /// `value`, occupied cells clear).
    pub fn invert(&mut self, value: u8) {
        for mask in self.masks.iter_mut() {
            let full = FlagMask::filled(mask.order(), value);
            let mut inverted = full;
            inverted.combine(mask, |a, b| if b != 0 { 0 } else { a });
            *mask = inverted;
        }
    }

    /// Quad condition per lod: when any of four siblings is set, all four
    /// become set (with the OR of their values).
    pub fn round(&mut self) {
        for mask in self.masks.iter_mut() {
            if mask.order() == 0 {
                continue;
            }
            *mask = mask.coarsened().refined();
        }
    }

    /// Every set tile also sets its parent, up the whole list.
    pub fn grow_up(&mut self) {
        for i in (1..self.masks.len()).rev() {
            let coarser = self.masks[i].coarsened();
            self.masks[i - 1].combine(&coarser, |a, b| a | b);
        }
    }

    /// Every set tile also sets its four children, down the whole list.
    pub fn grow_down(&mut self) {
        for i in 0..self.masks.len().saturating_sub(1) {
            let finer = self.masks[i].refined();
            self.masks[i + 1].combine(&finer, |a, b| a | b);
        }
    }

    /// Make every set tile reachable from the root: close under parents up
    /// to lod 0.
    pub fn complete(&mut self) {
        if self.masks.is_empty() {
            return;
        }
        self.extend_range(LodRange::new(0, self.max_lod()));
        self.grow_up();
    }

    /// Close under children down to the bottom of the covered range.
    pub fn complete_down(&mut self) {
        self.grow_down();
    }

    /// Overapproximated sphere of influence of tiles matching `bits`:
    /// everything above and below them within `range`, rounded per lod.
    pub fn sphere_of_influence(&self, range: LodRange, bits: u8) -> TileIndex {
        let mut out = self.simplify(bits);
        out.extend_range(range);
        out.complete();
        out.complete_down();
        out.round();
        out
    }

    /// Lod range and tile range (at that range's min lod) of tiles
    /// matching `bits`.
    pub fn ranges(&self, bits: u8) -> (LodRange, TileRange) {
        let mut lod_range = LodRange::empty();
        self.for_each(|tile, v| {
            if v & bits != 0 {
                lod_range.update(tile.lod);
            }
        });

        let mut tile_range = TileRange::invalid();
        if !lod_range.is_empty() {
            if let Some(mask) = self.mask(lod_range.min) {
                mask.for_each(|x, y, v| {
                    if v & bits != 0 {
                        tile_range.update(x, y);
                    }
                });
            }
        }
        (lod_range, tile_range)
    }

    pub fn write(&self, out: &mut impl Write) -> Result<()> {
        out.write_all(MAGIC)?;
        out.write_u16::<LittleEndian>(VERSION)?;
        out.write_u8(self.min_lod)?;
        out.write_u8(self.masks.len() as u8)?;
        for mask in &self.masks {
            mask.write(out)?;
        }
        Ok(())
    }

    pub fn read(input: &mut impl Read, path: &Path) -> Result<TileIndex> {
        let mut magic = [0u8; 2];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(TileStoreError::bad_file(path, "not a tile index"));
        }
        let version = input.read_u16::<LittleEndian>()?;
        if version > VERSION {
            return Err(TileStoreError::Version {
                path: path.to_path_buf(),
                version,
            });
        }
        let min_lod = input.read_u8()?;
        let count = input.read_u8()? as usize;
        let mut masks = Vec::with_capacity(count);
        for i in 0..count {
            let mask = FlagMask::read(input)?;
            if mask.order() != min_lod + i as Lod {
                return Err(TileStoreError::bad_file(
                    path,
                    format!("mask order {} does not match lod {}", mask.order(), min_lod + i as Lod),
                ));
            }
            masks.push(mask);
        }
        Ok(TileIndex { min_lod, masks })
    }
}

impl Default for TileIndex {
    fn default() -> Self {
        TileIndex::new()
    }
}

/// Union of two indices into a fresh one.
pub fn unite(a: &TileIndex, b: &TileIndex) -> TileIndex {
    let mut out = a.clone();
    out.unite_with(b);
    out
}

/// Intersection of two indices into a fresh one.
pub fn intersect(a: &TileIndex, b: &TileIndex) -> TileIndex {
    let mut out = a.clone();
    out.intersect_with(b);
    out
}

/// The persisted pair of indices of one tileset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileSetIndex {
    /// Per-tile flag words.
    pub tile_index: TileIndex,
    /// Per-tile 1-based surface references (reference tiles only).
    pub references: TileIndex,
}

impl TileSetIndex {
    /// A real tile has a mesh or an atlas.
    pub fn real(&self, tile: TileId) -> bool {
        self.tile_index.get(tile) & TileFlags::REAL.bits() != 0
    }

    pub fn save(&self, out: &mut impl Write) -> Result<()> {
        self.tile_index.write(out)?;
        self.references.write(out)
    }

    pub fn load(input: &mut impl Read, path: &Path) -> Result<TileSetIndex> {
        let tile_index = TileIndex::read(input, path)?;
        let references = TileIndex::read(input, path)?;
        Ok(TileSetIndex {
            tile_index,
            references,
        })
    }
}
