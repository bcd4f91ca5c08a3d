use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TileStoreError};

/// Level of detail (depth in the quad-tree, root is 0).
pub type Lod = u8;

/// Tile identifier: LOD plus tile index from the upper-left corner of the
/// tile grid at that LOD.
///
/// Ordering is lexicographic on `(lod, x, y)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TileId {
    pub lod: Lod,
    pub x: u32,
    pub y: u32,
}

impl TileId {
    pub fn new(lod: Lod, x: u32, y: u32) -> Self {
        TileId { lod, x, y }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.lod, self.x, self.y)
    }
}

/// Children of a tile, in child-index order (ul, ur, ll, lr).
pub fn children(tile: TileId) -> [TileId; 4] {
    let base = TileId::new(tile.lod + 1, tile.x << 1, tile.y << 1);
    [
        base,
        TileId::new(base.lod, base.x + 1, base.y),
        TileId::new(base.lod, base.x, base.y + 1),
        TileId::new(base.lod, base.x + 1, base.y + 1),
    ]
}

/// Parent of a tile, `diff` levels up. Returns the root for `diff > lod`.
pub fn parent(tile: TileId, diff: Lod) -> TileId {
    if diff > tile.lod {
        return TileId::default();
    }
    TileId::new(tile.lod - diff, tile.x >> diff, tile.y >> diff)
}

/// Child index of a tile within its parent: `(x & 1) + ((y & 1) << 1)`.
pub fn child_index(tile: TileId) -> usize {
    ((tile.x & 1) + ((tile.y & 1) << 1)) as usize
}

/// Lowest (upper-left) descendant of a tile, `diff` levels down.
pub fn lowest_child(tile: TileId, diff: Lod) -> TileId {
    TileId::new(tile.lod + diff, tile.x << diff, tile.y << diff)
}

/// Tile id of `tile` relative to its ancestor at `root_lod`.
///
/// Identity root for `root_lod >= tile.lod`.
pub fn local(root_lod: Lod, tile: TileId) -> TileId {
    if root_lod >= tile.lod {
        return TileId::default();
    }
    let ldiff = tile.lod - root_lod;
    let mask = (1u32 << ldiff) - 1;
    TileId::new(ldiff, tile.x & mask, tile.y & mask)
}

/// Whether `above` is an ancestor of (or equal to) `tile`.
pub fn is_above(tile: TileId, above: TileId) -> bool {
    above.lod <= tile.lod && parent(tile, tile.lod - above.lod) == above
}

/// Number of tiles along one axis at `lod`.
pub fn tile_count(lod: Lod) -> u64 {
    1u64 << lod
}

/// Inclusive range of levels of detail. Empty when `max < min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LodRange {
    pub min: Lod,
    pub max: Lod,
}

impl LodRange {
    pub fn new(min: Lod, max: Lod) -> Self {
        LodRange { min, max }
    }

    /// The distinguished empty range.
    pub fn empty() -> Self {
        LodRange { min: 1, max: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }

    pub fn contains(&self, lod: Lod) -> bool {
        lod >= self.min && lod <= self.max
    }

    /// Union of two ranges; empty operands are ignored.
    pub fn unite(self, other: LodRange) -> LodRange {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        LodRange::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Extend the range to cover `lod`.
    pub fn update(&mut self, lod: Lod) {
        if self.is_empty() {
            *self = LodRange::new(lod, lod);
            return;
        }
        self.min = self.min.min(lod);
        self.max = self.max.max(lod);
    }

    pub fn iter(&self) -> impl Iterator<Item = Lod> {
        self.min..=self.max
    }
}

impl fmt::Display for LodRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "empty")
        } else {
            write!(f, "{},{}", self.min, self.max)
        }
    }
}

/// Inclusive rectangle over `(x, y)` tile indices at one LOD.
///
/// The distinguished invalid value has `ur < ll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRange {
    pub ll: (u32, u32),
    pub ur: (u32, u32),
}

impl TileRange {
    pub fn new(llx: u32, lly: u32, urx: u32, ury: u32) -> Self {
        TileRange {
            ll: (llx, lly),
            ur: (urx, ury),
        }
    }

    /// Range covering a single tile.
    pub fn of(tile: TileId) -> Self {
        TileRange::new(tile.x, tile.y, tile.x, tile.y)
    }

    pub fn invalid() -> Self {
        TileRange {
            ll: (1, 1),
            ur: (0, 0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.ll.0 <= self.ur.0 && self.ll.1 <= self.ur.1
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.is_valid() && x >= self.ll.0 && x <= self.ur.0 && y >= self.ll.1 && y <= self.ur.1
    }

    /// Extend the range to cover `(x, y)`.
    pub fn update(&mut self, x: u32, y: u32) {
        if !self.is_valid() {
            *self = TileRange::new(x, y, x, y);
            return;
        }
        self.ll.0 = self.ll.0.min(x);
        self.ll.1 = self.ll.1.min(y);
        self.ur.0 = self.ur.0.max(x);
        self.ur.1 = self.ur.1.max(y);
    }

    /// Width and height in tiles.
    pub fn size(&self) -> (u32, u32) {
        (self.ur.0 - self.ll.0 + 1, self.ur.1 - self.ll.1 + 1)
    }

    pub fn overlaps(&self, other: &TileRange) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.ll.0 <= other.ur.0
            && other.ll.0 <= self.ur.0
            && self.ll.1 <= other.ur.1
            && other.ll.1 <= self.ur.1
    }

    /// Intersection; invalid when the ranges do not overlap.
    pub fn intersect(&self, other: &TileRange) -> TileRange {
        if !self.overlaps(other) {
            return TileRange::invalid();
        }
        TileRange::new(
            self.ll.0.max(other.ll.0),
            self.ll.1.max(other.ll.1),
            self.ur.0.min(other.ur.0),
            self.ur.1.min(other.ur.1),
        )
    }

    pub fn unite(&self, other: &TileRange) -> TileRange {
        if !self.is_valid() {
            return *other;
        }
        if !other.is_valid() {
            return *self;
        }
        TileRange::new(
            self.ll.0.min(other.ll.0),
            self.ll.1.min(other.ll.1),
            self.ur.0.max(other.ur.0),
            self.ur.1.max(other.ur.1),
        )
    }
}

/// Parent range, `diff` levels up.
pub fn parent_range(range: &TileRange, diff: Lod) -> TileRange {
    if !range.is_valid() {
        return *range;
    }
    TileRange::new(
        range.ll.0 >> diff,
        range.ll.1 >> diff,
        range.ur.0 >> diff,
        range.ur.1 >> diff,
    )
}

/// Child range, `diff` levels down: lowest child of ll, highest child of ur.
pub fn child_range(range: &TileRange, diff: Lod) -> TileRange {
    if !range.is_valid() {
        return *range;
    }
    TileRange::new(
        range.ll.0 << diff,
        range.ll.1 << diff,
        ((range.ur.0 + 1) << diff) - 1,
        ((range.ur.1 + 1) << diff) - 1,
    )
}

/// Shift a range from one LOD to another.
pub fn shift_range(src_lod: Lod, range: &TileRange, dst_lod: Lod) -> TileRange {
    if src_lod == dst_lod {
        return *range;
    }
    if dst_lod > src_lod {
        child_range(range, dst_lod - src_lod)
    } else {
        parent_range(range, src_lod - dst_lod)
    }
}

/// Tile file kinds stored for one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileFile {
    Mesh,
    Atlas,
    Navtile,
    Meta,
    Mask,
    Meta2d,
    Ortho,
    Credits,
}

impl TileFile {
    /// File extension used in tile file names.
    pub fn extension(&self) -> &'static str {
        match self {
            TileFile::Mesh => "bin",
            TileFile::Atlas => "jpg",
            TileFile::Navtile => "nav",
            TileFile::Meta => "meta",
            TileFile::Mask => "mask",
            TileFile::Meta2d => "2d",
            TileFile::Ortho => "ort",
            TileFile::Credits => "credits",
        }
    }

    fn from_extension(ext: &str) -> Option<TileFile> {
        Some(match ext {
            "bin" => TileFile::Mesh,
            "jpg" => TileFile::Atlas,
            "nav" => TileFile::Navtile,
            "meta" => TileFile::Meta,
            "mask" => TileFile::Mask,
            "2d" => TileFile::Meta2d,
            "ort" => TileFile::Ortho,
            "credits" => TileFile::Credits,
            _ => return None,
        })
    }

    /// Slot type inside a tile archive (mesh and atlas share one archive).
    pub fn archive_type(&self) -> u32 {
        match self {
            TileFile::Mesh | TileFile::Meta => 0,
            TileFile::Atlas => 1,
            TileFile::Navtile => 2,
            _ => 3,
        }
    }
}

/// Render a tile file name: `<lod>-<x>-<y>.<ext>`, optionally suffixed with
/// `.r<revision>`.
pub fn as_filename(tile: TileId, kind: TileFile, revision: Option<u32>) -> String {
    match revision {
        Some(rev) => format!("{tile}.{}.r{rev}", kind.extension()),
        None => format!("{tile}.{}", kind.extension()),
    }
}

/// Parsed tile file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileFileName {
    pub tile: TileId,
    pub kind: TileFile,
    pub revision: Option<u32>,
}

/// Strict parser for tile file names; any deviation from the template fails.
pub fn parse_filename(name: &str) -> Result<TileFileName> {
    let bad = || TileStoreError::BadFileName(name.to_string());

    let mut dots = name.split('.');
    let stem = dots.next().ok_or_else(bad)?;
    let ext = dots.next().ok_or_else(bad)?;
    let revision = match dots.next() {
        None => None,
        Some(rev) => {
            let digits = rev.strip_prefix('r').ok_or_else(bad)?;
            Some(u32::from_str(digits).map_err(|_| bad())?)
        }
    };
    if dots.next().is_some() {
        return Err(bad());
    }

    let mut parts = stem.split('-');
    let lod = parts
        .next()
        .and_then(|p| Lod::from_str(p).ok())
        .ok_or_else(bad)?;
    let x = parts
        .next()
        .and_then(|p| u32::from_str(p).ok())
        .ok_or_else(bad)?;
    let y = parts
        .next()
        .and_then(|p| u32::from_str(p).ok())
        .ok_or_else(bad)?;
    if parts.next().is_some() {
        return Err(bad());
    }

    let kind = TileFile::from_extension(ext).ok_or_else(bad)?;

    Ok(TileFileName {
        tile: TileId::new(lod, x, y),
        kind,
        revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_and_parent_roundtrip() {
        let t = TileId::new(3, 5, 6);
        let kids = children(t);
        assert_eq!(kids[0], TileId::new(4, 10, 12));
        assert_eq!(kids[1], TileId::new(4, 11, 12));
        assert_eq!(kids[2], TileId::new(4, 10, 13));
        assert_eq!(kids[3], TileId::new(4, 11, 13));

        for (i, kid) in kids.iter().enumerate() {
            assert_eq!(parent(*kid, 1), t);
            assert_eq!(child_index(*kid), i);
        }
    }

    #[test]
    fn parent_above_root_saturates() {
        assert_eq!(parent(TileId::new(2, 3, 1), 5), TileId::default());
    }

    #[test]
    fn local_masks_low_bits() {
        let t = TileId::new(5, 0b10110, 0b01101);
        assert_eq!(local(2, t), TileId::new(3, 0b110, 0b101));
        assert_eq!(local(5, t), TileId::default());
        assert_eq!(local(7, t), TileId::default());
    }

    #[test]
    fn above_relation() {
        let t = TileId::new(5, 10, 10);
        assert!(is_above(t, TileId::new(3, 2, 2)));
        assert!(is_above(t, t));
        assert!(!is_above(t, TileId::new(3, 1, 2)));
    }

    #[test]
    fn tile_ordering() {
        let mut ids = vec![
            TileId::new(2, 0, 1),
            TileId::new(1, 9, 9),
            TileId::new(2, 0, 0),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                TileId::new(1, 9, 9),
                TileId::new(2, 0, 0),
                TileId::new(2, 0, 1),
            ]
        );
    }

    #[test]
    fn lod_range_empty_and_unite() {
        let e = LodRange::empty();
        assert!(e.is_empty());
        assert_eq!(e.unite(LodRange::new(2, 5)), LodRange::new(2, 5));
        assert_eq!(
            LodRange::new(1, 3).unite(LodRange::new(2, 7)),
            LodRange::new(1, 7)
        );
    }

    #[test]
    fn tile_range_arithmetic() {
        let r = TileRange::new(2, 3, 5, 7);
        assert_eq!(r.size(), (4, 5));
        assert_eq!(parent_range(&r, 1), TileRange::new(1, 1, 2, 3));
        assert_eq!(child_range(&r, 1), TileRange::new(4, 6, 11, 15));
        assert_eq!(shift_range(4, &r, 4), r);

        let s = TileRange::new(5, 7, 9, 9);
        assert!(r.overlaps(&s));
        assert_eq!(r.intersect(&s), TileRange::new(5, 7, 5, 7));

        let far = TileRange::new(100, 100, 101, 101);
        assert!(!r.overlaps(&far));
        assert!(!r.intersect(&far).is_valid());
    }

    #[test]
    fn invalid_range() {
        let mut r = TileRange::invalid();
        assert!(!r.is_valid());
        r.update(4, 2);
        assert_eq!(r, TileRange::new(4, 2, 4, 2));
        r.update(1, 9);
        assert_eq!(r, TileRange::new(1, 2, 4, 9));
    }

    #[test]
    fn filename_roundtrip() {
        let t = TileId::new(3, 4, 5);
        assert_eq!(as_filename(t, TileFile::Mesh, None), "3-4-5.bin");
        assert_eq!(as_filename(t, TileFile::Meta, Some(7)), "3-4-5.meta.r7");

        let parsed = parse_filename("3-4-5.bin").unwrap();
        assert_eq!(parsed.tile, t);
        assert_eq!(parsed.kind, TileFile::Mesh);
        assert_eq!(parsed.revision, None);

        let parsed = parse_filename("3-4-5.nav.r12").unwrap();
        assert_eq!(parsed.kind, TileFile::Navtile);
        assert_eq!(parsed.revision, Some(12));
    }

    #[test]
    fn filename_parser_is_strict() {
        for bad in [
            "3-4.bin",
            "3-4-5-6.bin",
            "3-4-5.xyz",
            "3-4-5.bin.7",
            "a-4-5.bin",
            "3-4-5.bin.r7.extra",
            "3-4-5",
        ] {
            assert!(
                matches!(parse_filename(bad), Err(TileStoreError::BadFileName(_))),
                "expected failure for {bad:?}"
            );
        }
    }
}
