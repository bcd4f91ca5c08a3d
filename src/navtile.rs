//! Navigation height tile.
//!
//! A navtile is a 65x65 grid of heights in grid registration (samples sit
//! on tile corners, edges shared with neighbors) plus a per-sample
//! coverage bitfield. Upsampling for derived tiles runs 2x Catmull-Rom
//! steps and crops the requested sub-quadrant.

use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, TileStoreError};
use crate::multifile;
use crate::tile::TileId;

const MAGIC: [u8; 2] = *b"NT";
const VERSION: u16 = 1;

/// Samples per navtile edge (grid registration).
pub const SIZE: usize = 65;

/// One navigation height tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavTile {
    heights: Vec<i16>,
    coverage: Vec<bool>,
}

impl Default for NavTile {
    fn default() -> Self {
        NavTile {
            heights: vec![0; SIZE * SIZE],
            coverage: vec![false; SIZE * SIZE],
        }
    }
}

impl NavTile {
    pub fn new() -> Self {
        NavTile::default()
    }

    /// Fully covered navtile with a constant height.
    pub fn flat(height: i16) -> Self {
        NavTile {
            heights: vec![height; SIZE * SIZE],
            coverage: vec![true; SIZE * SIZE],
        }
    }

    pub fn get(&self, x: usize, y: usize) -> i16 {
        self.heights[y * SIZE + x]
    }

    pub fn covered(&self, x: usize, y: usize) -> bool {
        self.coverage[y * SIZE + x]
    }

    pub fn set(&mut self, x: usize, y: usize, height: i16) {
        self.heights[y * SIZE + x] = height;
        self.coverage[y * SIZE + x] = true;
    }

    pub fn is_empty(&self) -> bool {
        !self.coverage.iter().any(|&c| c)
    }

    /// Min/max height over covered samples; `(0, 0)` when empty.
    pub fn height_range(&self) -> (i16, i16) {
        let mut range: Option<(i16, i16)> = None;
        for (i, &covered) in self.coverage.iter().enumerate() {
            if !covered {
                continue;
            }
            let h = self.heights[i];
            range = Some(match range {
                None => (h, h),
                Some((min, max)) => (min.min(h), max.max(h)),
            });
        }
        range.unwrap_or((0, 0))
    }

    /// Overlay `other` on top: covered samples overwrite.
    pub fn overlay(&mut self, other: &NavTile) {
        for i in 0..SIZE * SIZE {
            if other.coverage[i] {
                self.heights[i] = other.heights[i];
                self.coverage[i] = true;
            }
        }
    }

    /// Navtile of a descendant tile: repeated 2x Catmull-Rom upsampling,
    /// cropping the sub-quadrant at every level.
    ///
    /// `local` is the descendant's id relative to this navtile's tile.
    pub fn for_child(&self, local: TileId) -> NavTile {
        let mut current = self.clone();
        for level in (0..local.lod).rev() {
            let xbit = ((local.x >> level) & 1) as usize;
            let ybit = ((local.y >> level) & 1) as usize;
            current = current.upsample_quadrant(xbit, ybit);
        }
        current
    }

    /// One 2x Catmull-Rom upsampling step, cropped to the requested
    /// quadrant (grid registration: the result shares the center line).
    fn upsample_quadrant(&self, xbit: usize, ybit: usize) -> NavTile {
        const FINE: usize = 2 * (SIZE - 1) + 1;
        let mut fine_heights = vec![0f64; FINE * FINE];
        let mut fine_coverage = vec![false; FINE * FINE];

        // rows first
        let mut rows = vec![0f64; FINE * SIZE];
        for y in 0..SIZE {
            for fx in 0..FINE {
                rows[y * FINE + fx] = if fx % 2 == 0 {
                    self.heights[y * SIZE + fx / 2] as f64
                } else {
                    catmull_rom(
                        |i| self.heights[y * SIZE + i] as f64,
                        SIZE,
                        fx / 2,
                    )
                };
            }
        }
        // then columns
        for fy in 0..FINE {
            for fx in 0..FINE {
                fine_heights[fy * FINE + fx] = if fy % 2 == 0 {
                    rows[(fy / 2) * FINE + fx]
                } else {
                    catmull_rom(|i| rows[i * FINE + fx], SIZE, fy / 2)
                };
            }
        }
        // coverage expands by nearest sample
        for fy in 0..FINE {
            for fx in 0..FINE {
                fine_coverage[fy * FINE + fx] =
                    self.coverage[(fy / 2).min(SIZE - 1) * SIZE + (fx / 2).min(SIZE - 1)];
            }
        }

        let ox = xbit * (SIZE - 1);
        let oy = ybit * (SIZE - 1);
        let mut out = NavTile::new();
        for y in 0..SIZE {
            for x in 0..SIZE {
                let fi = (oy + y) * FINE + ox + x;
                out.heights[y * SIZE + x] =
                    fine_heights[fi].round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                out.coverage[y * SIZE + x] = fine_coverage[fi];
            }
        }
        out
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        let mut builder = multifile::Builder::new(MAGIC, VERSION);
        builder.add_part_with(|out| {
            out.write_u16::<LittleEndian>(SIZE as u16)?;
            for &h in &self.heights {
                out.write_i16::<LittleEndian>(h)?;
            }
            let mut byte = 0u8;
            let mut bit = 0x80u8;
            for &covered in &self.coverage {
                if covered {
                    byte |= bit;
                }
                bit >>= 1;
                if bit == 0 {
                    out.write_u8(byte)?;
                    byte = 0;
                    bit = 0x80;
                }
            }
            if bit != 0x80 {
                out.write_u8(byte)?;
            }
            Ok(())
        })?;
        Ok(builder.finish())
    }

    pub fn load(data: &[u8], path: &Path) -> Result<NavTile> {
        let table = multifile::read_table(data, MAGIC, VERSION, path)?;
        table.check_parts(1, path)?;
        let mut body = multifile::part_slice(data, table.parts[0]);

        let size = body.read_u16::<LittleEndian>()? as usize;
        if size != SIZE {
            return Err(TileStoreError::bad_file(
                path,
                format!("unexpected navtile size {size}"),
            ));
        }
        let mut heights = Vec::with_capacity(SIZE * SIZE);
        for _ in 0..SIZE * SIZE {
            heights.push(body.read_i16::<LittleEndian>()?);
        }
        let mut coverage = Vec::with_capacity(SIZE * SIZE);
        let mut byte = 0u8;
        let mut bit = 0u8;
        for _ in 0..SIZE * SIZE {
            if bit == 0 {
                byte = body.read_u8()?;
                bit = 0x80;
            }
            coverage.push(byte & bit != 0);
            bit >>= 1;
        }
        Ok(NavTile { heights, coverage })
    }
}

/// Catmull-Rom interpolation at the midpoint between samples `i` and
/// `i + 1` of a clamped sequence.
fn catmull_rom(sample: impl Fn(usize) -> f64, len: usize, i: usize) -> f64 {
    let p0 = sample(i.saturating_sub(1));
    let p1 = sample(i);
    let p2 = sample((i + 1).min(len - 1));
    let p3 = sample((i + 2).min(len - 1));
    (-p0 + 9.0 * p1 + 9.0 * p2 - p3) / 16.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_and_range() {
        let nav = NavTile::flat(100);
        assert!(!nav.is_empty());
        assert_eq!(nav.height_range(), (100, 100));

        let empty = NavTile::new();
        assert!(empty.is_empty());
        assert_eq!(empty.height_range(), (0, 0));
    }

    #[test]
    fn overlay_respects_coverage() {
        let mut base = NavTile::flat(10);
        let mut top = NavTile::new();
        top.set(3, 4, 99);

        base.overlay(&top);
        assert_eq!(base.get(3, 4), 99);
        assert_eq!(base.get(0, 0), 10);
    }

    #[test]
    fn upsample_preserves_constant_field() {
        let nav = NavTile::flat(500);
        let child = nav.for_child(TileId::new(2, 1, 3));
        for y in 0..SIZE {
            for x in 0..SIZE {
                assert_eq!(child.get(x, y), 500);
                assert!(child.covered(x, y));
            }
        }
    }

    #[test]
    fn upsample_interpolates_gradient() {
        // linear ramp along x: Catmull-Rom reproduces linear data exactly
        let mut nav = NavTile::new();
        for y in 0..SIZE {
            for x in 0..SIZE {
                nav.set(x, y, (x * 10) as i16);
            }
        }
        // upper-left child covers the left half at doubled resolution
        let child = nav.for_child(TileId::new(1, 0, 0));
        assert_eq!(child.get(0, 0), 0);
        assert_eq!(child.get(64, 0), 320);
        assert_eq!(child.get(32, 32), 160);
        // interior odd samples interpolate between coarse neighbors
        assert_eq!(child.get(3, 0), 15);
    }

    #[test]
    fn child_quadrants_partition_parent() {
        let mut nav = NavTile::new();
        for y in 0..SIZE {
            for x in 0..SIZE {
                nav.set(x, y, (x + y) as i16);
            }
        }
        let ul = nav.for_child(TileId::new(1, 0, 0));
        let lr = nav.for_child(TileId::new(1, 1, 1));
        // corners map to parent's corners
        assert_eq!(ul.get(0, 0), 0);
        assert_eq!(lr.get(64, 64), ((SIZE - 1) + (SIZE - 1)) as i16);
        // shared center sample
        assert_eq!(ul.get(64, 64), lr.get(0, 0));
    }

    #[test]
    fn codec_roundtrip() {
        let mut nav = NavTile::new();
        nav.set(0, 0, -5);
        nav.set(64, 64, 1234);
        nav.set(13, 57, 42);

        let data = nav.save().unwrap();
        let back = NavTile::load(&data, Path::new("t.nav")).unwrap();
        assert_eq!(nav, back);
    }
}
