use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned 2-D extents (lower-left / upper-right).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extents2 {
    pub ll: DVec2,
    pub ur: DVec2,
}

impl Extents2 {
    pub fn new(llx: f64, lly: f64, urx: f64, ury: f64) -> Self {
        Extents2 {
            ll: DVec2::new(llx, lly),
            ur: DVec2::new(urx, ury),
        }
    }

    /// The distinguished invalid value (`ur < ll`), absorbing under union.
    pub fn invalid() -> Self {
        Extents2 {
            ll: DVec2::splat(f64::INFINITY),
            ur: DVec2::splat(f64::NEG_INFINITY),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.ll.x <= self.ur.x && self.ll.y <= self.ur.y
    }

    pub fn size(&self) -> DVec2 {
        self.ur - self.ll
    }

    pub fn center(&self) -> DVec2 {
        (self.ll + self.ur) * 0.5
    }

    pub fn contains(&self, p: DVec2) -> bool {
        p.x >= self.ll.x && p.x <= self.ur.x && p.y >= self.ll.y && p.y <= self.ur.y
    }

    pub fn update(&mut self, p: DVec2) {
        self.ll = self.ll.min(p);
        self.ur = self.ur.max(p);
    }

    pub fn unite(&self, other: &Extents2) -> Extents2 {
        Extents2 {
            ll: self.ll.min(other.ll),
            ur: self.ur.max(other.ur),
        }
    }

    /// One quadrant of these extents; `index` uses tile child numbering
    /// (0 = upper-left, y axis pointing down in tile space).
    pub fn quadrant(&self, index: usize) -> Extents2 {
        let c = self.center();
        let (llx, urx) = if index & 1 == 0 {
            (self.ll.x, c.x)
        } else {
            (c.x, self.ur.x)
        };
        // tile rows grow downward while geo y grows upward
        let (lly, ury) = if index & 2 == 0 {
            (c.y, self.ur.y)
        } else {
            (self.ll.y, c.y)
        };
        Extents2::new(llx, lly, urx, ury)
    }
}

/// Axis-aligned 3-D extents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extents3 {
    pub ll: DVec3,
    pub ur: DVec3,
}

impl Extents3 {
    pub fn new(ll: DVec3, ur: DVec3) -> Self {
        Extents3 { ll, ur }
    }

    /// Degenerate point extents; also the "no geometry" marker
    /// (`ll == ur`) used by metanodes.
    pub fn point(p: DVec3) -> Self {
        Extents3 { ll: p, ur: p }
    }

    pub fn zero() -> Self {
        Extents3::point(DVec3::ZERO)
    }

    pub fn invalid() -> Self {
        Extents3 {
            ll: DVec3::splat(f64::INFINITY),
            ur: DVec3::splat(f64::NEG_INFINITY),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.ll.x <= self.ur.x && self.ll.y <= self.ur.y && self.ll.z <= self.ur.z
    }

    /// Degenerate extents carry no geometry.
    pub fn is_degenerate(&self) -> bool {
        self.ll == self.ur
    }

    pub fn size(&self) -> DVec3 {
        self.ur - self.ll
    }

    pub fn update(&mut self, p: DVec3) {
        self.ll = self.ll.min(p);
        self.ur = self.ur.max(p);
    }

    pub fn unite(&self, other: &Extents3) -> Extents3 {
        Extents3 {
            ll: self.ll.min(other.ll),
            ur: self.ur.max(other.ur),
        }
    }

    /// Merge respecting the degenerate "no geometry" marker.
    pub fn merge(&self, other: &Extents3) -> Extents3 {
        if other.is_degenerate() {
            return *self;
        }
        if self.is_degenerate() {
            return *other;
        }
        self.unite(other)
    }
}

pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extents2_update_and_unite() {
        let mut e = Extents2::invalid();
        assert!(!e.is_valid());
        e.update(DVec2::new(1.0, 2.0));
        e.update(DVec2::new(-1.0, 5.0));
        assert!(e.is_valid());
        assert_eq!(e.ll, DVec2::new(-1.0, 2.0));
        assert_eq!(e.ur, DVec2::new(1.0, 5.0));

        let u = e.unite(&Extents2::new(0.0, 0.0, 3.0, 3.0));
        assert_eq!(u.ll, DVec2::new(-1.0, 0.0));
        assert_eq!(u.ur, DVec2::new(3.0, 5.0));
    }

    #[test]
    fn extents2_quadrants() {
        let e = Extents2::new(0.0, 0.0, 2.0, 2.0);
        // child 0 is upper-left: low x, high y
        assert_eq!(e.quadrant(0), Extents2::new(0.0, 1.0, 1.0, 2.0));
        assert_eq!(e.quadrant(1), Extents2::new(1.0, 1.0, 2.0, 2.0));
        assert_eq!(e.quadrant(2), Extents2::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(e.quadrant(3), Extents2::new(1.0, 0.0, 2.0, 1.0));
    }

    #[test]
    fn extents3_merge_respects_degenerate() {
        let real = Extents3::new(DVec3::ZERO, DVec3::ONE);
        let none = Extents3::zero();
        assert_eq!(real.merge(&none), real);
        assert_eq!(none.merge(&real), real);

        let other = Extents3::new(DVec3::splat(0.5), DVec3::splat(2.0));
        let merged = real.merge(&other);
        assert_eq!(merged.ll, DVec3::ZERO);
        assert_eq!(merged.ur, DVec3::splat(2.0));
    }
}
