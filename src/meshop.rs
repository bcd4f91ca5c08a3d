//! Mesh operations used by the merge engine: Sutherland-Hodgman clipping
//! against a tile square, scanline triangle conversion over the coverage
//! raster, and quad-split refinement toward a face budget.
//!
//! All operations run in *coverage space*: the tile footprint mapped onto
//! the 256x256 raster with pixel centers at integral indices. The caller
//! supplies a [`MeshVertexConvertor`] that turns coverage-space positions
//! back into physical vertices and external texture coordinates.

use std::collections::HashMap;

use glam::{DVec2, DVec3};

use crate::math::Extents2;
use crate::mesh::{Face, SubMesh};

/// Converts coverage-space geometry into output-mesh attributes.
pub trait MeshVertexConvertor {
    /// Physical vertex for a coverage-space position.
    fn vertex(&self, projected: DVec3) -> DVec3;

    /// Normalized external texture coordinates for a coverage-space
    /// position.
    fn etc(&self, projected: DVec3) -> DVec2;

    /// Face budget after refinement, given the current count.
    fn refine_to_face_count(&self, current: usize) -> usize;
}

/// A submesh plus its vertices projected into coverage space.
#[derive(Debug, Clone, Default)]
pub struct EnhancedSubMesh {
    pub mesh: SubMesh,
    pub projected: Vec<DVec3>,
}

impl EnhancedSubMesh {
    pub fn is_empty(&self) -> bool {
        self.mesh.faces.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct ClipVertex {
    pos: DVec3,
    tc: DVec2,
    has_tc: bool,
}

impl ClipVertex {
    fn lerp(&self, other: &ClipVertex, t: f64) -> ClipVertex {
        ClipVertex {
            pos: self.pos.lerp(other.pos, t),
            tc: self.tc.lerp(other.tc, t),
            has_tc: self.has_tc,
        }
    }
}

/// Accumulates clipped/refined triangles into an indexed submesh,
/// deduplicating vertices by exact position.
struct MeshBuilder {
    positions: Vec<DVec3>,
    tc: Vec<DVec2>,
    faces: Vec<Face>,
    faces_tc: Vec<Face>,
    vertex_map: HashMap<[u64; 3], u32>,
    tc_map: HashMap<[u64; 2], u32>,
}

impl MeshBuilder {
    fn new() -> Self {
        MeshBuilder {
            positions: Vec::new(),
            tc: Vec::new(),
            faces: Vec::new(),
            faces_tc: Vec::new(),
            vertex_map: HashMap::new(),
            tc_map: HashMap::new(),
        }
    }

    fn add_vertex(&mut self, pos: DVec3) -> u32 {
        let key = [pos.x.to_bits(), pos.y.to_bits(), pos.z.to_bits()];
        *self.vertex_map.entry(key).or_insert_with(|| {
            self.positions.push(pos);
            (self.positions.len() - 1) as u32
        })
    }

    fn add_tc(&mut self, tc: DVec2) -> u32 {
        let key = [tc.x.to_bits(), tc.y.to_bits()];
        *self.tc_map.entry(key).or_insert_with(|| {
            self.tc.push(tc);
            (self.tc.len() - 1) as u32
        })
    }

    fn add_triangle(&mut self, a: &ClipVertex, b: &ClipVertex, c: &ClipVertex) {
        // drop degenerate output
        let ab = b.pos - a.pos;
        let ac = c.pos - a.pos;
        if ab.truncate().perp_dot(ac.truncate()).abs() < 1e-12 {
            return;
        }
        let face = [
            self.add_vertex(a.pos),
            self.add_vertex(b.pos),
            self.add_vertex(c.pos),
        ];
        self.faces.push(face);
        if a.has_tc {
            let face_tc = [self.add_tc(a.tc), self.add_tc(b.tc), self.add_tc(c.tc)];
            self.faces_tc.push(face_tc);
        }
    }
}

/// Clip a polygon against one half-plane given by `inside` and the
/// parametric intersection with its boundary.
fn clip_polygon(
    polygon: &[ClipVertex],
    inside: impl Fn(&DVec3) -> bool,
    boundary_t: impl Fn(&DVec3, &DVec3) -> f64,
) -> Vec<ClipVertex> {
    let mut out = Vec::with_capacity(polygon.len() + 1);
    for (i, current) in polygon.iter().enumerate() {
        let previous = &polygon[(i + polygon.len() - 1) % polygon.len()];
        let current_in = inside(&current.pos);
        let previous_in = inside(&previous.pos);

        if current_in {
            if !previous_in {
                let t = boundary_t(&previous.pos, &current.pos);
                out.push(previous.lerp(current, t));
            }
            out.push(*current);
        } else if previous_in {
            let t = boundary_t(&previous.pos, &current.pos);
            out.push(previous.lerp(current, t));
        }
    }
    out
}

/// Clip a submesh (in coverage space) to `extents`, then refine toward the
/// convertor's face budget and convert to output attributes.
///
/// Returns `None` when nothing survives the clip.
pub fn clip_and_refine(
    input: &EnhancedSubMesh,
    extents: &Extents2,
    convertor: &dyn MeshVertexConvertor,
) -> Option<EnhancedSubMesh> {
    let has_tc = input.mesh.has_internal_texture();
    let mut builder = MeshBuilder::new();

    for (fi, face) in input.mesh.faces.iter().enumerate() {
        let tc_face = input.mesh.faces_tc.get(fi);
        let polygon: Vec<ClipVertex> = (0..3)
            .map(|i| ClipVertex {
                pos: input.projected[face[i] as usize],
                tc: tc_face
                    .map(|f| input.mesh.tc[f[i] as usize])
                    .unwrap_or(DVec2::ZERO),
                has_tc: has_tc && tc_face.is_some(),
            })
            .collect();

        let clipped = clip_to_extents(&polygon, extents);
        if clipped.len() < 3 {
            continue;
        }
        for i in 1..clipped.len() - 1 {
            builder.add_triangle(&clipped[0], &clipped[i], &clipped[i + 1]);
        }
    }

    if builder.faces.is_empty() {
        return None;
    }

    // refinement: uniform quad splits until the budget is met
    let target = convertor.refine_to_face_count(builder.faces.len());
    while builder.faces.len() * 4 <= target {
        builder = subdivide(builder, has_tc);
    }

    let mut mesh = SubMesh {
        vertices: builder.positions.iter().map(|p| convertor.vertex(*p)).collect(),
        etc: if input.mesh.has_external_texture() {
            builder.positions.iter().map(|p| convertor.etc(*p)).collect()
        } else {
            Vec::new()
        },
        tc: builder.tc,
        faces: builder.faces,
        faces_tc: builder.faces_tc,
        ..Default::default()
    };
    input.mesh.clone_metadata_into(&mut mesh);

    Some(EnhancedSubMesh {
        mesh,
        projected: builder.positions,
    })
}

fn clip_to_extents(polygon: &[ClipVertex], extents: &Extents2) -> Vec<ClipVertex> {
    let mut polygon = polygon.to_vec();
    let (llx, lly, urx, ury) = (extents.ll.x, extents.ll.y, extents.ur.x, extents.ur.y);

    polygon = clip_polygon(&polygon, |p| p.x >= llx, |a, b| (llx - a.x) / (b.x - a.x));
    polygon = clip_polygon(&polygon, |p| p.x <= urx, |a, b| (urx - a.x) / (b.x - a.x));
    polygon = clip_polygon(&polygon, |p| p.y >= lly, |a, b| (lly - a.y) / (b.y - a.y));
    polygon = clip_polygon(&polygon, |p| p.y <= ury, |a, b| (ury - a.y) / (b.y - a.y));
    polygon
}

fn subdivide(builder: MeshBuilder, has_tc: bool) -> MeshBuilder {
    let MeshBuilder {
        positions,
        tc,
        faces,
        faces_tc,
        ..
    } = builder;

    let mut out = MeshBuilder::new();
    let mut midpoints: HashMap<(u32, u32), (DVec3, DVec2)> = HashMap::new();

    let mut midpoint = |a: u32, b: u32, tc_a: DVec2, tc_b: DVec2| {
        let key = if a < b { (a, b) } else { (b, a) };
        *midpoints.entry(key).or_insert_with(|| {
            (
                (positions[a as usize] + positions[b as usize]) * 0.5,
                (tc_a + tc_b) * 0.5,
            )
        })
    };

    for (fi, face) in faces.iter().enumerate() {
        let tcs = faces_tc
            .get(fi)
            .map(|f| [tc[f[0] as usize], tc[f[1] as usize], tc[f[2] as usize]])
            .unwrap_or([DVec2::ZERO; 3]);
        let corners = [
            (positions[face[0] as usize], tcs[0]),
            (positions[face[1] as usize], tcs[1]),
            (positions[face[2] as usize], tcs[2]),
        ];
        let mids = [
            midpoint(face[0], face[1], tcs[0], tcs[1]),
            midpoint(face[1], face[2], tcs[1], tcs[2]),
            midpoint(face[2], face[0], tcs[2], tcs[0]),
        ];

        let vertex = |(pos, tc): (DVec3, DVec2)| ClipVertex {
            pos,
            tc,
            has_tc: has_tc && !faces_tc.is_empty(),
        };

        out.add_triangle(&vertex(corners[0]), &vertex(mids[0]), &vertex(mids[2]));
        out.add_triangle(&vertex(mids[0]), &vertex(corners[1]), &vertex(mids[1]));
        out.add_triangle(&vertex(mids[2]), &vertex(mids[1]), &vertex(corners[2]));
        out.add_triangle(&vertex(mids[0]), &vertex(mids[1]), &vertex(mids[2]));
    }
    out
}

/// Visit raster cells covered by a triangle in coverage space (pixel
/// centers at integral indices). Thin triangles still hit the cells under
/// their vertices.
pub fn rasterize_triangle(
    a: DVec3,
    b: DVec3,
    c: DVec3,
    width: u32,
    height: u32,
    mut op: impl FnMut(u32, u32),
) {
    let min_x = a.x.min(b.x).min(c.x).floor().max(0.0) as i64;
    let max_x = a.x.max(b.x).max(c.x).ceil().min((width - 1) as f64) as i64;
    let min_y = a.y.min(b.y).min(c.y).floor().max(0.0) as i64;
    let max_y = a.y.max(b.y).max(c.y).ceil().min((height - 1) as f64) as i64;

    let pa = a.truncate();
    let pb = b.truncate();
    let pc = c.truncate();
    let area = (pb - pa).perp_dot(pc - pa);

    if area.abs() > 1e-12 {
        let sign = area.signum();
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let p = DVec2::new(x as f64, y as f64);
                let w0 = (pb - pa).perp_dot(p - pa) * sign;
                let w1 = (pc - pb).perp_dot(p - pb) * sign;
                let w2 = (pa - pc).perp_dot(p - pc) * sign;
                if w0 >= -1e-9 && w1 >= -1e-9 && w2 >= -1e-9 {
                    op(x as u32, y as u32);
                }
            }
        }
    }

    // vertices of sub-pixel triangles
    for p in [pa, pb, pc] {
        let x = p.x.round();
        let y = p.y.round();
        if x >= 0.0 && x < width as f64 && y >= 0.0 && y < height as f64 {
            op(x as u32, y as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;

    impl MeshVertexConvertor for Identity {
        fn vertex(&self, projected: DVec3) -> DVec3 {
            projected
        }
        fn etc(&self, projected: DVec3) -> DVec2 {
            DVec2::new(projected.x, projected.y)
        }
        fn refine_to_face_count(&self, current: usize) -> usize {
            current
        }
    }

    struct Refine(usize);

    impl MeshVertexConvertor for Refine {
        fn vertex(&self, projected: DVec3) -> DVec3 {
            projected
        }
        fn etc(&self, _projected: DVec3) -> DVec2 {
            DVec2::ZERO
        }
        fn refine_to_face_count(&self, _current: usize) -> usize {
            self.0
        }
    }

    fn triangle(a: DVec3, b: DVec3, c: DVec3) -> EnhancedSubMesh {
        EnhancedSubMesh {
            mesh: SubMesh {
                vertices: vec![a, b, c],
                faces: vec![[0, 1, 2]],
                ..Default::default()
            },
            projected: vec![a, b, c],
        }
    }

    #[test]
    fn interior_triangle_passes_through() {
        let input = triangle(
            DVec3::new(1.0, 1.0, 0.0),
            DVec3::new(3.0, 1.0, 0.0),
            DVec3::new(1.0, 3.0, 0.0),
        );
        let extents = Extents2::new(0.0, 0.0, 10.0, 10.0);
        let out = clip_and_refine(&input, &extents, &Identity).unwrap();
        assert_eq!(out.mesh.faces.len(), 1);
        assert_eq!(out.mesh.vertices.len(), 3);
    }

    #[test]
    fn outside_triangle_clips_away() {
        let input = triangle(
            DVec3::new(20.0, 20.0, 0.0),
            DVec3::new(30.0, 20.0, 0.0),
            DVec3::new(20.0, 30.0, 0.0),
        );
        let extents = Extents2::new(0.0, 0.0, 10.0, 10.0);
        assert!(clip_and_refine(&input, &extents, &Identity).is_none());
    }

    #[test]
    fn straddling_triangle_is_cut() {
        let input = triangle(
            DVec3::new(-5.0, 1.0, 0.0),
            DVec3::new(5.0, 1.0, 0.0),
            DVec3::new(-5.0, 9.0, 0.0),
        );
        let extents = Extents2::new(0.0, 0.0, 10.0, 10.0);
        let out = clip_and_refine(&input, &extents, &Identity).unwrap();
        assert!(!out.mesh.faces.is_empty());
        for v in &out.mesh.vertices {
            assert!(v.x >= -1e-9 && v.x <= 10.0 + 1e-9);
        }
        // the cut edge introduces new vertices
        assert!(out.mesh.vertices.len() > 3);
    }

    #[test]
    fn interpolates_z_across_cut() {
        let input = triangle(
            DVec3::new(-10.0, 0.0, 0.0),
            DVec3::new(10.0, 0.0, 100.0),
            DVec3::new(0.0, 10.0, 50.0),
        );
        let extents = Extents2::new(0.0, -5.0, 20.0, 15.0);
        let out = clip_and_refine(&input, &extents, &Identity).unwrap();
        // the vertex cut at x = 0 along the bottom edge sits at z = 50
        let cut = out
            .mesh
            .vertices
            .iter()
            .find(|v| v.x.abs() < 1e-9 && v.y.abs() < 1e-9)
            .expect("cut vertex on the boundary");
        assert!((cut.z - 50.0).abs() < 1e-9);
    }

    #[test]
    fn refinement_quadruples_faces() {
        let input = triangle(
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(8.0, 0.0, 0.0),
            DVec3::new(0.0, 8.0, 0.0),
        );
        let extents = Extents2::new(-1.0, -1.0, 10.0, 10.0);
        let out = clip_and_refine(&input, &extents, &Refine(16)).unwrap();
        assert_eq!(out.mesh.faces.len(), 16);

        // refinement stays inside the original footprint
        for v in &out.mesh.vertices {
            assert!(v.x >= -1e-9 && v.y >= -1e-9 && v.x + v.y <= 8.0 + 1e-9);
        }
    }

    #[test]
    fn rasterize_covers_expected_cells() {
        let mut cells = Vec::new();
        rasterize_triangle(
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(4.0, 0.0, 0.0),
            DVec3::new(0.0, 4.0, 0.0),
            8,
            8,
            |x, y| cells.push((x, y)),
        );
        assert!(cells.contains(&(0, 0)));
        assert!(cells.contains(&(1, 1)));
        assert!(cells.contains(&(4, 0)));
        assert!(!cells.contains(&(4, 4)));
    }

    #[test]
    fn rasterize_thin_triangle_hits_vertices() {
        let mut cells = Vec::new();
        rasterize_triangle(
            DVec3::new(2.2, 2.2, 0.0),
            DVec3::new(2.25, 2.2, 0.0),
            DVec3::new(2.2, 2.25, 0.0),
            8,
            8,
            |x, y| cells.push((x, y)),
        );
        assert!(cells.contains(&(2, 2)));
    }
}
