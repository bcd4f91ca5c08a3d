//! Tile mesh model and codec.
//!
//! A tile mesh is a list of submeshes plus a 256x256 coverage mask
//! recording which pixels of the tile footprint are filled by geometry.
//! Vertices live in the physical SRS; internal texture coordinates index
//! the tile's own atlas, external texture coordinates map into bound
//! layers.

use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::{DVec2, DVec3};

use crate::error::{Result, TileStoreError};
use crate::math::Extents3;
use crate::multifile;
use crate::rastermask::BitMask;

const MAGIC: [u8; 2] = *b"ME";
const VERSION: u16 = 1;

/// Coverage raster order: the mask is `2^8 = 256` pixels per edge.
pub const COVERAGE_ORDER: u8 = 8;

/// Edge length of the coverage raster.
pub fn coverage_size() -> u32 {
    1 << COVERAGE_ORDER
}

/// Triangle as indices into the vertex (or texture-coordinate) buffers.
pub type Face = [u32; 3];

/// One textured patch of a tile mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct SubMesh {
    pub vertices: Vec<DVec3>,
    /// Internal texture coordinates (empty if none).
    pub tc: Vec<DVec2>,
    /// Per-vertex external texture coordinates (empty or parallel to
    /// `vertices`).
    pub etc: Vec<DVec2>,
    pub faces: Vec<Face>,
    /// Indices into `tc`, parallel to `faces` (empty if untextured).
    pub faces_tc: Vec<Face>,
    /// Bound layer id for external texturing.
    pub texture_layer: Option<u16>,
    /// Texture resolution scale accumulated by merges.
    pub uv_area_scale: f64,
    /// 1-based source surface in a glue, 0 when native.
    pub surface_reference: u8,
}

impl Default for SubMesh {
    fn default() -> Self {
        SubMesh {
            vertices: Vec::new(),
            tc: Vec::new(),
            etc: Vec::new(),
            faces: Vec::new(),
            faces_tc: Vec::new(),
            texture_layer: None,
            uv_area_scale: 1.0,
            surface_reference: 0,
        }
    }
}

impl SubMesh {
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn has_internal_texture(&self) -> bool {
        !self.tc.is_empty()
    }

    pub fn has_external_texture(&self) -> bool {
        !self.etc.is_empty()
    }

    /// Copy everything except geometry buffers.
    pub fn clone_metadata_into(&self, other: &mut SubMesh) {
        other.texture_layer = self.texture_layer;
        other.uv_area_scale = self.uv_area_scale;
        other.surface_reference = self.surface_reference;
    }

    /// Mesh area (physical units squared) and internal texture area
    /// (normalized texture space).
    pub fn area(&self) -> (f64, f64) {
        let mesh: f64 = self
            .faces
            .iter()
            .map(|f| {
                let a = self.vertices[f[0] as usize];
                let b = self.vertices[f[1] as usize];
                let c = self.vertices[f[2] as usize];
                (b - a).cross(c - a).length() * 0.5
            })
            .sum();
        let texture: f64 = self
            .faces_tc
            .iter()
            .map(|f| {
                let a = self.tc[f[0] as usize];
                let b = self.tc[f[1] as usize];
                let c = self.tc[f[2] as usize];
                ((b - a).perp_dot(c - a) * 0.5).abs()
            })
            .sum();
        (mesh, texture)
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Mesh {
            submeshes: Vec::new(),
            coverage_mask: BitMask::full(COVERAGE_ORDER),
        }
    }
}

/// A tile mesh: submeshes plus coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub submeshes: Vec<SubMesh>,
    pub coverage_mask: BitMask,
}

impl Mesh {
    /// Mesh with an empty coverage mask (merge output starts blank).
    pub fn with_empty_mask() -> Self {
        Mesh {
            submeshes: Vec::new(),
            coverage_mask: BitMask::empty(COVERAGE_ORDER),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.submeshes.iter().all(|sm| sm.is_empty())
    }

    pub fn len(&self) -> usize {
        self.submeshes.len()
    }

    /// Append a submesh and return a handle to it.
    pub fn add(&mut self, submesh: SubMesh) -> &mut SubMesh {
        self.submeshes.push(submesh);
        self.submeshes.last_mut().unwrap()
    }

    /// A watertight mesh covers its whole tile footprint.
    pub fn watertight(&self) -> bool {
        self.coverage_mask.is_full()
    }

    /// Physical extents of all submesh vertices.
    pub fn extents(&self) -> Extents3 {
        let mut extents = Extents3::invalid();
        for sm in &self.submeshes {
            for v in &sm.vertices {
                extents.update(*v);
            }
        }
        extents
    }

    /// Summed mesh area and per-submesh internal texture areas.
    pub fn area(&self) -> (f64, Vec<f64>) {
        let mut mesh_area = 0.0;
        let mut texture = Vec::with_capacity(self.submeshes.len());
        for sm in &self.submeshes {
            let (m, t) = sm.area();
            mesh_area += m;
            texture.push(t);
        }
        (mesh_area, texture)
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        let mut builder = multifile::Builder::new(MAGIC, VERSION);
        builder.add_part_with(|out| {
            out.write_u16::<LittleEndian>(self.submeshes.len() as u16)?;
            for sm in &self.submeshes {
                save_submesh(out, sm)?;
            }
            Ok(())
        })?;
        builder.add_part_with(|out| self.coverage_mask.write(out))?;
        Ok(builder.finish())
    }

    pub fn load(data: &[u8], path: &Path) -> Result<Mesh> {
        let table = multifile::read_table(data, MAGIC, VERSION, path)?;
        table.check_parts(2, path)?;

        let mut body = multifile::part_slice(data, table.parts[0]);
        let count = body.read_u16::<LittleEndian>()? as usize;
        let mut submeshes = Vec::with_capacity(count);
        for _ in 0..count {
            submeshes.push(load_submesh(&mut body, path)?);
        }

        let mut mask_part = multifile::part_slice(data, table.parts[1]);
        let coverage_mask = BitMask::read(&mut mask_part)?;
        if coverage_mask.order() != COVERAGE_ORDER {
            return Err(TileStoreError::bad_file(path, "unexpected coverage order"));
        }

        Ok(Mesh {
            submeshes,
            coverage_mask,
        })
    }
}

fn save_submesh(out: &mut Vec<u8>, sm: &SubMesh) -> Result<()> {
    let mut flags = 0u8;
    if sm.has_internal_texture() {
        flags |= 0x01;
    }
    if sm.has_external_texture() {
        flags |= 0x02;
    }
    if sm.texture_layer.is_some() {
        flags |= 0x04;
    }
    out.write_u8(flags)?;
    if let Some(layer) = sm.texture_layer {
        out.write_u16::<LittleEndian>(layer)?;
    }
    out.write_f64::<LittleEndian>(sm.uv_area_scale)?;
    out.write_u8(sm.surface_reference)?;

    out.write_u32::<LittleEndian>(sm.vertices.len() as u32)?;
    for v in &sm.vertices {
        out.write_f64::<LittleEndian>(v.x)?;
        out.write_f64::<LittleEndian>(v.y)?;
        out.write_f64::<LittleEndian>(v.z)?;
    }
    if sm.has_external_texture() {
        for t in &sm.etc {
            out.write_f64::<LittleEndian>(t.x)?;
            out.write_f64::<LittleEndian>(t.y)?;
        }
    }
    if sm.has_internal_texture() {
        out.write_u32::<LittleEndian>(sm.tc.len() as u32)?;
        for t in &sm.tc {
            out.write_f64::<LittleEndian>(t.x)?;
            out.write_f64::<LittleEndian>(t.y)?;
        }
    }
    out.write_u32::<LittleEndian>(sm.faces.len() as u32)?;
    for f in &sm.faces {
        for i in f {
            out.write_u32::<LittleEndian>(*i)?;
        }
    }
    if sm.has_internal_texture() {
        for f in &sm.faces_tc {
            for i in f {
                out.write_u32::<LittleEndian>(*i)?;
            }
        }
    }
    Ok(())
}

fn load_submesh(input: &mut &[u8], path: &Path) -> Result<SubMesh> {
    let flags = input.read_u8()?;
    let texture_layer = if flags & 0x04 != 0 {
        Some(input.read_u16::<LittleEndian>()?)
    } else {
        None
    };
    let uv_area_scale = input.read_f64::<LittleEndian>()?;
    let surface_reference = input.read_u8()?;

    let vertex_count = input.read_u32::<LittleEndian>()? as usize;
    let mut vertices = Vec::with_capacity(vertex_count);
    for _ in 0..vertex_count {
        let x = input.read_f64::<LittleEndian>()?;
        let y = input.read_f64::<LittleEndian>()?;
        let z = input.read_f64::<LittleEndian>()?;
        vertices.push(DVec3::new(x, y, z));
    }

    let mut etc = Vec::new();
    if flags & 0x02 != 0 {
        etc.reserve(vertex_count);
        for _ in 0..vertex_count {
            let x = input.read_f64::<LittleEndian>()?;
            let y = input.read_f64::<LittleEndian>()?;
            etc.push(DVec2::new(x, y));
        }
    }

    let mut tc = Vec::new();
    if flags & 0x01 != 0 {
        let tc_count = input.read_u32::<LittleEndian>()? as usize;
        tc.reserve(tc_count);
        for _ in 0..tc_count {
            let x = input.read_f64::<LittleEndian>()?;
            let y = input.read_f64::<LittleEndian>()?;
            tc.push(DVec2::new(x, y));
        }
    }

    let face_count = input.read_u32::<LittleEndian>()? as usize;
    let read_faces = |input: &mut &[u8], n: usize| -> Result<Vec<Face>> {
        let mut faces = Vec::with_capacity(n);
        for _ in 0..n {
            let a = input.read_u32::<LittleEndian>()?;
            let b = input.read_u32::<LittleEndian>()?;
            let c = input.read_u32::<LittleEndian>()?;
            faces.push([a, b, c]);
        }
        Ok(faces)
    };
    let faces = read_faces(input, face_count)?;
    let faces_tc = if flags & 0x01 != 0 {
        read_faces(input, face_count)?
    } else {
        Vec::new()
    };

    for f in &faces {
        if f.iter().any(|&i| i as usize >= vertex_count) {
            return Err(TileStoreError::bad_file(path, "face index out of range"));
        }
    }
    for f in &faces_tc {
        if f.iter().any(|&i| i as usize >= tc.len()) {
            return Err(TileStoreError::bad_file(
                path,
                "texture face index out of range",
            ));
        }
    }

    Ok(SubMesh {
        vertices,
        tc,
        etc,
        faces,
        faces_tc,
        texture_layer,
        uv_area_scale,
        surface_reference,
    })
}
