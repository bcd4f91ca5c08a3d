//! Merge engine: produce one composite tile from a ranked stack of source
//! tiles covering the same quad-tree node.
//!
//! Sources are ordered bottom-of-stack first. A 256x256 coverage raster is
//! painted bottom-up with each source's footprint, so every pixel ends up
//! owning the id of its top-most contributor. Mesh faces of a contributor
//! survive only where the raster kept its id; holes stay unfilled.

use std::collections::BTreeSet;
use std::sync::Arc;

use glam::{DVec2, DVec3};
use tracing::debug;

use crate::atlas::RawAtlas;
use crate::error::Result;
use crate::math::{Extents2, Extents3};
use crate::mesh::{self, Mesh, SubMesh};
use crate::meshop::{self, EnhancedSubMesh, MeshVertexConvertor};
use crate::meta::MetaNode;
use crate::navtile::NavTile;
use crate::index::TileFlags;
use crate::registry::NodeInfo;
use crate::tile::{local, Lod, LodRange, TileId};

use super::{Tile, TileSet};

/// Stack position of a source tileset.
pub type InputId = usize;

/// One contributing source tile.
#[derive(Debug, Clone)]
pub struct Input {
    id: InputId,
    tileset_id: String,
    tile_id: TileId,
    flags: u8,
    node: MetaNode,
    mesh: Option<Mesh>,
    atlas: Option<RawAtlas>,
    navtile: Option<NavTile>,
    mergeable_range: LodRange,
}

/// Shared handle; inputs are inherited down the merge recursion.
pub type InputList = Vec<Arc<Input>>;

impl Input {
    /// Load the tile `tile_id` of `tileset` as merge input number `id`.
    ///
    /// Returns `None` when the tileset has no metanode there.
    pub fn load(id: InputId, tileset: &TileSet, tile_id: TileId) -> Result<Option<Arc<Input>>> {
        let flags = tileset.tile_flags(tile_id);
        let node = match tileset.get_meta_node(tile_id) {
            Ok(node) => node,
            Err(crate::error::TileStoreError::NoSuchTile(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut mergeable_range = tileset.properties().lod_range;
        if let Some(bottom) = tileset.properties().merge_bottom_lod {
            mergeable_range.max = bottom;
        }

        let mut input = Input {
            id,
            tileset_id: tileset.id().to_string(),
            tile_id,
            flags,
            node,
            mesh: None,
            atlas: None,
            navtile: None,
            mergeable_range,
        };
        if flags & TileFlags::REAL.bits() != 0 {
            let tile = tileset.get_tile(tile_id)?;
            input.mesh = tile.mesh;
            input.atlas = tile.atlas;
            input.navtile = tile.navtile;
        }
        Ok(Some(Arc::new(input)))
    }

    pub fn id(&self) -> InputId {
        self.id
    }

    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    pub fn name(&self) -> &str {
        &self.tileset_id
    }

    pub fn node(&self) -> &MetaNode {
        &self.node
    }

    pub fn has_mesh(&self) -> bool {
        self.flags & TileFlags::MESH.bits() != 0 && self.mesh.is_some()
    }

    pub fn has_atlas(&self) -> bool {
        self.flags & TileFlags::ATLAS.bits() != 0 && self.atlas.is_some()
    }

    pub fn has_navtile(&self) -> bool {
        self.flags & TileFlags::NAVTILE.bits() != 0 && self.navtile.is_some()
    }

    pub fn watertight(&self) -> bool {
        self.flags & TileFlags::WATERTIGHT.bits() != 0
    }

    fn mesh(&self) -> &Mesh {
        self.mesh.as_ref().expect("mesh checked by caller")
    }

    fn in_mergeable_range(&self, lod: Lod) -> bool {
        self.mergeable_range.contains(lod)
    }
}

/// The sources one output tile was (or would be) assembled from.
#[derive(Debug, Clone, Default)]
pub struct TileSource {
    pub mesh: InputList,
    pub navtile: InputList,
}

/// Merge result for one tile.
#[derive(Debug)]
pub struct Output {
    pub tile_id: TileId,
    pub mesh: Option<Mesh>,
    pub atlas: Option<RawAtlas>,
    pub navtile: Option<NavTile>,
    /// Physical extents of the composed geometry.
    pub geom_extents: Extents3,
    /// Sources that actually contribute.
    pub source: TileSource,
}

impl Output {
    fn new(tile_id: TileId) -> Self {
        Output {
            tile_id,
            mesh: None,
            atlas: None,
            navtile: None,
            geom_extents: Extents3::invalid(),
            source: TileSource::default(),
        }
    }

    fn with_sources(tile_id: TileId, mesh: InputList, navtile: InputList) -> Self {
        Output {
            source: TileSource { mesh, navtile },
            ..Output::new(tile_id)
        }
    }

    /// Whether a composite tile was actually produced.
    pub fn has_tile(&self) -> bool {
        self.mesh.is_some()
    }

    /// Whether mesh source `index` is an ancestor tile (not at this lod).
    pub fn derived(&self, index: usize) -> bool {
        self.source.mesh[index].tile_id.lod != self.tile_id.lod
    }

    /// Whether every mesh source is an ancestor tile.
    pub fn fully_derived(&self) -> bool {
        (0..self.source.mesh.len()).all(|i| self.derived(i))
    }

    fn force_mesh(&mut self) -> &mut Mesh {
        self.mesh.get_or_insert_with(Mesh::with_empty_mask)
    }

    fn force_atlas(&mut self) -> &mut RawAtlas {
        self.atlas.get_or_insert_with(RawAtlas::new)
    }

    /// Package the result as a tile, uniting credits from all mesh
    /// sources.
    pub fn tile(&self) -> Tile {
        let mut credits: BTreeSet<u16> = BTreeSet::new();
        for input in &self.source.mesh {
            credits.extend(input.node.credits().iter().copied());
        }
        Tile {
            mesh: self.mesh.clone(),
            atlas: self.atlas.clone(),
            navtile: self.navtile.clone(),
            credits,
            alien: false,
        }
    }
}

/// Caller-supplied merge gates.
pub trait MergeConstraints {
    /// Whether an output tile should be generated at all (otherwise only
    /// sources are computed).
    fn generable(&self) -> bool;

    /// Whether a navtile should be composed.
    fn generate_navtile(&self) -> bool {
        false
    }

    /// Early-out once contributing sources are known.
    fn feasible(&self, _output: &Output) -> bool {
        true
    }
}

/// Unconstrained merge.
pub struct NoConstraints {
    pub navtile: bool,
}

impl MergeConstraints for NoConstraints {
    fn generable(&self) -> bool {
        true
    }
    fn generate_navtile(&self) -> bool {
        self.navtile
    }
}

/// Coverage raster edge length.
fn raster_size() -> u32 {
    mesh::coverage_size()
}

/// Geo coordinates to coverage raster; pixel centers at integral indices.
fn geo_to_mask(extents: &Extents2, p: DVec3) -> DVec3 {
    let size = extents.size();
    let grid = raster_size() as f64;
    let scale = DVec2::new(grid / size.x, grid / size.y);
    DVec3::new(
        p.x * scale.x - extents.ll.x * scale.x - 0.5,
        -p.y * scale.y + extents.ur.y * scale.y - 0.5,
        p.z,
    )
}

/// Coverage raster to geo coordinates.
fn mask_to_geo(extents: &Extents2, p: DVec3) -> DVec3 {
    let size = extents.size();
    let grid = raster_size() as f64;
    let scale = DVec2::new(size.x / grid, size.y / grid);
    DVec3::new(
        p.x * scale.x + extents.ll.x + 0.5 * scale.x,
        -p.y * scale.y + extents.ur.y - 0.5 * scale.y,
        p.z,
    )
}

/// Coverage coordinate to normalized external texture coordinates.
fn coverage_to_etc(p: DVec3) -> DVec2 {
    let grid = raster_size() as f64;
    DVec2::new((p.x + 0.5) / grid, 1.0 - (p.y + 0.5) / grid)
}

/// Clip rectangle: the tile's unit square inflated by `margin` pixels.
fn coverage_extents(margin: f64) -> Extents2 {
    let grid = raster_size() as f64;
    Extents2::new(-0.5 - margin, -0.5 - margin, grid - 0.5 + margin, grid - 0.5 + margin)
}

/// Mesh vertices of one input, converted into the target tile's coverage
/// space (one vector per submesh).
fn input_coverage_vertices(input: &Input, node_info: &NodeInfo) -> Vec<Vec<DVec3>> {
    input
        .mesh()
        .submeshes
        .iter()
        .map(|sm| {
            sm.vertices
                .iter()
                .map(|v| geo_to_mask(&node_info.extents, *v))
                .collect()
        })
        .collect()
}

/// Union of current and parent input lists; only inputs accepted by
/// `include` survive. When an input exists at both levels the current one
/// wins while inside its tileset's mergeable range.
fn merge_source(
    current: &InputList,
    parent: &InputList,
    include: impl Fn(&Input) -> bool,
) -> InputList {
    let mut out = InputList::new();
    let mut ic = current.iter().peekable();
    let mut ip = parent.iter().peekable();

    loop {
        match (ic.peek(), ip.peek()) {
            (Some(c), Some(p)) => {
                if c.id < p.id {
                    if include(c) {
                        out.push(Arc::clone(c));
                    }
                    ic.next();
                } else if p.id < c.id {
                    if include(p) {
                        out.push(Arc::clone(p));
                    }
                    ip.next();
                } else {
                    let take_current = include(c);
                    let take_parent = include(p);
                    if take_current && take_parent {
                        if c.in_mergeable_range(c.tile_id.lod) {
                            out.push(Arc::clone(c));
                        } else {
                            out.push(Arc::clone(p));
                        }
                    } else if take_current {
                        out.push(Arc::clone(c));
                    } else if take_parent {
                        out.push(Arc::clone(p));
                    }
                    ic.next();
                    ip.next();
                }
            }
            (Some(c), None) => {
                if include(c) {
                    out.push(Arc::clone(c));
                }
                ic.next();
            }
            (None, Some(p)) => {
                if include(p) {
                    out.push(Arc::clone(p));
                }
                ip.next();
            }
            (None, None) => break,
        }
    }
    out
}

/// Keep only inputs whose id also appears in `reference`.
fn filter_sources(reference: &InputList, sources: &InputList) -> InputList {
    let ids: BTreeSet<InputId> = reference.iter().map(|i| i.id).collect();
    sources
        .iter()
        .filter(|i| ids.contains(&i.id))
        .cloned()
        .collect()
}

/// The coverage raster: which source owns each pixel.
struct Coverage {
    raster: Vec<i16>,
    size: u32,
    has_holes: bool,
    indices: Vec<bool>,
    single: Option<InputId>,
}

impl Coverage {
    fn new(tile_id: TileId, sources: &InputList) -> Coverage {
        let size = raster_size();
        let mut coverage = Coverage {
            raster: vec![-1; (size * size) as usize],
            size,
            has_holes: false,
            indices: vec![false; sources.last().map(|s| s.id + 1).unwrap_or(0)],
            single: None,
        };
        coverage.generate(tile_id, sources);
        coverage.analyze(sources);
        coverage
    }

    fn generate(&mut self, tile_id: TileId, sources: &InputList) {
        if sources.is_empty() {
            return;
        }
        // skip everything below the top-most watertight input
        let start = sources
            .iter()
            .rposition(|input| input.watertight())
            .unwrap_or(0);

        if start == sources.len() - 1 && sources[start].watertight() {
            // single watertight top: full coverage, no scanning
            let id = sources[start].id;
            self.raster.fill(id as i16);
            self.indices[id] = true;
            self.single = Some(id);
            return;
        }

        for input in &sources[start..] {
            let diff = local(input.tile_id.lod, tile_id);
            self.rasterize(input, diff);
        }
    }

    /// Paint one input's footprint, scaled and shifted for ancestor
    /// tiles.
    fn rasterize(&mut self, input: &Input, diff: TileId) {
        let pixel_size = 1u64 << diff.lod;
        let offset = (
            diff.x as i64 * self.size as i64,
            diff.y as i64 * self.size as i64,
        );
        let id = input.id as i16;

        debug!(
            tile = %input.tile_id,
            diff = %diff,
            watertight = input.watertight(),
            "Rasterizing coverage"
        );

        let size = self.size;
        let mut draw = |x: u32, y: u32, quad: u32| {
            let x0 = (x as i64 * pixel_size as i64) - offset.0;
            let y0 = (y as i64 * pixel_size as i64) - offset.1;
            let x1 = x0 + quad as i64 * pixel_size as i64;
            let y1 = y0 + quad as i64 * pixel_size as i64;
            let x0 = x0.clamp(0, size as i64);
            let y0 = y0.clamp(0, size as i64);
            let x1 = x1.clamp(0, size as i64);
            let y1 = y1.clamp(0, size as i64);
            for row in y0..y1 {
                let base = (row * size as i64) as usize;
                for col in x0..x1 {
                    self.raster[base + col as usize] = id;
                }
            }
        };

        if input.watertight() {
            draw(0, 0, size);
            return;
        }
        input
            .mesh()
            .coverage_mask
            .for_each_set_quad(|x, y, quad| draw(x, y, quad));
    }

    fn analyze(&mut self, sources: &InputList) {
        if self.single.is_some() {
            return;
        }
        for &pixel in &self.raster {
            if pixel < 0 {
                self.has_holes = true;
            } else {
                self.indices[pixel as usize] = true;
            }
        }

        // a top-level tile with an empty mask still has to take part,
        // otherwise its (empty) original would shadow the glue
        if let Some(top) = sources.last() {
            if top.has_mesh() && top.mesh().coverage_mask.is_empty() {
                self.indices[top.id] = true;
                self.has_holes = true;
            }
        }

        let mut single = None;
        let mut count = 0;
        for (id, &present) in self.indices.iter().enumerate() {
            if present {
                single = Some(id);
                count += 1;
            }
        }
        self.single = if count == 1 { single } else { None };
    }

    /// Record which sources actually appear into `output`.
    fn get_sources(&self, output: &mut Output, sources: &InputList, navtile_source: &InputList) {
        for input in sources {
            if self.indices[input.id] {
                output.source.mesh.push(Arc::clone(input));
            }
        }
        output.source.navtile = filter_sources(&output.source.mesh, navtile_source);
    }

    /// Whether `face` (in coverage-space vertices) touches a pixel owned
    /// by `id`. Returns `(covered, inside_raster)`.
    fn covered(&self, face: &[u32; 3], vertices: &[DVec3], id: InputId) -> (bool, bool) {
        let mut covered = false;
        let mut inside = false;
        meshop::rasterize_triangle(
            vertices[face[0] as usize],
            vertices[face[1] as usize],
            vertices[face[2] as usize],
            self.size,
            self.size,
            |x, y| {
                inside = true;
                if self.raster[(y * self.size + x) as usize] == id as i16 {
                    covered = true;
                }
            },
        );
        (covered, inside)
    }
}

/// Converts coverage-space output back to tile attributes.
struct SdMeshConvertor<'a> {
    node_info: &'a NodeInfo<'a>,
    lod_diff: Lod,
    face_limit: usize,
}

impl MeshVertexConvertor for SdMeshConvertor<'_> {
    fn vertex(&self, projected: DVec3) -> DVec3 {
        mask_to_geo(&self.node_info.extents, projected)
    }

    fn etc(&self, projected: DVec3) -> DVec2 {
        coverage_to_etc(projected)
    }

    fn refine_to_face_count(&self, current: usize) -> usize {
        if self.lod_diff == 0 {
            return current;
        }
        let exponent = 2 * self.lod_diff.min(8) as u32;
        let scaled = current << exponent;
        scaled.min(self.face_limit.max(current))
    }
}

/// Faces of one submesh that survive the coverage filter.
struct MeshFilter {
    result: EnhancedSubMesh,
    incident: usize,
    original_faces: usize,
}

impl MeshFilter {
    fn new(
        submesh: &SubMesh,
        projected: &[DVec3],
        input: &Input,
        coverage: &Coverage,
        clip: bool,
    ) -> MeshFilter {
        let mut kept_faces = Vec::new();
        let mut kept_tc = Vec::new();
        let mut incident = 0usize;

        for (fi, face) in submesh.faces.iter().enumerate() {
            let keep = if clip {
                let (covered, inside) = coverage.covered(face, projected, input.id);
                incident += inside as usize;
                covered
            } else {
                incident += 1;
                true
            };
            if keep {
                kept_faces.push(*face);
                if let Some(tc_face) = submesh.faces_tc.get(fi) {
                    kept_tc.push(*tc_face);
                }
            }
        }

        // compact vertex/tc buffers to the kept faces
        let mut vertex_map = vec![u32::MAX; submesh.vertices.len()];
        let mut tc_map = vec![u32::MAX; submesh.tc.len()];
        let mut mesh = SubMesh::default();
        submesh.clone_metadata_into(&mut mesh);
        let mut out_projected = Vec::new();

        for face in &mut kept_faces {
            for index in face.iter_mut() {
                let slot = &mut vertex_map[*index as usize];
                if *slot == u32::MAX {
                    *slot = mesh.vertices.len() as u32;
                    mesh.vertices.push(submesh.vertices[*index as usize]);
                    if !submesh.etc.is_empty() {
                        mesh.etc.push(submesh.etc[*index as usize]);
                    }
                    out_projected.push(projected[*index as usize]);
                }
                *index = *slot;
            }
        }
        for face in &mut kept_tc {
            for index in face.iter_mut() {
                let slot = &mut tc_map[*index as usize];
                if *slot == u32::MAX {
                    *slot = mesh.tc.len() as u32;
                    mesh.tc.push(submesh.tc[*index as usize]);
                }
                *index = *slot;
            }
        }
        mesh.faces = kept_faces;
        mesh.faces_tc = kept_tc;

        MeshFilter {
            result: EnhancedSubMesh {
                mesh,
                projected: out_projected,
            },
            incident,
            original_faces: submesh.faces.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.result.mesh.faces.is_empty()
    }

    /// Refinement budget: scale the survivor count by the share of the
    /// original mesh that fell inside the raster.
    fn max_refined_face_count(&self) -> usize {
        if self.incident == 0 {
            return self.result.mesh.faces.len();
        }
        self.original_faces * self.result.mesh.faces.len() / self.incident
    }
}

/// Append a filtered submesh (with its atlas image) to the output.
fn add_to_output(
    output: &mut Output,
    input: &Input,
    submesh_index: usize,
    enhanced: EnhancedSubMesh,
    uv_area_scale: f64,
) {
    if input.has_atlas() {
        if let Some(atlas) = &input.atlas {
            if atlas.valid(submesh_index) {
                output
                    .force_atlas()
                    .add(atlas.get(submesh_index).unwrap_or(&[]).to_vec());
            }
        }
    }

    let EnhancedSubMesh { mut mesh, projected } = enhanced;
    mesh.uv_area_scale = uv_area_scale;
    mesh.surface_reference = (input.id + 1) as u8;

    for v in &mesh.vertices {
        output.geom_extents.update(*v);
    }

    let out_mesh = output.force_mesh();
    let size = out_mesh.coverage_mask.dims();
    for face in &mesh.faces {
        meshop::rasterize_triangle(
            projected[face[0] as usize],
            projected[face[1] as usize],
            projected[face[2] as usize],
            size,
            size,
            |x, y| out_mesh.coverage_mask.set(x, y, true),
        );
    }
    out_mesh.add(mesh);
}

/// Merge the navtiles of the (separately merged) navtile source list.
fn merge_navtile(output: &mut Output) {
    let mut composed = NavTile::new();
    let mut any = false;
    for input in &output.source.navtile {
        let Some(navtile) = &input.navtile else {
            continue;
        };
        let rendered = if input.tile_id.lod < output.tile_id.lod {
            navtile.for_child(local(input.tile_id.lod, output.tile_id))
        } else {
            navtile.clone()
        };
        composed.overlay(&rendered);
        any = true;
    }
    if any && !composed.is_empty() {
        output.navtile = Some(composed);
    }
}

/// Produce the output from a single contributing source: verbatim copy at
/// the same lod, clip + reproject for ancestors.
fn single_sourced(
    tile_id: TileId,
    node_info: &NodeInfo,
    input: &Arc<Input>,
    navtile_source: InputList,
    generate_navtile: bool,
) -> Output {
    let mut result = Output::with_sources(tile_id, vec![Arc::clone(input)], navtile_source);

    if input.tile_id.lod == tile_id.lod {
        // as is: copy, stamping surface references
        let mut mesh = input.mesh().clone();
        for sm in &mut mesh.submeshes {
            sm.surface_reference = (input.id + 1) as u8;
        }
        result.geom_extents = mesh.extents();
        result.mesh = Some(mesh);
        if input.has_atlas() {
            result.atlas = input.atlas.clone();
        }
        if input.has_navtile() {
            result.navtile = input.navtile.clone();
        }
        if generate_navtile {
            merge_navtile(&mut result);
        }
        return result;
    }

    // derived tile: cut out this tile's square
    let local_id = local(input.tile_id.lod, tile_id);
    let coverage_vertices = input_coverage_vertices(input, node_info);
    let convertor = SdMeshConvertor {
        node_info,
        lod_diff: 0,
        face_limit: 0,
    };
    let uv_area_scale = (1u64 << (2 * local_id.lod)) as f64;

    for (index, submesh) in input.mesh().submeshes.iter().enumerate() {
        let enhanced = EnhancedSubMesh {
            mesh: submesh.clone(),
            projected: coverage_vertices[index].clone(),
        };
        if let Some(refined) =
            meshop::clip_and_refine(&enhanced, &coverage_extents(1.0), &convertor)
        {
            add_to_output(&mut result, input, index, refined, uv_area_scale);
        }
    }

    if generate_navtile {
        merge_navtile(&mut result);
    }
    result
}

/// Merge one tile from a ranked input list.
///
/// `current_source` holds inputs at exactly `tile_id` (stack order
/// ascending); `parent_source` carries the inputs the parent tile was
/// merged from, so unmerged ancestors fall through.
pub fn merge_tile(
    tile_id: TileId,
    node_info: &NodeInfo,
    current_source: &InputList,
    parent_source: &TileSource,
    constraints: &dyn MergeConstraints,
) -> Output {
    let source = merge_source(current_source, &parent_source.mesh, |i| i.has_mesh());
    let navtile_source =
        merge_source(current_source, &parent_source.navtile, |i| i.has_navtile());

    if !constraints.generable() {
        // just sources
        return Output::with_sources(tile_id, source, navtile_source);
    }

    if source.is_empty() {
        return Output::new(tile_id);
    }

    debug!(
        tile = %tile_id,
        sources = source.len(),
        "Merging tile"
    );

    if source.len() == 1 {
        let result = Output::with_sources(tile_id, source.clone(), navtile_source.clone());
        if !constraints.feasible(&result) {
            return result;
        }
        let navtile = filter_sources(&source, &navtile_source);
        return single_sourced(
            tile_id,
            node_info,
            &source[0],
            navtile,
            constraints.generate_navtile(),
        );
    }

    let mut result = Output::new(tile_id);
    let coverage = Coverage::new(tile_id, &source);
    coverage.get_sources(&mut result, &source, &navtile_source);

    if !constraints.feasible(&result) {
        return result;
    }

    if let Some(single) = coverage.single {
        let input = result
            .source
            .mesh
            .iter()
            .find(|i| i.id == single)
            .cloned()
            .expect("single contributor is in the source list");
        let navtile_source = result.source.navtile.clone();
        return single_sourced(
            tile_id,
            node_info,
            &input,
            navtile_source,
            constraints.generate_navtile(),
        );
    }

    // bottom (maximum) lod of all contributing inputs drives refinement
    let bottom_lod = result
        .source
        .mesh
        .iter()
        .map(|i| i.tile_id.lod)
        .max()
        .unwrap_or(tile_id.lod);

    let inputs = result.source.mesh.clone();
    for input in &inputs {
        let coverage_vertices = input_coverage_vertices(input, node_info);
        let tile_lod = input.tile_id.lod;
        let local_id = local(tile_lod, tile_id);

        for (index, submesh) in input.mesh().submeshes.iter().enumerate() {
            let filter = MeshFilter::new(
                submesh,
                &coverage_vertices[index],
                input,
                &coverage,
                true,
            );
            if filter.is_empty() {
                continue;
            }

            if local_id.lod == 0 {
                // same lod: add as is
                add_to_output(&mut result, input, index, filter.result, 1.0);
                continue;
            }

            // ancestor content: clip to this tile, refine, filter again
            let convertor = SdMeshConvertor {
                node_info,
                lod_diff: bottom_lod - tile_lod,
                face_limit: filter.max_refined_face_count(),
            };
            let Some(refined) =
                meshop::clip_and_refine(&filter.result, &coverage_extents(1.0), &convertor)
            else {
                continue;
            };
            let refiltered =
                MeshFilter::new(&refined.mesh, &refined.projected, input, &coverage, true);
            if refiltered.is_empty() {
                continue;
            }
            let uv_area_scale = (1u64 << (2 * local_id.lod)) as f64;
            add_to_output(&mut result, input, index, refiltered.result, uv_area_scale);
        }
    }

    if constraints.generate_navtile() {
        merge_navtile(&mut result);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::COVERAGE_ORDER;
    use crate::rastermask::BitMask;
    use crate::registry::Registry;
    use crate::tileset::{create_tile_set, CreateMode, TileSetProperties};
    use glam::DVec2;

    /// Build a source tileset with one square mesh tile covering the
    /// given half (or all) of tile `(lod, x, y)`.
    fn source_tileset(
        dir: &std::path::Path,
        id: &str,
        tile: TileId,
        region: Region,
        height: f64,
    ) -> TileSet {
        let frame = Registry::system().reference_frame("melown2015").unwrap();
        let info = NodeInfo::new(frame, tile).unwrap();
        let e = &info.extents;
        let size = e.size();

        let (llx, urx) = match region {
            Region::Left => (e.ll.x, e.ll.x + size.x * 0.5),
            Region::Right => (e.ll.x + size.x * 0.5, e.ur.x),
            Region::Full => (e.ll.x, e.ur.x),
        };

        let submesh = SubMesh {
            vertices: vec![
                DVec3::new(llx, e.ll.y, height),
                DVec3::new(urx, e.ll.y, height),
                DVec3::new(urx, e.ur.y, height),
                DVec3::new(llx, e.ur.y, height),
            ],
            tc: vec![
                DVec2::new(0.0, 0.0),
                DVec2::new(1.0, 0.0),
                DVec2::new(1.0, 1.0),
                DVec2::new(0.0, 1.0),
            ],
            faces: vec![[0, 1, 2], [0, 2, 3]],
            faces_tc: vec![[0, 1, 2], [0, 2, 3]],
            ..Default::default()
        };
        let mut mesh = Mesh::default();
        mesh.add(submesh);

        // coverage mask mirrors the mesh footprint
        mesh.coverage_mask = match region {
            Region::Full => BitMask::full(COVERAGE_ORDER),
            Region::Left => {
                let mut mask = BitMask::empty(COVERAGE_ORDER);
                for y in 0..256 {
                    for x in 0..128 {
                        mask.set(x, y, true);
                    }
                }
                mask
            }
            Region::Right => {
                let mut mask = BitMask::empty(COVERAGE_ORDER);
                for y in 0..256 {
                    for x in 128..256 {
                        mask.set(x, y, true);
                    }
                }
                mask
            }
        };

        let mut atlas = RawAtlas::new();
        atlas.add(crate::atlas::solid_jpeg(8, 8, 100));

        let mut ts = create_tile_set(
            &dir.join(id),
            &TileSetProperties::new(id, "melown2015"),
            CreateMode::FailIfExists,
        )
        .unwrap();
        ts.set_tile(
            tile,
            &Tile {
                mesh: Some(mesh),
                atlas: Some(atlas),
                navtile: Some(NavTile::flat(height as i16)),
                credits: [id.len() as u16].into_iter().collect(),
                alien: false,
            },
        )
        .unwrap();
        ts.flush().unwrap();
        ts
    }

    enum Region {
        Left,
        Right,
        Full,
    }

    fn node_info(tile: TileId) -> NodeInfo<'static> {
        let frame = Registry::system().reference_frame("melown2015").unwrap();
        NodeInfo::new(frame, tile).unwrap()
    }

    #[test]
    fn merge_two_non_overlapping_halves() {
        let dir = tempfile::tempdir().unwrap();
        let tile = TileId::new(5, 10, 10);

        let left = source_tileset(dir.path(), "left", tile, Region::Left, 0.0);
        let right = source_tileset(dir.path(), "right", tile, Region::Right, 10.0);

        let inputs: InputList = vec![
            Input::load(0, &left, tile).unwrap().unwrap(),
            Input::load(1, &right, tile).unwrap().unwrap(),
        ];

        let info = node_info(tile);
        let output = merge_tile(
            tile,
            &info,
            &inputs,
            &TileSource::default(),
            &NoConstraints { navtile: true },
        );

        assert!(output.has_tile());
        assert_eq!(output.source.mesh.len(), 2);

        // both sides contribute every face
        let mesh = output.mesh.as_ref().unwrap();
        let total_faces: usize = mesh.submeshes.iter().map(|sm| sm.faces.len()).sum();
        assert_eq!(total_faces, 4);

        // surface references follow stack positions
        let refs: BTreeSet<u8> = mesh.submeshes.iter().map(|sm| sm.surface_reference).collect();
        assert_eq!(refs, [1u8, 2u8].into_iter().collect());

        // navtile composed from both sources
        assert!(output.navtile.is_some());

        // credits united
        let tile_out = output.tile();
        assert_eq!(
            tile_out.credits,
            ["left".len() as u16, "right".len() as u16]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn watertight_top_shortcut_copies_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let tile = TileId::new(5, 10, 10);

        let low = source_tileset(dir.path(), "low", tile, Region::Left, 0.0);
        let top = source_tileset(dir.path(), "topx", tile, Region::Full, 50.0);

        let inputs: InputList = vec![
            Input::load(0, &low, tile).unwrap().unwrap(),
            Input::load(1, &top, tile).unwrap().unwrap(),
        ];

        let info = node_info(tile);
        let output = merge_tile(
            tile,
            &info,
            &inputs,
            &TileSource::default(),
            &NoConstraints { navtile: false },
        );

        // single-source optimization: only the top contributes
        assert_eq!(output.source.mesh.len(), 1);
        assert_eq!(output.source.mesh[0].id(), 1);

        let mesh = output.mesh.as_ref().unwrap();
        assert_eq!(mesh.submeshes.len(), 1);
        assert_eq!(mesh.submeshes[0].faces.len(), 2);
        assert_eq!(mesh.submeshes[0].surface_reference, 2);
        // verbatim copy keeps the vertices
        assert_eq!(mesh.submeshes[0].vertices.len(), 4);
    }

    #[test]
    fn coverage_pixels_resolve_by_stack_order() {
        let dir = tempfile::tempdir().unwrap();
        let tile = TileId::new(5, 10, 10);

        // both cover the full tile; the later one must own every pixel
        let bottom = source_tileset(dir.path(), "bottom", tile, Region::Full, 0.0);
        let top = source_tileset(dir.path(), "topy", tile, Region::Full, 9.0);

        let inputs: InputList = vec![
            Input::load(0, &bottom, tile).unwrap().unwrap(),
            Input::load(1, &top, tile).unwrap().unwrap(),
        ];

        let coverage = Coverage::new(tile, &inputs);
        assert_eq!(coverage.single, Some(1));
        assert!(coverage.raster.iter().all(|&p| p == 1));
    }

    #[test]
    fn parent_inputs_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        let parent_tile = TileId::new(4, 5, 5);
        let child_tile = TileId::new(5, 10, 10);

        let below = source_tileset(dir.path(), "below", parent_tile, Region::Full, 0.0);
        let input = Input::load(0, &below, parent_tile).unwrap().unwrap();

        let parent_source = TileSource {
            mesh: vec![Arc::clone(&input)],
            navtile: vec![input],
        };

        let info = node_info(child_tile);
        let output = merge_tile(
            child_tile,
            &info,
            &InputList::new(),
            &parent_source,
            &NoConstraints { navtile: true },
        );

        // the ancestor contributes a derived tile
        assert!(output.has_tile());
        assert!(output.derived(0));
        assert!(output.fully_derived());

        // clipped geometry stays within the child's extents, modulo the
        // one-pixel clip margin
        let child_info = node_info(child_tile);
        let pixel = child_info.extents.size().x / 256.0;
        let mesh = output.mesh.as_ref().unwrap();
        for sm in &mesh.submeshes {
            assert_eq!(sm.uv_area_scale, 4.0);
            for v in &sm.vertices {
                assert!(v.x >= child_info.extents.ll.x - 2.0 * pixel);
                assert!(v.x <= child_info.extents.ur.x + 2.0 * pixel);
            }
        }
        assert!(output.navtile.is_some());
    }

    #[test]
    fn merge_source_prefers_current_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let parent_tile = TileId::new(4, 5, 5);
        let child_tile = TileId::new(5, 10, 10);

        let ts = source_tileset(dir.path(), "both", parent_tile, Region::Full, 0.0);
        let parent_input = Input::load(0, &ts, parent_tile).unwrap().unwrap();

        let ts_child = source_tileset(dir.path(), "kid", child_tile, Region::Full, 1.0);
        let current_input = Input::load(0, &ts_child, child_tile).unwrap().unwrap();

        let merged = merge_source(
            &vec![Arc::clone(&current_input)],
            &vec![Arc::clone(&parent_input)],
            |i| i.has_mesh(),
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].tile_id(), child_tile);

        // outside the mergeable range the parent wins
        let mut out_of_range = (*current_input).clone();
        out_of_range.mergeable_range = LodRange::new(0, 4);
        let merged = merge_source(
            &vec![Arc::new(out_of_range)],
            &vec![parent_input],
            |i| i.has_mesh(),
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].tile_id(), parent_tile);
    }

    #[test]
    fn non_generable_returns_sources_only() {
        struct SourcesOnly;
        impl MergeConstraints for SourcesOnly {
            fn generable(&self) -> bool {
                false
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let tile = TileId::new(5, 10, 10);
        let ts = source_tileset(dir.path(), "only", tile, Region::Full, 0.0);
        let inputs: InputList = vec![Input::load(0, &ts, tile).unwrap().unwrap()];

        let info = node_info(tile);
        let output = merge_tile(tile, &info, &inputs, &TileSource::default(), &SourcesOnly);
        assert!(!output.has_tile());
        assert_eq!(output.source.mesh.len(), 1);
    }

    #[test]
    fn geo_mask_transforms_are_inverse() {
        let extents = Extents2::new(-100.0, -50.0, 100.0, 50.0);
        for p in [
            DVec3::new(-100.0, -50.0, 3.0),
            DVec3::new(0.0, 0.0, -2.0),
            DVec3::new(73.5, 12.25, 0.0),
        ] {
            let masked = geo_to_mask(&extents, p);
            let back = mask_to_geo(&extents, masked);
            assert!((back - p).length() < 1e-9, "{p:?} -> {masked:?} -> {back:?}");
        }

        // corners land on the half-open pixel borders
        let corner = geo_to_mask(&extents, DVec3::new(-100.0, 50.0, 0.0));
        assert!((corner.x + 0.5).abs() < 1e-12);
        assert!((corner.y + 0.5).abs() < 1e-12);
    }
}
