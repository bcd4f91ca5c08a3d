//! Glue generation: build the tileset that resolves overlap between an
//! ordered subset of surfaces.
//!
//! The generate set is computed from tile indices alone: the top surface's
//! rounded index, completed up and down, intersected with every lower
//! surface's completed trees. The merger then walks the quad-tree,
//! producing composite tiles where the stack genuinely overlaps and
//! reference tiles where a single lower surface wins.

use std::cmp::Ordering;

use tracing::{debug, info};

use crate::error::Result;
use crate::index::{self, TileFlags, TileIndex};
use crate::registry::NodeInfo;
use crate::tile::{children, TileId};

use super::merge::{self, Input, InputList, MergeConstraints, Output, TileSource};
use super::TileSet;

/// Generate one glue from `sets` (stack order, bottom first) into the
/// freshly created `glue` tileset. The caller flushes.
pub fn create_glue(glue: &mut TileSet, sets: &[&TileSet]) -> Result<()> {
    if sets.len() < 2 {
        info!(sets = sets.len(), "Too few sets to glue together");
        return Ok(());
    }

    info!(
        glue = %glue.id(),
        sets = ?sets.iter().map(|s| s.id()).collect::<Vec<_>>(),
        "Calculating glue generate set"
    );

    let indices: Vec<TileIndex> = sets
        .iter()
        .map(|set| set.tile_index().tile_index.simplify(TileFlags::MESH.bits()))
        .collect();

    let mut top = indices.last().unwrap().clone();
    top.round();
    let mut top_up = top.clone();
    top_up.complete();
    let mut top_down = top.clone();
    top_down.complete_down();

    let mut generate: Option<TileIndex> = None;
    for rest in &indices[..indices.len() - 1] {
        let mut rest_up = rest.clone();
        rest_up.complete();
        let mut rest_down = rest.clone();
        rest_down.complete_down();

        let i1 = index::intersect(&top_up, &rest_down);
        let i2 = index::intersect(&top_down, &rest_up);
        generate = Some(match generate {
            None => index::unite(&i1, &i2),
            Some(current) => index::unite(&index::unite(&current, &i1), &i2),
        });
    }
    let generate = generate.unwrap();

    if generate.is_empty() {
        info!(glue = %glue.id(), "Nothing to generate");
        return Ok(());
    }
    debug!(tiles = generate.count(0xff), "Generate set calculated");

    let mut world = generate.clone();
    world.complete();

    let root_info = NodeInfo::root(sets[0].reference_frame())?;
    let mut merger = Merger {
        glue,
        sets,
        world,
        generate,
        top_id: sets.len() - 1,
    };
    merger.merge_rec(&root_info, TileId::default(), &TileSource::default())?;

    // the glue inherits the top surface's position
    let position = sets.last().unwrap().properties().position;
    merger.glue.set_position(position)?;
    Ok(())
}

struct Merger<'a, 'b> {
    glue: &'a mut TileSet,
    sets: &'a [&'b TileSet],
    world: TileIndex,
    generate: TileIndex,
    top_id: usize,
}

struct GlueConstraints<'a> {
    generable: bool,
    top: &'a TileSet,
    top_id: usize,
    src_count: usize,
}

impl MergeConstraints for GlueConstraints<'_> {
    fn generable(&self) -> bool {
        self.generable
    }

    fn generate_navtile(&self) -> bool {
        true
    }

    fn feasible(&self, output: &Output) -> bool {
        is_glue_tile(self.top, self.top_id, self.src_count, output)
    }
}

/// Whether a merge output belongs into the glue at all.
fn is_glue_tile(top: &TileSet, top_id: usize, src_count: usize, output: &Output) -> bool {
    // already fully covered by the top set alone
    if top.fully_covered(output.tile_id) {
        return false;
    }

    let size = output.source.mesh.len();
    if size == 0 {
        return false;
    }

    if output.source.mesh[0].id() == top_id {
        // generated only from the top set: must be derived to matter
        return output.derived(0);
    }

    if size == src_count {
        return true;
    }

    if size + 1 == src_count {
        if output.source.mesh.last().map(|i| i.id()) == Some(top_id) {
            // contains the top set but not everything below it
            return false;
        }
        // tiles fully derived from lower sets cannot exist in other glues
        return output.fully_derived();
    }

    false
}

impl Merger<'_, '_> {
    fn merge_rec(
        &mut self,
        node_info: &NodeInfo,
        tile: TileId,
        parent_source: &TileSource,
    ) -> Result<()> {
        if self.world.get(tile) == 0 {
            // no data below
            return Ok(());
        }

        let generable = self.generate.get(tile) != 0;
        let at_bottom = tile.lod >= self.generate.max_lod();
        if at_bottom && !generable {
            return Ok(());
        }

        self.glue.check_cancelled()?;
        debug!(tile = %tile, "Processing glue tile");

        let mut inputs = InputList::new();
        for (id, set) in self.sets.iter().enumerate() {
            if let Some(input) = Input::load(id, set, tile)? {
                inputs.push(input);
            }
        }

        let constraints = GlueConstraints {
            generable,
            top: self.sets[self.top_id],
            top_id: self.top_id,
            src_count: self.sets.len(),
        };
        let output = merge::merge_tile(tile, node_info, &inputs, parent_source, &constraints);

        if output.has_tile() {
            self.glue.set_tile(tile, &output.tile())?;
        } else if generable {
            if let Some(top_source) = output.source.mesh.last() {
                if top_source.id() != self.top_id {
                    // a single lower surface serves this tile: reference it
                    debug!(tile = %tile, reference = top_source.id() + 1, "Setting reference");
                    self.glue
                        .add_reference(tile, (top_source.id() + 1) as u8)?;
                }
            }
        }

        if at_bottom {
            return Ok(());
        }

        for (child_index, child) in children(tile).into_iter().enumerate() {
            let child_info = node_info.child(child_index);
            self.merge_rec(&child_info, child, &output.source)?;
        }
        Ok(())
    }
}

/// One glue attached to a tileset, with its surface index translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlueEntry {
    /// Glue id: tileset ids bottom-of-stack first.
    pub id: Vec<String>,
    /// Glue-local surface index to storage surface index.
    pub indices: Vec<usize>,
}

/// Sort one top tileset's glues by descending priority.
///
/// Each glue id reads right-to-left as a string over an alphabet that
/// ranks tilesets top-of-stack first; when one id is a prefix of the
/// other, the longer glue ranks higher.
pub fn glue_order(world: &[String], mut glues: Vec<GlueEntry>) -> Vec<GlueEntry> {
    let rank = |tileset: &String| -> usize {
        world
            .iter()
            .position(|w| w == tileset)
            .map(|i| world.len() - 1 - i)
            .unwrap_or(usize::MAX)
    };
    let key = |entry: &GlueEntry| -> Vec<usize> { entry.id.iter().rev().map(rank).collect() };
    glues.sort_by(|a, b| {
        let (ka, kb) = (key(a), key(b));
        for (x, y) in ka.iter().zip(kb.iter()) {
            match x.cmp(y) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        // common prefix: the longer glue wins
        kb.len().cmp(&ka.len())
    });
    glues
}

/// Map each glue member to its index in the world stack.
pub fn glue_indices(world: &[String], id: &[String]) -> Result<Vec<usize>> {
    let mut indices = Vec::with_capacity(id.len());
    let mut from = 0usize;
    for member in id {
        let position = world[from..]
            .iter()
            .position(|w| w == member)
            .map(|p| p + from)
            .ok_or_else(|| {
                crate::error::TileStoreError::InconsistentInput(format!(
                    "glue <{}> does not belong into world <{}>",
                    id.join(","),
                    world.join(",")
                ))
            })?;
        indices.push(position);
        from = position + 1;
    }
    Ok(indices)
}
