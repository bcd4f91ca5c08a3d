//! End-to-end scenarios over the public API.
//!
//! These tests build synthetic tilesets and storages in temporary
//! directories and verify the cross-module contracts: write/read cycles,
//! archive crash recovery, merge behavior, storage consistency.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use glam::{DVec2, DVec3};

use terratile::atlas::{solid_jpeg, RawAtlas};
use terratile::error::TileStoreError;
use terratile::mesh::{Mesh, SubMesh, COVERAGE_ORDER};
use terratile::navtile::NavTile;
use terratile::rastermask::BitMask;
use terratile::registry::{NodeInfo, Registry};
use terratile::storage::{
    create_storage, open_storage, AddOptions, Location, StorageProperties,
};
use terratile::tilar::{self, Tilar};
use terratile::tile::{child_index, TileId};
use terratile::tileset::merge::{self, Input, InputList, MergeConstraints, TileSource};
use terratile::tileset::{
    create_tile_set, open_tile_set, CreateMode, OpenMode, Tile, TileSetProperties,
};

/// Horizontal extent of a tile in the default frame.
fn tile_extents(tile: TileId) -> terratile::math::Extents2 {
    let frame = Registry::system().reference_frame("melown2015").unwrap();
    NodeInfo::new(frame, tile).unwrap().extents
}

/// Which part of the tile footprint a synthetic mesh covers.
#[derive(Clone, Copy)]
enum Region {
    Full,
    LeftHalf,
    RightHalf,
}

/// Build a flat textured quad covering `region` of `tile` at `height`.
fn make_tile(tile: TileId, region: Region, height: f64, credits: &[u16]) -> Tile {
    let e = tile_extents(tile);
    let size = e.size();
    let (llx, urx) = match region {
        Region::Full => (e.ll.x, e.ur.x),
        Region::LeftHalf => (e.ll.x, e.ll.x + size.x * 0.5),
        Region::RightHalf => (e.ll.x + size.x * 0.5, e.ur.x),
    };

    let submesh = SubMesh {
        vertices: vec![
            DVec3::new(llx, e.ll.y, height),
            DVec3::new(urx, e.ll.y, height),
            DVec3::new(urx, e.ur.y, height + 25.0),
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
    mesh.coverage_mask = match region {
        Region::Full => BitMask::full(COVERAGE_ORDER),
        Region::LeftHalf => half_mask(false),
        Region::RightHalf => half_mask(true),
    };

    let mut atlas = RawAtlas::new();
    atlas.add(solid_jpeg(32, 32, 90));

    Tile {
        mesh: Some(mesh),
        atlas: Some(atlas),
        navtile: None,
        credits: credits.iter().copied().collect(),
        alien: false,
    }
}

fn half_mask(right: bool) -> BitMask {
    let mut mask = BitMask::empty(COVERAGE_ORDER);
    let (from, to) = if right { (128, 256) } else { (0, 128) };
    for y in 0..256 {
        for x in from..to {
            mask.set(x, y, true);
        }
    }
    mask
}

fn make_tileset(dir: &Path, id: &str, tile: TileId, region: Region, height: f64) {
    let mut ts = create_tile_set(
        &dir.join(id),
        &TileSetProperties::new(id, "melown2015"),
        CreateMode::FailIfExists,
    )
    .unwrap();
    ts.set_tile(tile, &make_tile(tile, region, height, &[id.len() as u16]))
        .unwrap();
    ts.flush().unwrap();
}

// S1: write one tile, flush, reopen, read metadata back.
#[test]
fn write_read_one_tile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ts");

    let tile = TileId::new(3, 4, 5);
    {
        let mut ts = create_tile_set(
            &path,
            &TileSetProperties::new("hills", "melown2015"),
            CreateMode::FailIfExists,
        )
        .unwrap();
        ts.set_tile(tile, &make_tile(tile, Region::Full, 100.0, &[42]))
            .unwrap();
        ts.flush().unwrap();
    }

    let ts = open_tile_set(&path, OpenMode::ReadOnly).unwrap();
    assert!(ts.exists(tile));

    let node = ts.get_meta_node(tile).unwrap();
    assert!(node.geometry());
    assert_eq!(node.internal_texture_count(), 1);
    assert_eq!(node.height_range, (100, 125));
    assert_eq!(node.credits().iter().copied().collect::<Vec<_>>(), vec![42]);

    // the parent is a virtual node carrying the child's flag and extents;
    // containment holds up to the coarser lod-2 quantization step
    let parent = ts.get_meta_node(TileId::new(2, 2, 2)).unwrap();
    assert!(!parent.real());
    assert!(parent.has_child(child_index(tile)));
    assert!(!parent.extents.is_degenerate());
    let eps = 1.0 / 15.0 + 1.0 / 31.0;
    assert!(parent.extents.ll.x <= node.extents.ll.x + eps);
    assert!(parent.extents.ur.x >= node.extents.ur.x - eps);
    assert!(parent.extents.ll.z <= node.extents.ll.z + eps);
    assert!(parent.extents.ur.z >= node.extents.ur.z - eps);
}

// S2: a crash between flushes loses only the unflushed write.
#[test]
fn archive_crash_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.tilar");
    let options = tilar::Options::new(2, 2, uuid::Uuid::from_bytes([3; 16]));

    {
        let archive = Tilar::create(&path, options, tilar::CreateMode::Truncate).unwrap();
        let mut sink = archive.output(tilar::FileIndex::new(0, 0, 0)).unwrap();
        sink.write(b"A");
        sink.close().unwrap();
        let mut sink = archive.output(tilar::FileIndex::new(1, 1, 1)).unwrap();
        sink.write(b"BB");
        sink.close().unwrap();
        archive.flush().unwrap();

        // unflushed write, then the process "dies"
        let mut sink = archive.output(tilar::FileIndex::new(0, 0, 0)).unwrap();
        sink.write(b"CCCC");
        sink.close().unwrap();
        archive.discard_changes();
    }

    // some partial garbage also lands at the tail
    {
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe]).unwrap();
    }

    let archive = Tilar::create(&path, options, tilar::CreateMode::AppendOrTruncate).unwrap();
    assert_eq!(
        archive.input(tilar::FileIndex::new(0, 0, 0)).unwrap().bytes(),
        b"A"
    );
    assert_eq!(
        archive.input(tilar::FileIndex::new(1, 1, 1)).unwrap().bytes(),
        b"BB"
    );
}

struct Plain {
    navtile: bool,
}

impl MergeConstraints for Plain {
    fn generable(&self) -> bool {
        true
    }
    fn generate_navtile(&self) -> bool {
        self.navtile
    }
}

// S3: merging two sources covering disjoint halves keeps every face of
// both, with surface references following stack positions.
#[test]
fn merge_of_two_non_overlapping_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let tile = TileId::new(5, 10, 10);

    make_tileset(dir.path(), "west", tile, Region::LeftHalf, 0.0);
    make_tileset(dir.path(), "east", tile, Region::RightHalf, 40.0);

    let west = open_tile_set(&dir.path().join("west"), OpenMode::ReadOnly).unwrap();
    let east = open_tile_set(&dir.path().join("east"), OpenMode::ReadOnly).unwrap();

    let inputs: InputList = vec![
        Input::load(0, &west, tile).unwrap().unwrap(),
        Input::load(1, &east, tile).unwrap().unwrap(),
    ];

    let frame = Registry::system().reference_frame("melown2015").unwrap();
    let info = NodeInfo::new(frame, tile).unwrap();
    let output = merge::merge_tile(
        tile,
        &info,
        &inputs,
        &TileSource::default(),
        &Plain { navtile: false },
    );

    assert!(output.has_tile());
    assert_eq!(output.source.mesh.len(), 2);

    let mesh = output.mesh.as_ref().unwrap();
    let faces: usize = mesh.submeshes.iter().map(|sm| sm.faces.len()).sum();
    assert_eq!(faces, 4, "every face of both inputs survives");

    for sm in &mesh.submeshes {
        assert!(sm.surface_reference == 1 || sm.surface_reference == 2);
    }
    let refs: BTreeSet<u8> = mesh.submeshes.iter().map(|sm| sm.surface_reference).collect();
    assert_eq!(refs.len(), 2);
}

// S4: a watertight top source triggers the verbatim single-source path.
#[test]
fn merge_with_watertight_top() {
    let dir = tempfile::tempdir().unwrap();
    let tile = TileId::new(5, 10, 10);

    make_tileset(dir.path(), "low", tile, Region::LeftHalf, 0.0);
    make_tileset(dir.path(), "top", tile, Region::Full, 70.0);

    let low = open_tile_set(&dir.path().join("low"), OpenMode::ReadOnly).unwrap();
    let top = open_tile_set(&dir.path().join("top"), OpenMode::ReadOnly).unwrap();
    assert!(top.fully_covered(tile));

    let inputs: InputList = vec![
        Input::load(0, &low, tile).unwrap().unwrap(),
        Input::load(1, &top, tile).unwrap().unwrap(),
    ];

    let frame = Registry::system().reference_frame("melown2015").unwrap();
    let info = NodeInfo::new(frame, tile).unwrap();
    let output = merge::merge_tile(
        tile,
        &info,
        &inputs,
        &TileSource::default(),
        &Plain { navtile: false },
    );

    // output equals the top tile verbatim
    assert_eq!(output.source.mesh.len(), 1);
    assert_eq!(output.source.mesh[0].id(), 1);
    let mesh = output.mesh.as_ref().unwrap();
    assert_eq!(mesh.submeshes.len(), 1);
    assert_eq!(mesh.submeshes[0].vertices.len(), 4);
    assert_eq!(mesh.submeshes[0].faces.len(), 2);
    assert_eq!(mesh.submeshes[0].surface_reference, 2);
    assert!(mesh.watertight());
}

// S5: adding two overlapping tilesets leaves exactly one pending glue;
// generating it produces a valid tileset under glues/.
#[test]
fn storage_add_with_pending_glue() {
    let dir = tempfile::tempdir().unwrap();
    let tile = TileId::new(5, 10, 10);

    make_tileset(dir.path(), "a-src", tile, Region::LeftHalf, 0.0);
    make_tileset(dir.path(), "b-src", tile, Region::RightHalf, 30.0);

    let store_path = dir.path().join("store");
    let mut storage = create_storage(
        &store_path,
        &StorageProperties::new("melown2015"),
        CreateMode::FailIfExists,
    )
    .unwrap();

    storage
        .add(
            &dir.path().join("a-src"),
            &Location::top(),
            Some("a"),
            &AddOptions::default(),
        )
        .unwrap();
    storage
        .add(
            &dir.path().join("b-src"),
            &Location::above("a"),
            Some("b"),
            &AddOptions::default(),
        )
        .unwrap();

    assert_eq!(storage.tilesets(), vec!["a".to_string(), "b".to_string()]);

    let pending = storage.pending_glues(None).unwrap();
    let expected: BTreeSet<Vec<String>> =
        [vec!["a".to_string(), "b".to_string()]].into_iter().collect();
    assert_eq!(pending, expected);

    storage
        .generate_glue(&["a".to_string(), "b".to_string()], &AddOptions::default())
        .unwrap();

    // the glue landed in its directory and is a valid tileset
    let glue_path = store_path.join("glues").join("a").join("b");
    assert!(glue_path.join("tileset.conf").exists());
    let glue = open_tile_set(&glue_path, OpenMode::ReadOnly).unwrap();
    assert!(glue.exists(tile));

    // nothing pending anymore
    assert!(storage.pending_glues(None).unwrap().is_empty());

    // storage consistency: the glue is registered
    let glues = storage.glues();
    assert!(glues.contains_key(&vec!["a".to_string(), "b".to_string()]));
}

// S6: a reference-frame mismatch fails the add and leaves storage.conf
// byte-identical.
#[test]
fn reference_frame_mismatch_leaves_config_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let tile = TileId::new(3, 4, 5);

    // a tileset in a different (but known) reference frame
    let foreign_path = dir.path().join("foreign");
    {
        let mut ts = create_tile_set(
            &foreign_path,
            &TileSetProperties::new("foreign", "earth-qsc"),
            CreateMode::FailIfExists,
        )
        .unwrap();
        ts.set_tile(tile, &make_tile(tile, Region::Full, 5.0, &[1]))
            .unwrap();
        ts.flush().unwrap();
    }

    let store_path = dir.path().join("store");
    let mut storage = create_storage(
        &store_path,
        &StorageProperties::new("melown2015"),
        CreateMode::FailIfExists,
    )
    .unwrap();

    let before = fs::read(store_path.join("storage.conf")).unwrap();
    let result = storage.add(
        &foreign_path,
        &Location::top(),
        None,
        &AddOptions::default(),
    );
    assert!(matches!(
        result,
        Err(TileStoreError::IncompatibleTileSet(_))
    ));
    let after = fs::read(store_path.join("storage.conf")).unwrap();
    assert_eq!(before, after, "storage.conf must stay byte-identical");
}

// Invariant 7: remove drops the tileset and every referencing glue.
#[test]
fn remove_cascades_to_glues() {
    let dir = tempfile::tempdir().unwrap();
    let tile = TileId::new(5, 10, 10);

    make_tileset(dir.path(), "a-src", tile, Region::LeftHalf, 0.0);
    make_tileset(dir.path(), "b-src", tile, Region::RightHalf, 30.0);

    let store_path = dir.path().join("store");
    let mut storage = create_storage(
        &store_path,
        &StorageProperties::new("melown2015"),
        CreateMode::FailIfExists,
    )
    .unwrap();
    storage
        .add(&dir.path().join("a-src"), &Location::top(), Some("a"), &AddOptions::default())
        .unwrap();
    storage
        .add(&dir.path().join("b-src"), &Location::top(), Some("b"), &AddOptions::default())
        .unwrap();
    storage
        .generate_glue(&["a".to_string(), "b".to_string()], &AddOptions::default())
        .unwrap();

    storage.remove(&["b".to_string()], None).unwrap();

    assert_eq!(storage.tilesets(), vec!["a".to_string()]);
    assert!(storage.glues().is_empty());
    assert!(!store_path.join("glues").join("a").join("b").exists());
    // trash bin remembers the removed tileset
    assert!(storage.properties().trash_bin.contains_key("b"));

    // reopening sees the same state
    let reopened = open_storage(&store_path, OpenMode::ReadOnly).unwrap();
    assert_eq!(reopened.tilesets(), vec!["a".to_string()]);
}

// Invariant 8: pasting disjoint tilesets commutes.
#[test]
fn paste_commutes_for_disjoint_tilesets() {
    let dir = tempfile::tempdir().unwrap();
    let tile_a = TileId::new(3, 4, 5);
    let tile_b = TileId::new(4, 3, 2);

    make_tileset(dir.path(), "a", tile_a, Region::Full, 10.0);
    make_tileset(dir.path(), "b", tile_b, Region::Full, 20.0);

    let a = open_tile_set(&dir.path().join("a"), OpenMode::ReadOnly).unwrap();
    let b = open_tile_set(&dir.path().join("b"), OpenMode::ReadOnly).unwrap();

    let build = |order: &str, first: &terratile::tileset::TileSet, second: &terratile::tileset::TileSet| {
        let mut ts = create_tile_set(
            &dir.path().join(order),
            &TileSetProperties::new(order, "melown2015"),
            CreateMode::FailIfExists,
        )
        .unwrap();
        ts.paste(first, None).unwrap();
        ts.paste(second, None).unwrap();
        ts.flush().unwrap();
    };
    build("ab", &a, &b);
    build("ba", &b, &a);

    let ab = open_tile_set(&dir.path().join("ab"), OpenMode::ReadOnly).unwrap();
    let ba = open_tile_set(&dir.path().join("ba"), OpenMode::ReadOnly).unwrap();

    for tile in [tile_a, tile_b] {
        assert!(ab.exists(tile) && ba.exists(tile));
        assert_eq!(ab.tile_flags(tile), ba.tile_flags(tile));
        let node_ab = ab.get_meta_node(tile).unwrap();
        let node_ba = ba.get_meta_node(tile).unwrap();
        assert_eq!(node_ab, node_ba);

        let mesh_ab = ab.get_tile(tile).unwrap().mesh.unwrap();
        let mesh_ba = ba.get_tile(tile).unwrap().mesh.unwrap();
        assert_eq!(mesh_ab, mesh_ba);
    }
    assert_eq!(ab.lod_range(), ba.lod_range());
}

// The aggregated view serves the union of a storage's surfaces.
#[test]
fn virtual_surface_serves_union() {
    let dir = tempfile::tempdir().unwrap();
    let tile_a = TileId::new(5, 10, 10);
    let tile_b = TileId::new(5, 12, 10);

    make_tileset(dir.path(), "a-src", tile_a, Region::Full, 0.0);
    make_tileset(dir.path(), "b-src", tile_b, Region::Full, 30.0);

    let store_path = dir.path().join("store");
    let mut storage = create_storage(
        &store_path,
        &StorageProperties::new("melown2015"),
        CreateMode::FailIfExists,
    )
    .unwrap();
    storage
        .add(&dir.path().join("a-src"), &Location::top(), Some("a"), &AddOptions::default())
        .unwrap();
    storage
        .add(&dir.path().join("b-src"), &Location::top(), Some("b"), &AddOptions::default())
        .unwrap();

    storage
        .create_virtual_surface(
            &["a".to_string(), "b".to_string()],
            CreateMode::FailIfExists,
            None,
        )
        .unwrap();

    let vs_path = store_path.join("vs").join("a_b");
    let union = open_tile_set(&vs_path, OpenMode::ReadOnly).unwrap();

    // both tiles visible through one view
    assert!(union.exists(tile_a));
    assert!(union.exists(tile_b));

    let tile = union.get_tile(tile_a).unwrap();
    assert!(tile.mesh.is_some());

    // synthesized metatile carries both nodes
    let node_a = union.get_meta_node(tile_a).unwrap();
    assert!(node_a.geometry());
    let node_b = union.get_meta_node(tile_b).unwrap();
    assert!(node_b.geometry());

    // writes are unsupported
    let mut writable = open_tile_set(&vs_path, OpenMode::ReadWrite).unwrap();
    assert!(writable
        .set_tile(tile_a, &make_tile(tile_a, Region::Full, 0.0, &[]))
        .is_err());
}

// Archive snapshot reads through the index chain.
#[test]
fn archive_historical_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.tilar");
    let options = tilar::Options::new(1, 1, uuid::Uuid::from_bytes([9; 16]));

    let archive = Tilar::create(&path, options, tilar::CreateMode::Truncate).unwrap();
    let mut sink = archive.output(tilar::FileIndex::new(0, 0, 0)).unwrap();
    sink.write(b"generation-1");
    sink.close().unwrap();
    archive.flush().unwrap();
    let first = archive.info().offset;

    let mut sink = archive.output(tilar::FileIndex::new(0, 0, 0)).unwrap();
    sink.write(b"generation-2");
    sink.close().unwrap();
    archive.flush().unwrap();
    drop(archive);

    let snapshot = Tilar::open_at(&path, first).unwrap();
    assert_eq!(
        snapshot.input(tilar::FileIndex::new(0, 0, 0)).unwrap().bytes(),
        b"generation-1"
    );
}

// Glue suppression through tag rules.
#[test]
fn glue_rules_suppress_generation() {
    let dir = tempfile::tempdir().unwrap();
    let tile = TileId::new(5, 10, 10);

    make_tileset(dir.path(), "a-src", tile, Region::LeftHalf, 0.0);
    make_tileset(dir.path(), "b-src", tile, Region::RightHalf, 10.0);

    let store_path = dir.path().join("store");
    let mut storage = create_storage(
        &store_path,
        &StorageProperties::new("melown2015"),
        CreateMode::FailIfExists,
    )
    .unwrap();

    let tagged = |tag: &str| AddOptions {
        tags: [tag.to_string()].into_iter().collect(),
        ..AddOptions::default()
    };
    storage
        .add(&dir.path().join("a-src"), &Location::top(), Some("a"), &tagged("gold"))
        .unwrap();
    storage
        .add(&dir.path().join("b-src"), &Location::top(), Some("b"), &tagged("gold"))
        .unwrap();

    // without rules the glue is pending
    assert_eq!(storage.pending_glues(None).unwrap().len(), 1);

    // the unique-tag rule suppresses it
    fs::write(store_path.join("glue.rules"), "unique-tag(gold)\n").unwrap();
    assert!(storage.pending_glues(None).unwrap().is_empty());
}

// A corrupted metatile leaves the rest of the tileset readable.
#[test]
fn corrupt_metatile_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ts");
    let tile = TileId::new(3, 4, 5);
    {
        let mut ts = create_tile_set(
            &path,
            &TileSetProperties::new("hills", "melown2015"),
            CreateMode::FailIfExists,
        )
        .unwrap();
        ts.set_tile(tile, &make_tile(tile, Region::Full, 0.0, &[1]))
            .unwrap();
        ts.flush().unwrap();
    }

    // clobber the lod-3 metatile archive payload
    let meta_archive = path.join("metatiles-3-0-0.tilar");
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&meta_archive)
            .unwrap();
        file.seek(SeekFrom::Start(30)).unwrap();
        file.write_all(&[0xff; 8]).unwrap();
    }

    let ts = open_tile_set(&path, OpenMode::ReadOnly).unwrap();
    // the metatile read fails with a format/payload error
    assert!(ts.get_meta_node(tile).is_err());
    // the tile index itself is still intact
    assert!(ts.exists(tile));
    // payload streams from other archives are still readable
    let raw = ts.input_tile(tile, terratile::tile::TileFile::Mesh);
    assert!(raw.is_ok());
}

// Cross-process lock discipline: storage lock first, glue sublock second.
#[test]
fn locking_order_during_glue_generation() {
    use terratile::storage::StorageLocker;

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }
    impl StorageLocker for Recorder {
        fn lock(&self, sublock: &str) -> terratile::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("lock[{sublock}]"));
            Ok(())
        }
        fn unlock(&self, sublock: &str) -> terratile::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("unlock[{sublock}]"));
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let tile = TileId::new(5, 10, 10);
    make_tileset(dir.path(), "a-src", tile, Region::LeftHalf, 0.0);
    make_tileset(dir.path(), "b-src", tile, Region::RightHalf, 10.0);

    let store_path = dir.path().join("store");
    let mut storage = create_storage(
        &store_path,
        &StorageProperties::new("melown2015"),
        CreateMode::FailIfExists,
    )
    .unwrap();
    storage
        .add(&dir.path().join("a-src"), &Location::top(), Some("a"), &AddOptions::default())
        .unwrap();
    storage
        .add(&dir.path().join("b-src"), &Location::top(), Some("b"), &AddOptions::default())
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    let locker: Arc<dyn StorageLocker> = recorder.clone();
    let options = AddOptions {
        locker: Some(locker),
        ..AddOptions::default()
    };
    storage
        .generate_glue(&["a".to_string(), "b".to_string()], &options)
        .unwrap();

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "lock[]".to_string(),
            "lock[a,b]".to_string(),
            "unlock[a,b]".to_string(),
            "unlock[]".to_string(),
        ]
    );
}
