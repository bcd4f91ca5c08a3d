pub mod atlas;
pub mod cancel;
pub mod error;
pub mod index;
pub mod math;
pub mod mesh;
pub mod meshop;
pub mod meta;
pub mod multifile;
pub mod navtile;
pub mod openfiles;
pub mod rastermask;
pub mod registry;
pub mod storage;
pub mod streams;
pub mod tilar;
pub mod tile;
pub mod tileset;

pub use cancel::CancelToken;
pub use error::{Result, TileStoreError};
pub use storage::{create_storage, open_storage, AddOptions, Location, Storage};
pub use tile::{Lod, LodRange, TileId, TileRange};
pub use tileset::{
    clone_tile_set, create_tile_set, open_tile_set, CreateMode, OpenMode, Tile, TileSet,
    TileSetProperties,
};
