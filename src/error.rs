use std::io;
use std::path::PathBuf;

/// All error types for the tile store.
#[derive(thiserror::Error, Debug)]
pub enum TileStoreError {
    #[error("No such tileset: {0}")]
    NoSuchTileSet(String),
    #[error("No such tile: {0}")]
    NoSuchTile(String),
    #[error("Tile is present but unreadable: {0}")]
    BadTile(String),
    #[error("Format error: {0}")]
    Format(String),
    #[error("Bad file format in {}: {reason}", path.display())]
    BadFileFormat { path: PathBuf, reason: String },
    #[error("Unsupported version in {}: {version}", path.display())]
    Version { path: PathBuf, version: u16 },
    #[error("Bad file name: {0}")]
    BadFileName(String),
    #[error("Write attempted on read-only {0}")]
    ReadOnly(String),
    #[error("Pending transaction: {0}")]
    PendingTransaction(String),
    #[error("Inconsistent input: {0}")]
    InconsistentInput(String),
    #[error("Incompatible tileset: {0}")]
    IncompatibleTileSet(String),
    #[error("Operation interrupted")]
    Interrupted,
    #[error("Key error: {0}")]
    Key(String),
    #[error("Storage already exists: {}", .0.display())]
    StorageAlreadyExists(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TileStoreError {
    /// Shorthand for `BadFileFormat` with a displayable path.
    pub fn bad_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TileStoreError::BadFileFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TileStoreError>;
