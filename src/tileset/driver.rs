//! Tileset driver layer.
//!
//! A driver implements the physical side of a tileset: root-level files
//! (config, tile index) and per-tile payload streams. Four kinds exist as
//! one tagged variant: plain (tilar archives under the tileset root),
//! local (read-only alias of another plain tileset), aggregated
//! (read-only union over a storage) and remote (HTTP, behind the `http`
//! feature).

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TileStoreError};
use crate::streams::{now_secs, DataSink, DataSource, SourceStat};
use crate::tile::{TileFile, TileId};
use crate::tilar::FileIndex;

use super::aggregated::AggregatedDriver;
use super::cache::{ArchiveCache, Group};
use super::config::{self, DriverOptions, LocalOptions, PlainOptions};

/// Root-level files of a tileset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum File {
    Config,
    ExtraConfig,
    TileIndex,
}

impl File {
    pub fn name(&self) -> &'static str {
        match self {
            File::Config => "tileset.conf",
            File::ExtraConfig => "extra.conf",
            File::TileIndex => "tileset.index",
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            File::Config | File::ExtraConfig => "application/json",
            File::TileIndex => "application/octet-stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Tilar-backed driver storing everything under one tileset root.
pub struct PlainDriver {
    root: PathBuf,
    options: PlainOptions,
    read_only: bool,
    cache: ArchiveCache,
    config_modified: u64,
}

impl PlainDriver {
    /// Create a fresh tileset root.
    pub fn create(root: &Path, options: PlainOptions) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(PlainDriver {
            root: root.to_path_buf(),
            cache: ArchiveCache::new(root, options.binary_order, options.uuid, false),
            options,
            read_only: false,
            config_modified: 0,
        })
    }

    /// Open an existing tileset root.
    pub fn open(root: &Path, options: PlainOptions, mode: OpenMode) -> Result<Self> {
        if !root.join(File::Config.name()).exists() {
            return Err(TileStoreError::NoSuchTileSet(
                root.display().to_string(),
            ));
        }
        let read_only = mode == OpenMode::ReadOnly;
        let mut driver = PlainDriver {
            root: root.to_path_buf(),
            cache: ArchiveCache::new(root, options.binary_order, options.uuid, read_only),
            options,
            read_only,
            config_modified: 0,
        };
        driver.config_modified = driver.file_mtime(File::Config);
        Ok(driver)
    }

    fn file_mtime(&self, file: File) -> u64 {
        fs::metadata(self.root.join(file.name()))
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Archive group, archive id and slot of one tile file.
    fn locate(&self, tile: TileId, kind: TileFile) -> Result<(Group, TileId, FileIndex)> {
        let (group, slot_type, tile) = match kind {
            TileFile::Mesh => (Group::Tiles, 0, tile),
            TileFile::Atlas => (Group::Tiles, 1, tile),
            TileFile::Navtile => (Group::Navtiles, 0, tile),
            TileFile::Meta => (
                Group::Metas,
                0,
                // shrink the metatile space: origins are aligned
                TileId::new(
                    tile.lod,
                    tile.x >> self.options.meta_unused_bits,
                    tile.y >> self.options.meta_unused_bits,
                ),
            ),
            other => {
                return Err(TileStoreError::Key(format!(
                    "tile file {other:?} is not stored by the plain driver"
                )))
            }
        };
        let mask = self.options.tile_mask();
        let archive = TileId::new(
            tile.lod,
            tile.x >> self.options.binary_order,
            tile.y >> self.options.binary_order,
        );
        Ok((
            group,
            archive,
            FileIndex::new(tile.x & mask, tile.y & mask, slot_type),
        ))
    }

    pub fn output_tile(&mut self, tile: TileId, kind: TileFile) -> Result<DataSink> {
        if self.read_only {
            return Err(TileStoreError::ReadOnly(format!(
                "tileset <{}>",
                self.root.display()
            )));
        }
        let (group, archive, index) = self.locate(tile, kind)?;
        self.cache.archive(group, archive)?.output(index)
    }

    pub fn input_tile(&mut self, tile: TileId, kind: TileFile) -> Result<DataSource> {
        let (group, archive, index) = self.locate(tile, kind)?;
        let archive = self.cache.archive(group, archive).map_err(|e| match e {
            // a missing archive means the tile was never written
            TileStoreError::Io(_) | TileStoreError::NoSuchTileSet(_) => {
                TileStoreError::NoSuchTile(format!("{tile} ({kind:?})"))
            }
            other => other,
        })?;
        archive.input(index)
    }

    pub fn output_file(&self, file: File) -> Result<DataSink> {
        if self.read_only {
            return Err(TileStoreError::ReadOnly(format!(
                "tileset <{}>",
                self.root.display()
            )));
        }
        let path = self.root.join(file.name());
        Ok(DataSink::new(file.name(), move |data| {
            fs::write(&path, data)?;
            Ok(())
        }))
    }

    pub fn input_file(&self, file: File) -> Result<DataSource> {
        let path = self.root.join(file.name());
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TileStoreError::NoSuchTileSet(path.display().to_string())
            } else {
                TileStoreError::Io(e)
            }
        })?;
        Ok(DataSource::from_vec(
            file.name(),
            file.content_type(),
            data,
        ))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn externally_changed(&self) -> bool {
        self.config_modified != 0 && self.file_mtime(File::Config) != self.config_modified
    }
}

/// Read-only alias of another plain tileset on the local filesystem.
pub struct LocalDriver {
    inner: PlainDriver,
}

impl LocalDriver {
    pub fn open(options: &LocalOptions) -> Result<Self> {
        // the backing tileset's own config knows its archive geometry
        let config_path = options.path.join(File::Config.name());
        let data = fs::read_to_string(&config_path).map_err(|_| {
            TileStoreError::NoSuchTileSet(options.path.display().to_string())
        })?;
        let properties = config::load_config(&data, &config_path)?;
        let plain = match properties.driver {
            DriverOptions::Plain(plain) => plain,
            _ => {
                return Err(TileStoreError::IncompatibleTileSet(format!(
                    "local driver target <{}> is not a plain tileset",
                    options.path.display()
                )))
            }
        };
        Ok(LocalDriver {
            inner: PlainDriver::open(&options.path, plain, OpenMode::ReadOnly)?,
        })
    }
}

/// HTTP-backed read-only driver.
#[cfg(feature = "http")]
pub struct RemoteDriver {
    url: String,
    tries: i32,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl RemoteDriver {
    pub fn open(options: &config::RemoteOptions) -> Result<Self> {
        Ok(RemoteDriver {
            url: options.url.trim_end_matches('/').to_string(),
            tries: options.tries,
            client: reqwest::blocking::Client::new(),
        })
    }

    fn fetch(&self, name: &str, content_type: &'static str) -> Result<DataSource> {
        let url = format!("{}/{}", self.url, name);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(&url).send() {
                Ok(response) if response.status().is_success() => {
                    let data = response
                        .bytes()
                        .map_err(|e| TileStoreError::Format(format!("read of {url} failed: {e}")))?;
                    return Ok(DataSource::from_vec(name, content_type, data.to_vec()));
                }
                Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                    return Err(TileStoreError::NoSuchTile(url));
                }
                Ok(response) => {
                    tracing::warn!(url = %url, status = %response.status(), "tile fetch failed");
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "tile fetch failed");
                }
            }
            // negative tries retry indefinitely
            if self.tries >= 0 && attempt >= self.tries.max(1) {
                return Err(TileStoreError::Io(std::io::Error::other(format!(
                    "giving up on {url} after {attempt} attempts"
                ))));
            }
        }
    }

    pub fn input_tile(&self, tile: TileId, kind: TileFile) -> Result<DataSource> {
        self.fetch(
            &crate::tile::as_filename(tile, kind, None),
            "application/octet-stream",
        )
    }

    pub fn input_file(&self, file: File) -> Result<DataSource> {
        self.fetch(file.name(), file.content_type())
    }
}

/// The driver variant.
pub enum Driver {
    Plain(PlainDriver),
    Local(LocalDriver),
    Aggregated(Box<AggregatedDriver>),
    #[cfg(feature = "http")]
    Remote(RemoteDriver),
}

impl Driver {
    /// Create the physical representation for a new tileset.
    pub fn create(root: &Path, options: &DriverOptions) -> Result<Driver> {
        match options {
            DriverOptions::Plain(plain) => Ok(Driver::Plain(PlainDriver::create(root, *plain)?)),
            _ => Err(TileStoreError::InconsistentInput(
                "only plain tilesets can be created directly".into(),
            )),
        }
    }

    /// Open the driver of an existing tileset.
    pub fn open(root: &Path, options: &DriverOptions, mode: OpenMode) -> Result<Driver> {
        match options {
            DriverOptions::Plain(plain) => {
                Ok(Driver::Plain(PlainDriver::open(root, *plain, mode)?))
            }
            DriverOptions::Local(local) => Ok(Driver::Local(LocalDriver::open(local)?)),
            DriverOptions::Aggregated(aggregated) => Ok(Driver::Aggregated(Box::new(
                AggregatedDriver::open(aggregated)?,
            ))),
            #[cfg(feature = "http")]
            DriverOptions::Remote(remote) => Ok(Driver::Remote(RemoteDriver::open(remote)?)),
            #[cfg(not(feature = "http"))]
            DriverOptions::Remote(_) => Err(TileStoreError::InconsistentInput(
                "remote tilesets need the `http` feature".into(),
            )),
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            Driver::Plain(driver) => driver.read_only,
            _ => true,
        }
    }

    pub fn output_tile(&mut self, tile: TileId, kind: TileFile) -> Result<DataSink> {
        match self {
            Driver::Plain(driver) => driver.output_tile(tile, kind),
            _ => Err(TileStoreError::ReadOnly("tileset driver".into())),
        }
    }

    pub fn input_tile(&mut self, tile: TileId, kind: TileFile) -> Result<DataSource> {
        match self {
            Driver::Plain(driver) => driver.input_tile(tile, kind),
            Driver::Local(driver) => driver.inner.input_tile(tile, kind),
            Driver::Aggregated(driver) => driver.input_tile(tile, kind),
            #[cfg(feature = "http")]
            Driver::Remote(driver) => driver.input_tile(tile, kind),
        }
    }

    pub fn stat_tile(&mut self, tile: TileId, kind: TileFile) -> Result<SourceStat> {
        Ok(self.input_tile(tile, kind)?.stat())
    }

    pub fn output_file(&self, file: File) -> Result<DataSink> {
        match self {
            Driver::Plain(driver) => driver.output_file(file),
            _ => Err(TileStoreError::ReadOnly("tileset driver".into())),
        }
    }

    pub fn input_file(&mut self, file: File) -> Result<DataSource> {
        match self {
            Driver::Plain(driver) => driver.input_file(file),
            Driver::Local(driver) => driver.inner.input_file(file),
            Driver::Aggregated(driver) => driver.input_file(file),
            #[cfg(feature = "http")]
            Driver::Remote(driver) => driver.input_file(file),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            Driver::Plain(driver) => driver.flush(),
            _ => Err(TileStoreError::ReadOnly("tileset driver".into())),
        }
    }

    pub fn externally_changed(&self) -> bool {
        match self {
            Driver::Plain(driver) => driver.externally_changed(),
            Driver::Local(driver) => driver.inner.externally_changed(),
            _ => false,
        }
    }

    /// Last-flush timestamp surrogate for change detection.
    pub fn last_modified(&self) -> u64 {
        now_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn plain_options() -> PlainOptions {
        PlainOptions::new(2, 1)
    }

    #[test]
    fn tile_payload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = PlainDriver::create(dir.path(), plain_options()).unwrap();

        let tile = TileId::new(4, 5, 6);
        let mut sink = driver.output_tile(tile, TileFile::Mesh).unwrap();
        sink.write(b"mesh bytes");
        sink.close().unwrap();

        let mut sink = driver.output_tile(tile, TileFile::Atlas).unwrap();
        sink.write(b"jpg bytes");
        sink.close().unwrap();

        assert_eq!(
            driver.input_tile(tile, TileFile::Mesh).unwrap().bytes(),
            b"mesh bytes"
        );
        assert_eq!(
            driver.input_tile(tile, TileFile::Atlas).unwrap().bytes(),
            b"jpg bytes"
        );
        assert!(matches!(
            driver.input_tile(TileId::new(4, 0, 0), TileFile::Mesh),
            Err(TileStoreError::NoSuchTile(_))
        ));
    }

    #[test]
    fn meta_and_tile_share_lod_but_not_archives() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = PlainDriver::create(dir.path(), plain_options()).unwrap();

        // metatile origin aligned to 2^metaUnusedBits
        let origin = TileId::new(4, 6, 6);
        let mut sink = driver.output_tile(origin, TileFile::Meta).unwrap();
        sink.write(b"meta");
        sink.close().unwrap();
        driver.flush().unwrap();

        assert_eq!(
            driver.input_tile(origin, TileFile::Meta).unwrap().bytes(),
            b"meta"
        );

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(entries.iter().any(|name| name.starts_with("metatiles-")));
    }

    #[test]
    fn root_files() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PlainDriver::create(dir.path(), plain_options()).unwrap();

        let mut sink = driver.output_file(File::Config).unwrap();
        sink.write(b"{}");
        sink.close().unwrap();

        let source = driver.input_file(File::Config).unwrap();
        assert_eq!(source.bytes(), b"{}");
        assert!(matches!(
            driver.input_file(File::ExtraConfig),
            Err(TileStoreError::NoSuchTileSet(_))
        ));
    }

    #[test]
    fn open_requires_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PlainDriver::open(dir.path(), plain_options(), OpenMode::ReadOnly),
            Err(TileStoreError::NoSuchTileSet(_))
        ));
    }

    #[test]
    fn read_only_driver_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let driver = PlainDriver::create(dir.path(), plain_options()).unwrap();
            let mut sink = driver.output_file(File::Config).unwrap();
            sink.write(b"{}");
            sink.close().unwrap();
        }
        let mut driver =
            PlainDriver::open(dir.path(), plain_options(), OpenMode::ReadOnly).unwrap();
        assert!(matches!(
            driver.output_tile(TileId::new(1, 0, 0), TileFile::Mesh),
            Err(TileStoreError::ReadOnly(_))
        ));
        assert!(matches!(
            driver.output_file(File::Config),
            Err(TileStoreError::ReadOnly(_))
        ));
    }

    #[test]
    fn external_change_detection() {
        let dir = tempfile::tempdir().unwrap();
        {
            let driver = PlainDriver::create(dir.path(), plain_options()).unwrap();
            let mut sink = driver.output_file(File::Config).unwrap();
            sink.write(b"{}");
            sink.close().unwrap();
        }
        let driver = PlainDriver::open(dir.path(), plain_options(), OpenMode::ReadOnly).unwrap();
        assert!(!driver.externally_changed());

        // rewrite the config with a different mtime
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let mut file = std::fs::File::create(dir.path().join("tileset.conf")).unwrap();
        file.write_all(b"{\"x\":1}").unwrap();
        drop(file);
        assert!(driver.externally_changed());
    }
}
