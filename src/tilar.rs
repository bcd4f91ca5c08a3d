//! Packed tile archive ("tilar").
//!
//! A single append-structured file stores up to `F * 4^k` small files,
//! indexed by `(col, row, type)`. Payloads append at the tail; a flush
//! re-appends the full slot table as a new index block followed by a fixed
//! trailer. The chain of index blocks (each records its predecessor's
//! offset) keeps every flushed state addressable for snapshot reads, and
//! makes crash recovery a matter of finding the last valid trailer.
//!
//! File layout:
//!
//! ```text
//! +--------+---------------------+-----+-------------+---------+
//! | header | payload | payload | ... | index block | trailer |
//! +--------+---------------------+-----+-------------+---------+
//! ```
//!
//! Header: `"TILAR"`, `u8` version, `u8` binaryOrder, `u8` filesPerTile,
//! `uuid[16]`. Payload: `u32` length, bytes, `u32` CRC. Index block:
//! `u32` previousIndexOffset, `u32` entryCount, then `(u32 start,
//! u32 size)` per slot in `(col, row, type)` row-major order. Trailer:
//! `u32` currentIndexOffset, `u32` indexChecksum, `u32` magic,
//! `u32` timestamp.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use uuid::Uuid;

use crate::error::{Result, TileStoreError};
use crate::openfiles;
use crate::streams::{now_secs, DataSink, DataSource};

const MAGIC: &[u8; 5] = b"TILAR";
const VERSION: u8 = 1;
const HEADER_SIZE: u64 = 24;
const TRAILER_SIZE: u64 = 16;
const TRAILER_MAGIC: u32 = 0x5249_4c54;
const PAYLOAD_FRAMING: u32 = 8;

const CONTENT_TYPE: &str = "application/octet-stream";

/// Archive geometry and identity. `append` opens require an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Square edge is `2^binary_order` tiles.
    pub binary_order: u8,
    /// Number of file slots per tile.
    pub files_per_tile: u8,
    /// Identity of the owning dataset.
    pub uuid: Uuid,
}

impl Options {
    pub fn new(binary_order: u8, files_per_tile: u8, uuid: Uuid) -> Self {
        Options {
            binary_order,
            files_per_tile,
            uuid,
        }
    }

    pub fn edge(&self) -> u32 {
        1 << self.binary_order
    }

    pub fn slot_count(&self) -> usize {
        (self.edge() as usize) * (self.edge() as usize) * self.files_per_tile as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Truncate an already existing file.
    Truncate,
    /// Fail when the file exists.
    FailIfExists,
    /// Extend an existing file; its options must match exactly.
    Append,
    /// Append when the existing file matches, truncate otherwise.
    AppendOrTruncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Index of a file inside the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIndex {
    pub col: u32,
    pub row: u32,
    pub kind: u32,
}

impl FileIndex {
    pub fn new(col: u32, row: u32, kind: u32) -> Self {
        FileIndex { col, row, kind }
    }
}

/// A listed file entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub index: FileIndex,
    pub start: u32,
    pub size: u32,
}

/// Archive information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Info {
    /// Position of the current index block.
    pub offset: u32,
    /// Position of the previous index block (0 when none).
    pub previous_offset: u32,
    /// Number of payload bytes no longer reachable from the current index.
    pub overhead: u32,
    /// Timestamp of the last flush.
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Slot {
    start: u32,
    size: u32,
}

struct Detail {
    path: PathBuf,
    options: Options,
    read_only: bool,
    file: Option<File>,
    map: Option<Arc<Mmap>>,
    slots: Vec<Slot>,
    saved_slots: Vec<Slot>,
    /// Append position for the next payload.
    tail: u64,
    current_index_offset: u32,
    previous_index_offset: u32,
    overhead: u32,
    saved_overhead: u32,
    modified: u64,
    dirty: bool,
    open_writers: HashSet<usize>,
}

impl Drop for Detail {
    fn drop(&mut self) {
        openfiles::closed();
        if self.dirty && !std::thread::panicking() {
            tracing::warn!(
                path = %self.path.display(),
                "tile archive dropped with unflushed changes"
            );
        }
    }
}

/// Open tile archive handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Tilar {
    detail: Arc<Mutex<Detail>>,
}

/// Removes a slot's writer reservation when the sink goes away.
struct WriterGuard {
    detail: Arc<Mutex<Detail>>,
    slot: usize,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.detail.lock().unwrap().open_writers.remove(&self.slot);
    }
}

impl Tilar {
    /// Create a new archive file.
    pub fn create(path: &Path, options: Options, mode: CreateMode) -> Result<Tilar> {
        match mode {
            CreateMode::Truncate => Self::create_fresh(path, options),
            CreateMode::FailIfExists => {
                if path.exists() {
                    return Err(TileStoreError::StorageAlreadyExists(path.to_path_buf()));
                }
                Self::create_fresh(path, options)
            }
            CreateMode::Append => {
                if !path.exists() {
                    return Self::create_fresh(path, options);
                }
                let archive = Self::open(path, OpenMode::ReadWrite)?;
                archive.expect(options)?;
                Ok(archive)
            }
            CreateMode::AppendOrTruncate => {
                if !path.exists() {
                    return Self::create_fresh(path, options);
                }
                match Self::open(path, OpenMode::ReadWrite)
                    .and_then(|a| a.expect(options).map(|_| a))
                {
                    Ok(archive) => Ok(archive),
                    Err(_) => Self::create_fresh(path, options),
                }
            }
        }
    }

    fn create_fresh(path: &Path, options: Options) -> Result<Tilar> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        header.extend_from_slice(MAGIC);
        header.push(VERSION);
        header.push(options.binary_order);
        header.push(options.files_per_tile);
        header.extend_from_slice(options.uuid.as_bytes());
        file.write_all(&header)?;

        openfiles::opened();
        let mut detail = Detail {
            path: path.to_path_buf(),
            options,
            read_only: false,
            file: Some(file),
            map: None,
            slots: vec![Slot::default(); options.slot_count()],
            saved_slots: vec![Slot::default(); options.slot_count()],
            tail: HEADER_SIZE,
            current_index_offset: 0,
            previous_index_offset: 0,
            overhead: 0,
            saved_overhead: 0,
            modified: 0,
            dirty: true,
            open_writers: HashSet::new(),
        };
        // persist an empty index so the file is valid from the start
        flush_detail(&mut detail)?;
        Ok(Tilar {
            detail: Arc::new(Mutex::new(detail)),
        })
    }

    /// Open an existing archive.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Tilar> {
        let read_only = mode == OpenMode::ReadOnly;
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;

        let options = read_header(&mut file, path)?;
        let file_len = file.seek(SeekFrom::End(0))?;
        let (index_offset, trailer_pos, modified) =
            locate_trailer(&mut file, path, &options, file_len)?;
        let (previous, slots) = read_index(&mut file, path, &options, index_offset)?;

        let data_end = trailer_pos + TRAILER_SIZE;
        if !read_only && data_end < file_len {
            // partial write after the last flush: discard
            tracing::info!(
                path = %path.display(),
                discarded = file_len - data_end,
                "truncating partial write after last valid index"
            );
            file.set_len(data_end)?;
        }

        let map = if read_only {
            Some(Arc::new(unsafe { Mmap::map(&file)? }))
        } else {
            None
        };

        openfiles::opened();
        let detail = Detail {
            path: path.to_path_buf(),
            options,
            read_only,
            file: if read_only { None } else { Some(file) },
            map,
            saved_slots: slots.clone(),
            slots,
            tail: data_end,
            current_index_offset: index_offset,
            previous_index_offset: previous,
            overhead: 0,
            saved_overhead: 0,
            modified,
            dirty: false,
            open_writers: HashSet::new(),
        };
        Ok(Tilar {
            detail: Arc::new(Mutex::new(detail)),
        })
    }

    /// Open and check options before returning.
    pub fn open_with_options(path: &Path, options: Options, mode: OpenMode) -> Result<Tilar> {
        let archive = Self::open(path, mode)?;
        archive.expect(options)?;
        Ok(archive)
    }

    /// Read-only access to a historical revision rooted at `index_offset`.
    pub fn open_at(path: &Path, index_offset: u32) -> Result<Tilar> {
        let mut file = File::open(path)?;
        let options = read_header(&mut file, path)?;
        let (previous, slots) = read_index(&mut file, path, &options, index_offset)?;
        let file_len = file.seek(SeekFrom::End(0))?;
        let map = Some(Arc::new(unsafe { Mmap::map(&file)? }));

        openfiles::opened();
        let detail = Detail {
            path: path.to_path_buf(),
            options,
            read_only: true,
            file: None,
            map,
            saved_slots: slots.clone(),
            slots,
            tail: file_len,
            current_index_offset: index_offset,
            previous_index_offset: previous,
            overhead: 0,
            saved_overhead: 0,
            modified: 0,
            dirty: false,
            open_writers: HashSet::new(),
        };
        Ok(Tilar {
            detail: Arc::new(Mutex::new(detail)),
        })
    }

    pub fn options(&self) -> Options {
        self.detail.lock().unwrap().options
    }

    pub fn path(&self) -> PathBuf {
        self.detail.lock().unwrap().path.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.detail.lock().unwrap().read_only
    }

    pub fn is_dirty(&self) -> bool {
        self.detail.lock().unwrap().dirty
    }

    /// Check that the archive was created with the expected options.
    pub fn expect(&self, options: Options) -> Result<()> {
        let detail = self.detail.lock().unwrap();
        if detail.options != options {
            return Err(TileStoreError::bad_file(
                detail.path.clone(),
                format!(
                    "archive options mismatch (expected {:?}, found {:?})",
                    options, detail.options
                ),
            ));
        }
        Ok(())
    }

    /// Write sink for the file at `index`. Single-use; a second writer on
    /// the same slot fails until the first one finishes.
    pub fn output(&self, index: FileIndex) -> Result<DataSink> {
        let slot = {
            let mut detail = self.detail.lock().unwrap();
            if detail.read_only {
                return Err(TileStoreError::ReadOnly(format!(
                    "archive {}",
                    detail.path.display()
                )));
            }
            let slot = slot_index(&detail.options, index, &detail.path)?;
            if !detail.open_writers.insert(slot) {
                return Err(TileStoreError::PendingTransaction(format!(
                    "slot ({}, {}, {}) in {} already has an open writer",
                    index.col,
                    index.row,
                    index.kind,
                    detail.path.display()
                )));
            }
            slot
        };

        let guard = WriterGuard {
            detail: Arc::clone(&self.detail),
            slot,
        };
        let detail = Arc::clone(&self.detail);
        let name = format!("{}:{}", slot, self.path_display());
        Ok(DataSink::new(name, move |data| {
            let _guard = guard;
            let mut detail = detail.lock().unwrap();
            append_payload(&mut detail, slot, &data)
        }))
    }

    fn path_display(&self) -> String {
        self.detail.lock().unwrap().path.display().to_string()
    }

    /// Read source for the file at `index`.
    pub fn input(&self, index: FileIndex) -> Result<DataSource> {
        let detail = self.detail.lock().unwrap();
        let slot = slot_index(&detail.options, index, &detail.path)?;
        let entry = detail.slots[slot];
        if entry.size == 0 {
            return Err(TileStoreError::NoSuchTile(format!(
                "({}, {}, {}) in {}",
                index.col,
                index.row,
                index.kind,
                detail.path.display()
            )));
        }
        let name = format!("{}-{}-{}@{}", index.col, index.row, index.kind, slot);

        let payload = read_payload(&detail, entry)?;
        match payload {
            Payload::Mapped { map, start, len } => Ok(DataSource::from_mmap(
                name,
                CONTENT_TYPE,
                detail.modified,
                map,
                start,
                len,
            )),
            Payload::Owned(data) => Ok(DataSource::from_vec(name, CONTENT_TYPE, data)),
        }
    }

    /// Remove the file at `index`; its payload becomes overhead.
    pub fn remove(&self, index: FileIndex) -> Result<()> {
        let mut detail = self.detail.lock().unwrap();
        if detail.read_only {
            return Err(TileStoreError::ReadOnly(format!(
                "archive {}",
                detail.path.display()
            )));
        }
        let slot = slot_index(&detail.options, index, &detail.path)?;
        let entry = detail.slots[slot];
        if entry.size != 0 {
            detail.overhead += entry.size + PAYLOAD_FRAMING;
            detail.slots[slot] = Slot::default();
            detail.dirty = true;
        }
        Ok(())
    }

    /// Persist the slot table as a new index block and trailer.
    pub fn flush(&self) -> Result<()> {
        let mut detail = self.detail.lock().unwrap();
        if detail.read_only {
            return Err(TileStoreError::ReadOnly(format!(
                "archive {}",
                detail.path.display()
            )));
        }
        if !detail.dirty {
            return Ok(());
        }
        flush_detail(&mut detail)
    }

    /// Revert the in-memory slot table to the last persisted index.
    pub fn discard_changes(&self) {
        let mut detail = self.detail.lock().unwrap();
        detail.slots = detail.saved_slots.clone();
        detail.overhead = detail.saved_overhead;
        detail.dirty = false;
    }

    /// All existing files.
    pub fn list(&self) -> Vec<Entry> {
        let detail = self.detail.lock().unwrap();
        let edge = detail.options.edge();
        let files = detail.options.files_per_tile as u32;
        let mut out = Vec::new();
        for (slot, entry) in detail.slots.iter().enumerate() {
            if entry.size == 0 {
                continue;
            }
            let slot = slot as u32;
            let kind = slot % files;
            let row = (slot / files) % edge;
            let col = slot / files / edge;
            out.push(Entry {
                index: FileIndex::new(col, row, kind),
                start: entry.start,
                size: entry.size,
            });
        }
        out
    }

    pub fn info(&self) -> Info {
        let detail = self.detail.lock().unwrap();
        Info {
            offset: detail.current_index_offset,
            previous_offset: detail.previous_index_offset,
            overhead: detail.overhead,
            modified: detail.modified,
        }
    }
}

enum Payload {
    Owned(Vec<u8>),
    Mapped {
        map: Arc<Mmap>,
        start: usize,
        len: usize,
    },
}

fn slot_index(options: &Options, index: FileIndex, path: &Path) -> Result<usize> {
    let edge = options.edge();
    if index.col >= edge || index.row >= edge || index.kind >= options.files_per_tile as u32 {
        return Err(TileStoreError::Key(format!(
            "file index ({}, {}, {}) out of range for archive {}",
            index.col,
            index.row,
            index.kind,
            path.display()
        )));
    }
    Ok(((index.col * edge + index.row) * options.files_per_tile as u32 + index.kind) as usize)
}

fn append_payload(detail: &mut Detail, slot: usize, data: &[u8]) -> Result<()> {
    if detail.read_only {
        return Err(TileStoreError::ReadOnly(format!(
            "archive {}",
            detail.path.display()
        )));
    }
    let tail = detail.tail;
    let file = detail.file.as_mut().expect("writable archive has a file");
    file.seek(SeekFrom::Start(tail))?;

    let mut crc = crc32fast::Hasher::new();
    crc.update(data);

    file.write_u32::<LittleEndian>(data.len() as u32)?;
    file.write_all(data)?;
    file.write_u32::<LittleEndian>(crc.finalize())?;

    let start = (tail + 4) as u32;
    let old = detail.slots[slot];
    if old.size != 0 {
        // previous content becomes unreachable
        detail.overhead += old.size + PAYLOAD_FRAMING;
    }
    detail.slots[slot] = Slot {
        start,
        size: data.len() as u32,
    };
    detail.tail = tail + 4 + data.len() as u64 + 4;
    detail.dirty = true;
    Ok(())
}

fn read_payload(detail: &Detail, entry: Slot) -> Result<Payload> {
    let start = entry.start as usize;
    let len = entry.size as usize;

    if let Some(map) = &detail.map {
        if start + len + 4 > map.len() {
            return Err(TileStoreError::BadTile(format!(
                "payload at {} exceeds archive {}",
                start,
                detail.path.display()
            )));
        }
        let stored_crc = u32::from_le_bytes(map[start + len..start + len + 4].try_into().unwrap());
        if crc32fast::hash(&map[start..start + len]) != stored_crc {
            return Err(TileStoreError::BadTile(format!(
                "payload checksum mismatch at {} in {}",
                start,
                detail.path.display()
            )));
        }
        return Ok(Payload::Mapped {
            map: Arc::clone(map),
            start,
            len,
        });
    }

    let mut file = detail.file.as_ref().expect("archive has a file");
    file.seek(SeekFrom::Start(entry.start as u64))?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data)?;
    let stored_crc = file.read_u32::<LittleEndian>()?;
    if crc32fast::hash(&data) != stored_crc {
        return Err(TileStoreError::BadTile(format!(
            "payload checksum mismatch at {} in {}",
            entry.start,
            detail.path.display()
        )));
    }
    Ok(Payload::Owned(data))
}

fn flush_detail(detail: &mut Detail) -> Result<()> {
    let index_offset = detail.tail;
    let previous = detail.current_index_offset;

    let mut block = Vec::with_capacity(8 + detail.slots.len() * 8);
    block.write_u32::<LittleEndian>(previous).unwrap();
    block
        .write_u32::<LittleEndian>(detail.slots.len() as u32)
        .unwrap();
    for slot in &detail.slots {
        block.write_u32::<LittleEndian>(slot.start).unwrap();
        block.write_u32::<LittleEndian>(slot.size).unwrap();
    }
    let checksum = crc32fast::hash(&block);
    let timestamp = now_secs();

    let file = detail.file.as_mut().expect("writable archive has a file");
    file.seek(SeekFrom::Start(index_offset))?;
    file.write_all(&block)?;
    file.write_u32::<LittleEndian>(index_offset as u32)?;
    file.write_u32::<LittleEndian>(checksum)?;
    file.write_u32::<LittleEndian>(TRAILER_MAGIC)?;
    file.write_u32::<LittleEndian>(timestamp as u32)?;
    let end = index_offset + block.len() as u64 + TRAILER_SIZE;
    file.set_len(end)?;
    file.sync_all()?;

    // the superseded index block is dead weight from now on
    if previous != 0 {
        detail.overhead += (8 + detail.slots.len() * 8) as u32 + TRAILER_SIZE as u32;
    }

    detail.previous_index_offset = previous;
    detail.current_index_offset = index_offset as u32;
    detail.saved_slots = detail.slots.clone();
    detail.saved_overhead = detail.overhead;
    detail.tail = end;
    detail.modified = timestamp;
    detail.dirty = false;
    Ok(())
}

fn read_header(file: &mut File, path: &Path) -> Result<Options> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 5];
    file.read_exact(&mut magic)
        .map_err(|_| TileStoreError::bad_file(path, "file too short for archive header"))?;
    if &magic != MAGIC {
        return Err(TileStoreError::bad_file(path, "not a tile archive"));
    }
    let version = file.read_u8()?;
    if version > VERSION {
        return Err(TileStoreError::Version {
            path: path.to_path_buf(),
            version: version as u16,
        });
    }
    let binary_order = file.read_u8()?;
    let files_per_tile = file.read_u8()?;
    let mut uuid = [0u8; 16];
    file.read_exact(&mut uuid)?;
    Ok(Options::new(
        binary_order,
        files_per_tile,
        Uuid::from_bytes(uuid),
    ))
}

/// Find the last valid trailer: the fast path looks at the end of the file,
/// the recovery path scans backward past a partial write.
fn locate_trailer(
    file: &mut File,
    path: &Path,
    options: &Options,
    file_len: u64,
) -> Result<(u32, u64, u64)> {
    let block_size = (8 + options.slot_count() * 8) as u64;

    let validate = |file: &mut File, pos: u64| -> Option<(u32, u64)> {
        if pos < HEADER_SIZE + block_size {
            return None;
        }
        file.seek(SeekFrom::Start(pos)).ok()?;
        let index_offset = file.read_u32::<LittleEndian>().ok()?;
        let checksum = file.read_u32::<LittleEndian>().ok()?;
        let magic = file.read_u32::<LittleEndian>().ok()?;
        let timestamp = file.read_u32::<LittleEndian>().ok()?;
        if magic != TRAILER_MAGIC {
            return None;
        }
        // the index block must end exactly where the trailer begins
        if index_offset as u64 + block_size != pos || (index_offset as u64) < HEADER_SIZE {
            return None;
        }
        file.seek(SeekFrom::Start(index_offset as u64)).ok()?;
        let mut block = vec![0u8; block_size as usize];
        file.read_exact(&mut block).ok()?;
        if crc32fast::hash(&block) != checksum {
            return None;
        }
        Some((index_offset, timestamp as u64))
    };

    if file_len >= HEADER_SIZE + block_size + TRAILER_SIZE {
        let pos = file_len - TRAILER_SIZE;
        if let Some((index_offset, timestamp)) = validate(file, pos) {
            return Ok((index_offset, pos, timestamp));
        }
        // partial write at the tail: walk back looking for the last trailer
        let mut pos = pos;
        while pos > HEADER_SIZE + block_size {
            pos -= 1;
            if let Some((index_offset, timestamp)) = validate(file, pos) {
                return Ok((index_offset, pos, timestamp));
            }
        }
    }

    Err(TileStoreError::bad_file(
        path,
        "no valid archive index found",
    ))
}

fn read_index(
    file: &mut File,
    path: &Path,
    options: &Options,
    index_offset: u32,
) -> Result<(u32, Vec<Slot>)> {
    file.seek(SeekFrom::Start(index_offset as u64))?;
    let previous = file.read_u32::<LittleEndian>()?;
    let count = file.read_u32::<LittleEndian>()? as usize;
    if count != options.slot_count() {
        return Err(TileStoreError::bad_file(
            path,
            format!(
                "index slot count {} does not match archive geometry {}",
                count,
                options.slot_count()
            ),
        ));
    }
    let mut slots = Vec::with_capacity(count);
    for _ in 0..count {
        let start = file.read_u32::<LittleEndian>()?;
        let size = file.read_u32::<LittleEndian>()?;
        slots.push(Slot { start, size });
    }
    Ok((previous, slots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn options() -> Options {
        Options::new(2, 2, Uuid::from_bytes([7u8; 16]))
    }

    fn write_slot(archive: &Tilar, index: FileIndex, data: &[u8]) {
        let mut sink = archive.output(index).unwrap();
        sink.write(data);
        sink.close().unwrap();
    }

    #[test]
    fn create_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");

        let archive = Tilar::create(&path, options(), CreateMode::FailIfExists).unwrap();
        write_slot(&archive, FileIndex::new(0, 0, 0), b"A");
        write_slot(&archive, FileIndex::new(1, 1, 1), b"BB");

        // reads see closed writes before flush
        let src = archive.input(FileIndex::new(0, 0, 0)).unwrap();
        assert_eq!(DataSource::bytes(&src), b"A");

        archive.flush().unwrap();
        drop(archive);

        let archive = Tilar::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(archive.options(), options());
        assert_eq!(
            DataSource::bytes(&archive.input(FileIndex::new(0, 0, 0)).unwrap()),
            b"A"
        );
        assert_eq!(
            DataSource::bytes(&archive.input(FileIndex::new(1, 1, 1)).unwrap()),
            b"BB"
        );
        assert!(matches!(
            archive.input(FileIndex::new(2, 2, 0)),
            Err(TileStoreError::NoSuchTile(_))
        ));
        assert_eq!(archive.list().len(), 2);
    }

    #[test]
    fn fail_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");
        Tilar::create(&path, options(), CreateMode::FailIfExists).unwrap();
        assert!(matches!(
            Tilar::create(&path, options(), CreateMode::FailIfExists),
            Err(TileStoreError::StorageAlreadyExists(_))
        ));
    }

    #[test]
    fn append_requires_matching_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");
        Tilar::create(&path, options(), CreateMode::Truncate).unwrap();

        let other = Options::new(3, 2, Uuid::from_bytes([9u8; 16]));
        assert!(Tilar::create(&path, other, CreateMode::Append).is_err());

        // appendOrTruncate recreates instead
        let archive = Tilar::create(&path, other, CreateMode::AppendOrTruncate).unwrap();
        assert_eq!(archive.options(), other);
    }

    #[test]
    fn overwrite_and_remove_accumulate_overhead() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");
        let archive = Tilar::create(&path, options(), CreateMode::Truncate).unwrap();

        write_slot(&archive, FileIndex::new(0, 0, 0), b"first");
        write_slot(&archive, FileIndex::new(0, 0, 0), b"second");
        assert_eq!(
            DataSource::bytes(&archive.input(FileIndex::new(0, 0, 0)).unwrap()),
            b"second"
        );
        assert_eq!(archive.info().overhead, 5 + PAYLOAD_FRAMING);

        archive.remove(FileIndex::new(0, 0, 0)).unwrap();
        assert!(matches!(
            archive.input(FileIndex::new(0, 0, 0)),
            Err(TileStoreError::NoSuchTile(_))
        ));
        assert_eq!(archive.info().overhead, 5 + 6 + 2 * PAYLOAD_FRAMING);
    }

    #[test]
    fn crash_recovery_discards_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");

        let archive = Tilar::create(&path, options(), CreateMode::Truncate).unwrap();
        write_slot(&archive, FileIndex::new(0, 0, 0), b"A");
        write_slot(&archive, FileIndex::new(1, 1, 1), b"BB");
        archive.flush().unwrap();
        drop(archive);

        // simulate a crash mid-write: unflushed payload garbage at the tail
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0x04, 0x00, 0x00, 0x00, b'C', b'C']).unwrap();
        }

        let archive =
            Tilar::create(&path, options(), CreateMode::AppendOrTruncate).unwrap();
        assert_eq!(
            DataSource::bytes(&archive.input(FileIndex::new(0, 0, 0)).unwrap()),
            b"A"
        );
        assert_eq!(
            DataSource::bytes(&archive.input(FileIndex::new(1, 1, 1)).unwrap()),
            b"BB"
        );
    }

    #[test]
    fn unflushed_writes_are_invisible_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");

        let archive = Tilar::create(&path, options(), CreateMode::Truncate).unwrap();
        write_slot(&archive, FileIndex::new(0, 0, 0), b"A");
        archive.flush().unwrap();
        write_slot(&archive, FileIndex::new(0, 0, 0), b"CCCC");
        archive.discard_changes();
        drop(archive);

        let archive = Tilar::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(
            DataSource::bytes(&archive.input(FileIndex::new(0, 0, 0)).unwrap()),
            b"A"
        );
    }

    #[test]
    fn historical_snapshot_via_index_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");

        let archive = Tilar::create(&path, options(), CreateMode::Truncate).unwrap();
        write_slot(&archive, FileIndex::new(0, 0, 0), b"old");
        archive.flush().unwrap();
        let old_offset = archive.info().offset;

        write_slot(&archive, FileIndex::new(0, 0, 0), b"new!");
        archive.flush().unwrap();
        assert_eq!(archive.info().previous_offset, old_offset);
        drop(archive);

        let snapshot = Tilar::open_at(&path, old_offset).unwrap();
        assert_eq!(
            DataSource::bytes(&snapshot.input(FileIndex::new(0, 0, 0)).unwrap()),
            b"old"
        );

        let current = Tilar::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(
            DataSource::bytes(&current.input(FileIndex::new(0, 0, 0)).unwrap()),
            b"new!"
        );
    }

    #[test]
    fn writers_are_single_use_per_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");
        let archive = Tilar::create(&path, options(), CreateMode::Truncate).unwrap();

        let mut first = archive.output(FileIndex::new(0, 0, 0)).unwrap();
        assert!(matches!(
            archive.output(FileIndex::new(0, 0, 0)),
            Err(TileStoreError::PendingTransaction(_))
        ));
        // a different slot is fine
        let mut other = archive.output(FileIndex::new(0, 1, 0)).unwrap();
        other.write(b"x");
        other.close().unwrap();

        first.write(b"y");
        first.close().unwrap();
        // slot is free again after close
        let mut again = archive.output(FileIndex::new(0, 0, 0)).unwrap();
        again.write(b"z");
        again.close().unwrap();
        archive.flush().unwrap();
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");
        Tilar::create(&path, options(), CreateMode::Truncate).unwrap();

        let archive = Tilar::open(&path, OpenMode::ReadOnly).unwrap();
        assert!(matches!(
            archive.output(FileIndex::new(0, 0, 0)),
            Err(TileStoreError::ReadOnly(_))
        ));
        assert!(matches!(
            archive.remove(FileIndex::new(0, 0, 0)),
            Err(TileStoreError::ReadOnly(_))
        ));
    }

    #[test]
    fn out_of_range_index_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");
        let archive = Tilar::create(&path, options(), CreateMode::Truncate).unwrap();
        assert!(matches!(
            archive.output(FileIndex::new(4, 0, 0)),
            Err(TileStoreError::Key(_))
        ));
        assert!(matches!(
            archive.input(FileIndex::new(0, 0, 2)),
            Err(TileStoreError::Key(_))
        ));
    }

    #[test]
    fn corrupted_payload_reports_bad_tile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.tilar");

        let archive = Tilar::create(&path, options(), CreateMode::Truncate).unwrap();
        write_slot(&archive, FileIndex::new(0, 0, 0), b"payload");
        archive.flush().unwrap();
        let start = archive.list()[0].start as u64;
        drop(archive);

        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(start)).unwrap();
            file.write_all(b"garbage").unwrap();
        }

        let archive = Tilar::open(&path, OpenMode::ReadOnly).unwrap();
        assert!(matches!(
            archive.input(FileIndex::new(0, 0, 0)),
            Err(TileStoreError::BadTile(_))
        ));
    }
}
