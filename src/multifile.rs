//! Multi-part file container.
//!
//! Tile payloads (meshes, atlases, navtiles) are stored as a sequence of
//! raw parts followed by a table: `(u32 start, u32 size)` per part,
//! `u16` part count, `u16` version, two magic bytes. Readers parse the
//! table from the tail and hand out part slices.

use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, TileStoreError};

/// One part of a multifile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub start: u32,
    pub size: u32,
}

/// Part table of a multifile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub magic: [u8; 2],
    pub version: u16,
    pub parts: Vec<Part>,
}

impl Table {
    pub fn entry(&self, index: usize, path: &Path) -> Result<Part> {
        self.parts.get(index).copied().ok_or_else(|| {
            TileStoreError::bad_file(path, format!("multifile part {index} missing"))
        })
    }

    pub fn check_parts(&self, at_least: usize, path: &Path) -> Result<()> {
        if self.parts.len() < at_least {
            return Err(TileStoreError::bad_file(
                path,
                format!(
                    "multifile has {} parts, expected at least {at_least}",
                    self.parts.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Incremental multifile writer.
pub struct Builder {
    magic: [u8; 2],
    version: u16,
    buffer: Vec<u8>,
    parts: Vec<Part>,
}

impl Builder {
    pub fn new(magic: [u8; 2], version: u16) -> Self {
        Builder {
            magic,
            version,
            buffer: Vec::new(),
            parts: Vec::new(),
        }
    }

    /// Append one part.
    pub fn add_part(&mut self, data: &[u8]) {
        self.parts.push(Part {
            start: self.buffer.len() as u32,
            size: data.len() as u32,
        });
        self.buffer.extend_from_slice(data);
    }

    /// Append a part produced by a writer closure.
    pub fn add_part_with(&mut self, op: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> Result<()> {
        let start = self.buffer.len() as u32;
        op(&mut self.buffer)?;
        self.parts.push(Part {
            start,
            size: self.buffer.len() as u32 - start,
        });
        Ok(())
    }

    /// Serialize parts plus table.
    pub fn finish(self) -> Vec<u8> {
        let mut out = self.buffer;
        for part in &self.parts {
            out.write_u32::<LittleEndian>(part.start).unwrap();
            out.write_u32::<LittleEndian>(part.size).unwrap();
        }
        out.write_u16::<LittleEndian>(self.parts.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(self.version).unwrap();
        Write::write_all(&mut out, &self.magic).unwrap();
        out
    }
}

/// Parse the table from the tail of `data`, expecting `magic` and a
/// version of at most `max_version`.
pub fn read_table(
    data: &[u8],
    magic: [u8; 2],
    max_version: u16,
    path: &Path,
) -> Result<Table> {
    if data.len() < 6 {
        return Err(TileStoreError::bad_file(path, "multifile too short"));
    }
    let tail = &data[data.len() - 6..];
    let mut cursor = tail;
    let count = cursor.read_u16::<LittleEndian>()? as usize;
    let version = cursor.read_u16::<LittleEndian>()?;
    if tail[4..6] != magic {
        return Err(TileStoreError::bad_file(path, "bad multifile magic"));
    }
    if version > max_version {
        return Err(TileStoreError::Version {
            path: path.to_path_buf(),
            version,
        });
    }

    let table_size = 6 + count * 8;
    if data.len() < table_size {
        return Err(TileStoreError::bad_file(path, "multifile table truncated"));
    }
    let mut entries = &data[data.len() - table_size..data.len() - 6];
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let start = entries.read_u32::<LittleEndian>()?;
        let size = entries.read_u32::<LittleEndian>()?;
        if (start + size) as usize > data.len() - table_size {
            return Err(TileStoreError::bad_file(
                path,
                "multifile part exceeds payload area",
            ));
        }
        parts.push(Part { start, size });
    }
    Ok(Table {
        magic,
        version,
        parts,
    })
}

/// Slice of one part.
pub fn part_slice<'a>(data: &'a [u8], part: Part) -> &'a [u8] {
    &data[part.start as usize..(part.start + part.size) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut builder = Builder::new(*b"XX", 3);
        builder.add_part(b"first");
        builder.add_part(b"");
        builder.add_part(b"third");
        let data = builder.finish();

        let table = read_table(&data, *b"XX", 3, Path::new("t")).unwrap();
        assert_eq!(table.version, 3);
        assert_eq!(table.parts.len(), 3);
        assert_eq!(part_slice(&data, table.parts[0]), b"first");
        assert_eq!(part_slice(&data, table.parts[1]), b"");
        assert_eq!(part_slice(&data, table.parts[2]), b"third");
    }

    #[test]
    fn rejects_wrong_magic_and_future_version() {
        let data = Builder::new(*b"AB", 1).finish();
        assert!(read_table(&data, *b"CD", 1, Path::new("t")).is_err());
        assert!(matches!(
            read_table(&data, *b"AB", 0, Path::new("t")),
            Err(TileStoreError::Version { .. })
        ));
    }

    #[test]
    fn rejects_truncated_table() {
        let data = Builder::new(*b"AB", 1).finish();
        assert!(read_table(&data[..3], *b"AB", 1, Path::new("t")).is_err());
    }
}
