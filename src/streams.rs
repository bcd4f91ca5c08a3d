//! Read/write stream handles handed out by drivers.
//!
//! Sources are scoped read handles over owned or memory-mapped bytes; sinks
//! buffer writes and commit on close. Closing is idempotent; dropping an
//! uncommitted sink outside a panic logs a leak warning.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::Mmap;

use crate::error::Result;

/// Stream metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStat {
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub last_modified: u64,
    pub content_type: &'static str,
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

enum Backing {
    Owned(Vec<u8>),
    Mapped { map: Arc<Mmap>, start: usize, len: usize },
}

/// A readable, seekable handle over one stored file.
pub struct DataSource {
    name: String,
    stat: SourceStat,
    backing: Backing,
    pos: usize,
}

impl DataSource {
    pub fn from_vec(name: impl Into<String>, content_type: &'static str, data: Vec<u8>) -> Self {
        let stat = SourceStat {
            size: data.len() as u64,
            last_modified: now_secs(),
            content_type,
        };
        DataSource {
            name: name.into(),
            stat,
            backing: Backing::Owned(data),
            pos: 0,
        }
    }

    pub fn from_mmap(
        name: impl Into<String>,
        content_type: &'static str,
        last_modified: u64,
        map: Arc<Mmap>,
        start: usize,
        len: usize,
    ) -> Self {
        DataSource {
            name: name.into(),
            stat: SourceStat {
                size: len as u64,
                last_modified,
                content_type,
            },
            backing: Backing::Mapped { map, start, len },
            pos: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stat(&self) -> SourceStat {
        self.stat
    }

    /// Full content as a byte slice.
    pub fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Owned(data) => data,
            Backing::Mapped { map, start, len } => &map[*start..*start + *len],
        }
    }

    /// Random access read at `offset`; returns the number of bytes read.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let bytes = self.bytes();
        if offset >= bytes.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        n
    }

    /// Content copied into an owned vector.
    pub fn read_all(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }
}

impl Read for DataSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos as u64);
        self.pos += n;
        Ok(n)
    }
}

/// A single-use write sink; bytes buffer in memory and commit on `close`.
pub struct DataSink {
    name: String,
    buffer: Vec<u8>,
    commit: Option<Box<dyn FnOnce(Vec<u8>) -> Result<()> + Send>>,
}

impl DataSink {
    pub fn new(
        name: impl Into<String>,
        commit: impl FnOnce(Vec<u8>) -> Result<()> + Send + 'static,
    ) -> Self {
        DataSink {
            name: name.into(),
            buffer: Vec::new(),
            commit: Some(Box::new(commit)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Commit buffered content. Idempotent: the second close is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.commit.take() {
            Some(commit) => commit(std::mem::take(&mut self.buffer)),
            None => Ok(()),
        }
    }
}

impl io::Write for DataSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for DataSink {
    fn drop(&mut self) {
        if self.commit.is_some() && !std::thread::panicking() {
            tracing::warn!(name = %self.name, "write sink dropped without close; content lost");
        }
    }
}
