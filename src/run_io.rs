//! Raw little-endian key I/O for run files and the final input/output.
//!
//! The input, output, and every intermediate run share one on-disk
//! layout: a headerless, tightly packed array of fixed-width keys. This
//! module is the only place that layout is encoded/decoded, so the rest
//! of the core stays oblivious to byte order.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::error::{SortError, SortResult};
use crate::key::Key;

/// Builds the on-disk path for run `id` under `prefix`.
pub fn run_path(prefix: &Path, id: u64) -> PathBuf {
    let mut name = prefix
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(id.to_string());
    match prefix.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    }
}

/// Streams fixed-width keys out of a file one at a time.
pub struct KeyReader<K: Key> {
    path: PathBuf,
    reader: BufReader<File>,
    _marker: PhantomData<K>,
}

impl<K: Key> KeyReader<K> {
    pub fn open(path: impl Into<PathBuf>) -> SortResult<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| SortError::io(path.clone(), e))?;
        Ok(KeyReader { path, reader: BufReader::new(file), _marker: PhantomData })
    }

    /// Reads the next key, or `Ok(None)` on clean EOF. A short read
    /// (trailing partial key) is a fatal `ShortIo` error, not a silent
    /// truncation.
    pub fn next_key(&mut self) -> SortResult<Option<K>> {
        let mut buf = K::Bytes::default();
        let mut filled = 0;
        loop {
            let n = self
                .reader
                .read(&mut buf.as_mut()[filled..])
                .map_err(|e| SortError::io(self.path.clone(), e))?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == K::SIZE {
                return Ok(Some(K::from_le_bytes(buf)));
            }
        }
        if filled == 0 {
            Ok(None)
        } else {
            Err(SortError::ShortIo {
                path: self.path.clone(),
                kind: "read",
                expected: K::SIZE,
                actual: filled,
            })
        }
    }
}

/// Appends fixed-width keys to a file.
pub struct KeyWriter<K: Key> {
    path: PathBuf,
    writer: BufWriter<File>,
    _marker: PhantomData<K>,
}

impl<K: Key> KeyWriter<K> {
    pub fn create(path: impl Into<PathBuf>) -> SortResult<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| SortError::io(path.clone(), e))?;
        Ok(KeyWriter { path, writer: BufWriter::new(file), _marker: PhantomData })
    }

    /// Opens `path` for appending, creating it if it does not exist yet.
    /// Used by stage 2, whose output run is flushed in several pieces as
    /// each output buffer fills.
    pub fn open_append(path: impl Into<PathBuf>) -> SortResult<Self> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SortError::io(path.clone(), e))?;
        Ok(KeyWriter { path, writer: BufWriter::new(file), _marker: PhantomData })
    }

    pub fn write_key(&mut self, key: K) -> SortResult<()> {
        let bytes = key.to_le_bytes();
        self.writer
            .write_all(bytes.as_ref())
            .map_err(|e| SortError::io(self.path.clone(), e))
    }

    pub fn finish(mut self) -> SortResult<()> {
        self.writer.flush().map_err(|e| SortError::io(self.path.clone(), e))
    }
}

/// Renames `from` to `to`, falling back to copy+remove across devices
/// (the case `std::fs::rename` cannot handle atomically).
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}
