//! Object storage seen through a narrow, synchronous interface.
//!
//! The pipeline only needs three things from storage: list the blobs under a
//! prefix, stream one blob's bytes, and write a new blob. [`BlobStore`]
//! captures exactly that, so the reader and shard outputs run unchanged
//! against the in-memory store used in tests or a local directory.
//!
//! Calls block; the pipeline drives them from `spawn_blocking` tasks.

use super::cloud::{CloudIOError, CloudResult, ErrorKind};
use super::compression::Compression;
use glob::{Pattern, glob};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// A listed blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobHandle {
    pub name: String,
    pub size: u64,
}

impl BlobHandle {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Last path segment without its compression and format extensions,
    /// `in/2024/sales.csv.gz` -> `sales`.
    #[must_use]
    pub fn stem(&self) -> &str {
        let file = self.name.rsplit('/').next().unwrap_or(&self.name);
        let file = match Compression::from_path(file) {
            Some(_) => file.rsplit_once('.').map_or(file, |(head, _)| head),
            None => file,
        };
        match file.rsplit_once('.') {
            Some((head, _)) if !head.is_empty() => head,
            _ => file,
        }
    }
}

/// Byte sink for a blob being written. Nothing is visible in the store until
/// [`finish`](BlobWriter::finish) succeeds.
pub trait BlobWriter: Write + Send {
    /// Commit the blob and return its URI.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush or commit fails.
    fn finish(self: Box<Self>) -> CloudResult<String>;
}

/// Trait for blob storage operations
pub trait BlobStore: Send + Sync {
    /// Blobs whose name starts with `prefix` and ends with `suffix`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list(&self, prefix: &str, suffix: &str) -> CloudResult<Vec<BlobHandle>>;

    /// Stream the blob's raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob doesn't exist or cannot be opened
    fn open_read(&self, blob: &BlobHandle) -> CloudResult<Box<dyn Read + Send>>;

    /// Start writing a blob named `name`, replacing any existing one on finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination cannot be prepared
    fn open_write(&self, name: &str) -> CloudResult<Box<dyn BlobWriter>>;

    /// URI an external system would use to fetch `name`.
    fn uri(&self, name: &str) -> String;
}

// ============================================================================
// MemoryBlobStore
// ============================================================================

type BlobMap = Arc<Mutex<BTreeMap<String, Arc<[u8]>>>>;

/// In-memory store for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: BlobMap,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        let data: Vec<u8> = data.into();
        self.blobs.lock().insert(name.into(), Arc::from(data));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(name).map(|b| b.to_vec())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.blobs.lock().keys().cloned().collect()
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(&self, prefix: &str, suffix: &str) -> CloudResult<Vec<BlobHandle>> {
        Ok(self
            .blobs
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix) && name.ends_with(suffix))
            .map(|(name, data)| BlobHandle::new(name.clone(), data.len() as u64))
            .collect())
    }

    fn open_read(&self, blob: &BlobHandle) -> CloudResult<Box<dyn Read + Send>> {
        let data = self
            .blobs
            .lock()
            .get(&blob.name)
            .cloned()
            .ok_or_else(|| CloudIOError::not_found(format!("blob {}", blob.name)))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_write(&self, name: &str) -> CloudResult<Box<dyn BlobWriter>> {
        Ok(Box::new(MemoryBlobWriter {
            name: name.to_string(),
            buf: Vec::new(),
            blobs: Arc::clone(&self.blobs),
        }))
    }

    fn uri(&self, name: &str) -> String {
        format!("memory://{name}")
    }
}

struct MemoryBlobWriter {
    name: String,
    buf: Vec<u8>,
    blobs: BlobMap,
}

impl Write for MemoryBlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemoryBlobWriter {
    fn finish(self: Box<Self>) -> CloudResult<String> {
        let Self { name, buf, blobs } = *self;
        let uri = format!("memory://{name}");
        blobs.lock().insert(name, Arc::from(buf));
        Ok(uri)
    }
}

// ============================================================================
// LocalBlobStore
// ============================================================================

/// Blobs as files under a root directory; names use `/` separators.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        name.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn name_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

impl BlobStore for LocalBlobStore {
    fn list(&self, prefix: &str, suffix: &str) -> CloudResult<Vec<BlobHandle>> {
        let pattern = format!(
            "{}/**/*",
            Pattern::escape(&self.root.to_string_lossy())
        );
        let entries = glob(&pattern).map_err(|err| {
            CloudIOError::new(ErrorKind::InvalidInput, format!("invalid glob pattern: {pattern}"))
                .with_source(err.to_string())
        })?;

        let mut blobs = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| {
                CloudIOError::from_io(err.error(), format!("listing {}", self.root.display()))
            })?;
            if !path.is_file() {
                continue;
            }
            let Some(name) = self.name_of(&path) else {
                continue;
            };
            if name.starts_with(prefix) && name.ends_with(suffix) {
                let size = fs::metadata(&path)
                    .map_err(|err| CloudIOError::from_io(&err, format!("stat {}", path.display())))?
                    .len();
                blobs.push(BlobHandle::new(name, size));
            }
        }
        blobs.sort();
        Ok(blobs)
    }

    fn open_read(&self, blob: &BlobHandle) -> CloudResult<Box<dyn Read + Send>> {
        let path = self.path_of(&blob.name);
        let file = fs::File::open(&path)
            .map_err(|err| CloudIOError::from_io(&err, format!("open {}", path.display())))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, name: &str) -> CloudResult<Box<dyn BlobWriter>> {
        let dest = self.path_of(name);
        let dir = dest.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|err| CloudIOError::from_io(&err, format!("create {}", dir.display())))?;
        let tmp = NamedTempFile::new_in(&dir)
            .map_err(|err| CloudIOError::from_io(&err, format!("temp file in {}", dir.display())))?;
        Ok(Box::new(LocalBlobWriter {
            out: BufWriter::new(tmp),
            dest,
        }))
    }

    fn uri(&self, name: &str) -> String {
        format!("file://{}", self.path_of(name).display())
    }
}

struct LocalBlobWriter {
    out: BufWriter<NamedTempFile>,
    dest: PathBuf,
}

impl Write for LocalBlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl BlobWriter for LocalBlobWriter {
    fn finish(self: Box<Self>) -> CloudResult<String> {
        let Self { out, dest } = *self;
        let tmp = out
            .into_inner()
            .map_err(|err| CloudIOError::from_io(err.error(), format!("flush {}", dest.display())))?;
        tmp.persist(&dest)
            .map_err(|err| CloudIOError::from_io(&err.error, format!("persist {}", dest.display())))?;
        Ok(format!("file://{}", dest.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_strips_directories_and_extensions() {
        assert_eq!(BlobHandle::new("in/2024/sales.csv.gz", 0).stem(), "sales");
        assert_eq!(BlobHandle::new("sales.csv", 0).stem(), "sales");
        assert_eq!(BlobHandle::new("dir/raw", 0).stem(), "raw");
        assert_eq!(BlobHandle::new(".hidden", 0).stem(), ".hidden");
    }
}
