//! FileSystem trait abstraction for platform-independent file operations.
//!
//! All disk I/O the engine performs goes through this one surface so test
//! doubles and retry/backoff live in one place. Implementations:
//! - `InMemoryFs` (here) - for unit tests
//! - `NativeFs` (in notes-sync-daemon) - uses `tokio::fs`, adds the
//!   write-temp-then-rename discipline `write_atomic` requires.

use crate::error::FsError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::warn;

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub mtime_millis: u64,
    pub size: u64,
    pub is_dir: bool,
}

/// Directory entry (name only, not full path).
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction. Implementations must be
/// `Send + Sync` so managers can share one behind an `Arc` across tasks.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents, creating parent directories if needed. Not
    /// atomic: callers writing `.crdtlog`/snapshot/pack files use
    /// `write_atomic` or `append` instead; this is for best-effort files
    /// like `SD_ID` where the write-temp-then-rename ceremony is overkill.
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Write content to a temp sibling, fsync it, rename over `path`, then
    /// fsync the parent directory. Never leaves a partial file under `path`.
    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Open `path` for append (creating it if absent), write `content`,
    /// fsync. Safe across processes on filesystems with POSIX append
    /// semantics; callers must not assume atomicity across rotation.
    async fn append(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Overwrite a single byte at `offset` in place and fsync. Used by the
    /// update log codec to flip a record's status byte from `0x00` to
    /// `0x01` after its payload is durable, without rewriting the record.
    async fn patch_byte(&self, path: &str, offset: u64, byte: u8) -> Result<()>;

    /// List directory contents.
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata.
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed).
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// In-memory filesystem for unit tests.
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashMap<String, ()>>,
    mtimes: RwLock<HashMap<String, u64>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(String::new(), ());
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
            mtimes: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = Self::normalize_path(path);
        self.mtimes.write().unwrap().insert(path, mtime);
    }

    fn current_time_ms() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        self.files
            .read()
            .unwrap()
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }
        self.files.write().unwrap().insert(path.clone(), content.to_vec());
        self.mtimes.write().unwrap().insert(path, Self::current_time_ms());
        Ok(())
    }

    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        // The in-memory double has no concept of a partial write; `write`
        // is already indivisible from the point of view of a reader.
        self.write(path, content).await
    }

    async fn append(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }
        let mut files = self.files.write().unwrap();
        let entry = files.entry(path.clone()).or_default();
        entry.extend_from_slice(content);
        drop(files);
        self.mtimes.write().unwrap().insert(path, Self::current_time_ms());
        Ok(())
    }

    async fn patch_byte(&self, path: &str, offset: u64, byte: u8) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap();
        let content = files.get_mut(&path).ok_or_else(|| FsError::NotFound(path.clone()))?;
        let offset = offset as usize;
        if offset >= content.len() {
            return Err(FsError::IoFatal { path, message: "patch offset out of bounds".into() });
        }
        content[offset] = byte;
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() { String::new() } else { format!("{path}/") };

        let dirs = self.dirs.read().unwrap();
        if !path.is_empty() && !dirs.contains_key(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let files = self.files.read().unwrap();
        for file_path in files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap();
                if !rest.contains('/') && seen.insert(name.to_string()) {
                    entries.push(FileEntry { name: name.to_string(), is_dir: false });
                }
            } else if prefix.is_empty() && !file_path.contains('/') && seen.insert(file_path.clone()) {
                entries.push(FileEntry { name: file_path.clone(), is_dir: false });
            }
        }

        for dir_path in dirs.keys() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap();
                if !name.is_empty() && seen.insert(name.to_string()) {
                    entries.push(FileEntry { name: name.to_string(), is_dir: true });
                }
            } else if prefix.is_empty() && !dir_path.is_empty() && !dir_path.contains('/') && seen.insert(dir_path.clone()) {
                entries.push(FileEntry { name: dir_path.clone(), is_dir: true });
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.files.write().unwrap().remove(&path).is_some() {
            return Ok(());
        }
        if self.dirs.write().unwrap().remove(&path).is_some() {
            return Ok(());
        }
        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        Ok(self.files.read().unwrap().contains_key(&path) || self.dirs.read().unwrap().contains_key(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        if let Some(content) = self.files.read().unwrap().get(&path) {
            let mtime = self.mtimes.read().unwrap().get(&path).copied().unwrap_or(0);
            return Ok(FileStat { mtime_millis: mtime, size: content.len() as u64, is_dir: false });
        }

        if self.dirs.read().unwrap().contains_key(&path) {
            return Ok(FileStat { mtime_millis: 0, size: 0, is_dir: true });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(());
        }
        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }
        self.dirs.write().unwrap().insert(path, ());
        Ok(())
    }
}

#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write_atomic(path, content).await
    }

    async fn append(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).append(path, content).await
    }

    async fn patch_byte(&self, path: &str, offset: u64, byte: u8) -> Result<()> {
        (**self).patch_byte(path, offset, byte).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

/// Retries an `Err($body)` matching `FsError::IoTransient` with exponential
/// backoff, up to `$max_attempts` total tries. Any other error, or the
/// final attempt, is returned as-is.
macro_rules! retry_io {
    ($max_attempts:expr, $body:expr) => {{
        let mut attempt: u32 = 0;
        loop {
            match $body {
                Err(FsError::IoTransient { path, message }) if attempt + 1 < $max_attempts => {
                    attempt += 1;
                    warn!(path, message, attempt, "transient io error, retrying");
                    tokio::time::sleep(Duration::from_millis(50u64 * 2u64.pow(attempt - 1))).await;
                }
                other => break other,
            }
        }
    }};
}

/// Decorator `FileSystem` that retries `FsError::IoTransient` failures with
/// exponential backoff before giving up. Wraps `NativeFs` in production;
/// `InMemoryFs` never produces `IoTransient` so tests have no reason to wrap it.
pub struct RetryingFs<T> {
    inner: T,
    max_attempts: u32,
}

impl<T: FileSystem> RetryingFs<T> {
    pub fn new(inner: T, max_attempts: u32) -> Self {
        Self { inner, max_attempts }
    }
}

#[async_trait]
impl<T: FileSystem> FileSystem for RetryingFs<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        retry_io!(self.max_attempts, self.inner.read(path).await)
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        retry_io!(self.max_attempts, self.inner.write(path, content).await)
    }

    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        retry_io!(self.max_attempts, self.inner.write_atomic(path, content).await)
    }

    async fn append(&self, path: &str, content: &[u8]) -> Result<()> {
        retry_io!(self.max_attempts, self.inner.append(path, content).await)
    }

    async fn patch_byte(&self, path: &str, offset: u64, byte: u8) -> Result<()> {
        retry_io!(self.max_attempts, self.inner.patch_byte(path, offset, byte).await)
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        retry_io!(self.max_attempts, self.inner.list(path).await)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        retry_io!(self.max_attempts, self.inner.delete(path).await)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        retry_io!(self.max_attempts, self.inner.exists(path).await)
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        retry_io!(self.max_attempts, self.inner.stat(path).await)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        retry_io!(self.max_attempts, self.inner.mkdir(path).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_read_write_delete() {
        let fs = InMemoryFs::new();
        fs.write("test.txt", b"hello world").await.unwrap();
        assert_eq!(fs.read("test.txt").await.unwrap(), b"hello world");
        assert!(fs.exists("test.txt").await.unwrap());
        fs.delete("test.txt").await.unwrap();
        assert!(!fs.exists("test.txt").await.unwrap());
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let fs = InMemoryFs::new();
        fs.write("a/b/c.txt", b"content").await.unwrap();
        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.txt");
    }

    #[tokio::test]
    async fn append_accumulates_into_the_same_file() {
        let fs = InMemoryFs::new();
        fs.append("log.txt", b"one\n").await.unwrap();
        fs.append("log.txt", b"two\n").await.unwrap();
        assert_eq!(fs.read("log.txt").await.unwrap(), b"one\ntwo\n");
    }

    /// Fails `read` a fixed number of times with `IoTransient` before
    /// delegating to a real `InMemoryFs`, to exercise `RetryingFs`.
    struct FlakyFs {
        inner: InMemoryFs,
        remaining_failures: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl FileSystem for FlakyFs {
        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            use std::sync::atomic::Ordering;
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(FsError::IoTransient { path: path.to_string(), message: "flaky".into() });
            }
            self.inner.read(path).await
        }
        async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
            self.inner.write(path, content).await
        }
        async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
            self.inner.write_atomic(path, content).await
        }
        async fn append(&self, path: &str, content: &[u8]) -> Result<()> {
            self.inner.append(path, content).await
        }
        async fn patch_byte(&self, path: &str, offset: u64, byte: u8) -> Result<()> {
            self.inner.patch_byte(path, offset, byte).await
        }
        async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
            self.inner.list(path).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
        async fn stat(&self, path: &str) -> Result<FileStat> {
            self.inner.stat(path).await
        }
        async fn mkdir(&self, path: &str) -> Result<()> {
            self.inner.mkdir(path).await
        }
    }

    #[tokio::test]
    async fn retrying_fs_succeeds_once_failures_are_within_the_budget() {
        let inner = InMemoryFs::new();
        inner.write("note.txt", b"hello").await.unwrap();
        let flaky = FlakyFs { inner, remaining_failures: std::sync::atomic::AtomicU32::new(2) };
        let fs = RetryingFs::new(flaky, 3);

        assert_eq!(fs.read("note.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn retrying_fs_gives_up_past_max_attempts() {
        let inner = InMemoryFs::new();
        inner.write("note.txt", b"hello").await.unwrap();
        let flaky = FlakyFs { inner, remaining_failures: std::sync::atomic::AtomicU32::new(5) };
        let fs = RetryingFs::new(flaky, 3);

        let err = fs.read("note.txt").await.unwrap_err();
        assert!(matches!(err, FsError::IoTransient { .. }));
    }
}
