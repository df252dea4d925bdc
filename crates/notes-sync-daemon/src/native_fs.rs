//! Native filesystem implementation of the engine's `FileSystem` trait,
//! backed by `tokio::fs`. Owns the write-temp-then-rename-then-fsync
//! discipline `write_atomic` requires and the in-place byte patch the
//! update log codec uses to flip a record's status byte.

use async_trait::async_trait;
use notes_sync_core::fs::{FileEntry, FileStat, FileSystem, Result};
use notes_sync_core::FsError;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

pub struct NativeFs {
    root: PathBuf,
}

impl NativeFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn transient(path: &str, e: std::io::Error) -> FsError {
        FsError::IoTransient { path: path.to_string(), message: e.to_string() }
    }

    fn fatal(path: &str, e: std::io::Error) -> FsError {
        FsError::IoFatal { path: path.to_string(), message: e.to_string() }
    }

    async fn ensure_parent(&self, full_path: &Path, path: &str) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::transient(path, e))?;
        }
        Ok(())
    }

    async fn fsync_parent(&self, full_path: &Path, path: &str) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            if let Ok(dir) = File::open(parent).await {
                dir.sync_all().await.map_err(|e| Self::transient(path, e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        fs::read(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            _ => Self::transient(path, e),
        })
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        self.ensure_parent(&full, path).await?;
        fs::write(&full, content).await.map_err(|e| Self::transient(path, e))
    }

    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        self.ensure_parent(&full, path).await?;
        let tmp = full.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().as_simple()));

        let mut file = File::create(&tmp).await.map_err(|e| Self::transient(path, e))?;
        file.write_all(content).await.map_err(|e| Self::transient(path, e))?;
        file.sync_all().await.map_err(|e| Self::transient(path, e))?;
        drop(file);

        fs::rename(&tmp, &full).await.map_err(|e| Self::fatal(path, e))?;
        self.fsync_parent(&full, path).await
    }

    async fn append(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        self.ensure_parent(&full, path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await
            .map_err(|e| Self::transient(path, e))?;
        file.write_all(content).await.map_err(|e| Self::transient(path, e))?;
        file.sync_all().await.map_err(|e| Self::transient(path, e))
    }

    async fn patch_byte(&self, path: &str, offset: u64, byte: u8) -> Result<()> {
        let full = self.resolve(path);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&full)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
                _ => Self::transient(path, e),
            })?;
        file.seek(SeekFrom::Start(offset)).await.map_err(|e| Self::transient(path, e))?;
        file.write_all(&[byte]).await.map_err(|e| Self::transient(path, e))?;
        file.sync_all().await.map_err(|e| Self::transient(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full = self.resolve(path);
        let mut dir = fs::read_dir(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            _ => Self::transient(path, e),
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| Self::transient(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().await.map_err(|e| Self::transient(path, e))?;
            entries.push(FileEntry { name, is_dir: file_type.is_dir() });
        }
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        let metadata = fs::metadata(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            _ => Self::transient(path, e),
        })?;

        if metadata.is_dir() {
            fs::remove_dir_all(&full).await.map_err(|e| Self::transient(path, e))
        } else {
            fs::remove_file(&full).await.map_err(|e| Self::transient(path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve(path)).await.is_ok())
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full = self.resolve(path);
        let metadata = fs::metadata(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            _ => Self::transient(path, e),
        })?;

        let mtime_millis = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(FileStat { mtime_millis, size: metadata.len(), is_dir: metadata.is_dir() })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve(path)).await.map_err(|e| Self::transient(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_never_leaves_a_tmp_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new(dir.path());
        fs.write_atomic("notes/n/x.snapshot", b"payload").await.unwrap();

        assert_eq!(fs.read("notes/n/x.snapshot").await.unwrap(), b"payload");
        let siblings = fs.list("notes/n").await.unwrap();
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].name, "x.snapshot");
    }

    #[tokio::test]
    async fn patch_byte_flips_a_single_byte_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new(dir.path());
        fs.write("a.crdtlog", &[0x00, 1, 2, 3]).await.unwrap();
        fs.patch_byte("a.crdtlog", 0, 0x01).await.unwrap();
        assert_eq!(fs.read("a.crdtlog").await.unwrap(), vec![0x01, 1, 2, 3]);
    }

    #[tokio::test]
    async fn append_accumulates_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFs::new(dir.path());
        fs.append("log.txt", b"one\n").await.unwrap();
        fs.append("log.txt", b"two\n").await.unwrap();
        assert_eq!(fs.read("log.txt").await.unwrap(), b"one\ntwo\n");
    }
}
