//! Storage I/O for the chunked store

use crate::error::{PyramidError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Key/value access to store objects (chunks and metadata documents)
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read the object at `key`
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Read the object at `key`, `None` if it was never written
    async fn read_optional(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write an object, creating intermediate prefixes
    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Check if an object or prefix exists. Failing to look is an error,
    /// not absence.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete every object under `prefix`. Missing prefixes are not an error.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

/// File system I/O manager rooted at a directory
#[derive(Debug, Clone)]
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        if key.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(key)
        }
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, key: &str) -> Result<Bytes> {
        let full_path = self.full_path(key);
        let data = fs::read(&full_path)
            .await
            .map_err(|e| PyramidError::file_io(&full_path, e))?;
        Ok(Bytes::from(data))
    }

    async fn read_optional(&self, key: &str) -> Result<Option<Bytes>> {
        let full_path = self.full_path(key);
        match fs::read(&full_path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PyramidError::file_io(&full_path, e)),
        }
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(key);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PyramidError::file_io(parent, e))?;
        }

        let mut file = fs::File::create(&full_path)
            .await
            .map_err(|e| PyramidError::file_io(&full_path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| PyramidError::file_io(&full_path, e))?;
        file.flush()
            .await
            .map_err(|e| PyramidError::file_io(&full_path, e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.full_path(key);
        fs::try_exists(&full_path)
            .await
            .map_err(|e| PyramidError::file_io(&full_path, e))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let full_path = self.full_path(prefix);
        let result = match fs::metadata(&full_path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full_path).await,
            Ok(_) => fs::remove_file(&full_path).await,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| PyramidError::file_io(&full_path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_system_io() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        let data = b"chunk payload";
        io.write("0/1.2.3", data).await.unwrap();

        let read_data = io.read("0/1.2.3").await.unwrap();
        assert_eq!(&read_data[..], data);

        assert!(io.exists("0/1.2.3").await.unwrap());
        assert!(io.exists("0").await.unwrap());
        assert!(!io.exists("0/0.0.0").await.unwrap());

        io.write("0/1.2.3", b"rewritten").await.unwrap();
        assert_eq!(&io.read("0/1.2.3").await.unwrap()[..], b"rewritten");
    }

    #[tokio::test]
    async fn test_missing_objects() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        assert!(io.read_optional("temp/0.0.0").await.unwrap().is_none());
        assert!(matches!(
            io.read("temp/0.0.0").await,
            Err(PyramidError::FileIo { .. })
        ));
        io.delete_prefix("temp").await.unwrap();
    }

    #[tokio::test]
    async fn test_exists_reports_stat_errors() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        io.write("0", b"a file, not a level directory").await.unwrap();

        let result = io.exists("0/.zarray").await;
        assert!(matches!(result, Err(PyramidError::FileIo { .. })));
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        io.write("temp/0.0.0", b"a").await.unwrap();
        io.write("temp/.zarray", b"{}").await.unwrap();
        io.write("0/0.0.0", b"b").await.unwrap();

        io.delete_prefix("temp").await.unwrap();
        assert!(!io.exists("temp").await.unwrap());
        assert!(io.exists("0/0.0.0").await.unwrap());

        // A single object under the key is removed too
        io.delete_prefix("0/0.0.0").await.unwrap();
        assert!(!io.exists("0/0.0.0").await.unwrap());
    }
}
