//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::DeployerError;

/// A file wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists (following symlinks)
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Check if a directory entry exists at this path, including dangling symlinks
    pub async fn entry_exists(&self) -> bool {
        fs::symlink_metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, DeployerError> {
        let mut file = fs::File::open(&self.path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        Ok(contents)
    }

    /// Read file contents, or `None` when the file does not exist
    pub async fn read_string_opt(&self) -> Result<Option<String>, DeployerError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, DeployerError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Write string to file
    pub async fn write_string(&self, contents: &str) -> Result<(), DeployerError> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&self.path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Serialize as pretty JSON and write atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), DeployerError> {
        let contents = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&contents).await
    }

    /// Delete the file or symlink if present. Returns whether anything was removed.
    pub async fn delete(&self) -> Result<bool, DeployerError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic write using a temporary file in the same directory.
    ///
    /// Readers observe either the previous contents or the new contents,
    /// never a partially written file.
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), DeployerError> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await?;

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DeployerError::StorageError(format!("Invalid file path: {}", self.path.display())))?;
        let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        // Write to temp file
        let mut file = fs::File::create(&temp_path).await?;
        if let Err(e) = write_and_sync(&mut file, contents).await {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        drop(file);

        // Rename to target
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Point a symlink at `target`, replacing whatever entry is at this path.
    pub async fn link_to(&self, target: &Path) -> Result<(), DeployerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.delete().await?;

        #[cfg(unix)]
        fs::symlink(target, &self.path).await?;

        #[cfg(not(unix))]
        fs::copy(target, &self.path).await.map(|_| ())?;

        Ok(())
    }
}

async fn write_and_sync(file: &mut fs::File, contents: &[u8]) -> Result<(), DeployerError> {
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}
