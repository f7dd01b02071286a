//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::models::deployment::DeploymentKey;

/// On-disk layout of the deployer's state
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Deployment status records, one JSON file per key
    pub fn status_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("status"))
    }

    /// Working directories of deployed applications
    pub fn apps_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("apps"))
    }

    /// Working directory for one deployment key
    pub fn app_dir(&self, key: &DeploymentKey) -> Dir {
        self.apps_dir().subdir(key.template_id()).subdir(key.tenant_id())
    }

    /// Rolling daemon log files
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), DeployerError> {
        self.status_dir().create().await?;
        self.apps_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/tenant-deployer")
    }
}
