//! Durable deployment status records

use tracing::warn;

use crate::errors::DeployerError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::{DeploymentKey, DeploymentRecord};

/// One JSON file per deployment key at `<dir>/<template>/<tenant>.json`.
///
/// Writes go through a temp file and rename, so a reader never observes a
/// partially written record.
#[derive(Debug, Clone)]
pub struct StatusStore {
    dir: Dir,
}

impl StatusStore {
    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    pub fn file(&self, key: &DeploymentKey) -> File {
        self.dir
            .subdir(key.template_id())
            .file(&format!("{}.json", key.tenant_id()))
    }

    pub async fn write(&self, key: &DeploymentKey, record: &DeploymentRecord) -> Result<(), DeployerError> {
        self.file(key).write_json(record).await
    }

    pub async fn read(&self, key: &DeploymentKey) -> Result<Option<DeploymentRecord>, DeployerError> {
        match self.file(key).read_string_opt().await? {
            Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            None => Ok(None),
        }
    }

    /// Every readable record. Unparseable files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<DeploymentRecord>, DeployerError> {
        let mut records = Vec::new();
        if !self.dir.exists().await {
            return Ok(records);
        }

        for template_dir in self.dir.list_dirs().await? {
            for path in Dir::new(template_dir).list_files().await? {
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match File::new(&path).read_json::<DeploymentRecord>().await {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping unreadable status record {}: {}", path.display(), e),
                }
            }
        }
        Ok(records)
    }
}
