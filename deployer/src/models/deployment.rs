//! Deployment models

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeployerError;

const MAX_KEY_PART_LEN: usize = 64;

/// Identifies one deployment slot: a template deployed for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentKey {
    template_id: String,
    tenant_id: String,
}

impl DeploymentKey {
    /// Build a key, rejecting ids that are empty, too long or contain
    /// anything other than ASCII alphanumerics and `-`.
    pub fn new(template_id: impl Into<String>, tenant_id: impl Into<String>) -> Result<Self, DeployerError> {
        let template_id = template_id.into();
        let tenant_id = tenant_id.into();
        validate_key_part("template", &template_id)?;
        validate_key_part("tenant", &tenant_id)?;
        Ok(Self {
            template_id,
            tenant_id,
        })
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Name used for the supervised process
    pub fn slug(&self) -> String {
        format!("{}_{}", self.template_id, self.tenant_id)
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.template_id, self.tenant_id)
    }
}

fn validate_key_part(kind: &str, value: &str) -> Result<(), DeployerError> {
    if value.is_empty() {
        return Err(DeployerError::InvalidKey(format!("{} id is empty", kind)));
    }
    if value.len() > MAX_KEY_PART_LEN {
        return Err(DeployerError::InvalidKey(format!(
            "{} id is longer than {} characters",
            kind, MAX_KEY_PART_LEN
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(DeployerError::InvalidKey(format!(
            "{} id {:?} may only contain ASCII letters, digits and '-'",
            kind, value
        )));
    }
    Ok(())
}

/// Deployment status as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template to deploy, supplied by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDescriptor {
    pub id: String,

    /// Git URL (or local path) of the template source
    pub source_location: String,

    /// Branch or tag to fetch; remote HEAD when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Extra variables appended to the environment file
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Tenant the template is deployed for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantDescriptor {
    pub id: String,
    pub user_id: String,
    pub tracking_id: String,
    pub domain: String,
}

/// Where a deployment runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeploymentTarget {
    #[default]
    Local,
    Remote { host: String },
}

/// Everything a worker needs to run a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPayload {
    pub template: TemplateDescriptor,
    pub tenant: TenantDescriptor,

    /// Per-job timeout override; `0` disables the timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub target: DeploymentTarget,
}

impl DeploymentPayload {
    /// Key derived from the descriptor ids
    pub fn key(&self) -> Result<DeploymentKey, DeployerError> {
        DeploymentKey::new(self.template.id.clone(), self.tenant.id.clone())
    }

    /// Check that the payload is well formed and addressed to `key`
    pub fn validate(&self, key: &DeploymentKey) -> Result<(), DeployerError> {
        if self.key()? != *key {
            return Err(DeployerError::InvalidKey(format!(
                "payload is for {}/{}, not {}",
                self.template.id, self.tenant.id, key
            )));
        }
        if self.template.source_location.trim().is_empty() {
            return Err(DeployerError::ValidationError("template source location is empty".to_string()));
        }
        validate_domain(&self.tenant.domain)?;

        let mut values = vec![
            ("userId", &self.tenant.user_id),
            ("trackingId", &self.tenant.tracking_id),
        ];
        values.extend(self.template.env.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, value) in values {
            if value.contains('\n') || value.contains('\r') {
                return Err(DeployerError::ValidationError(format!("{} must be a single line", name)));
            }
        }
        for name in self.template.env.keys() {
            let valid = !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit());
            if !valid {
                return Err(DeployerError::ValidationError(format!("invalid environment variable name {:?}", name)));
            }
        }
        Ok(())
    }
}

/// Domains name files on disk, so only hostname characters are accepted
pub fn validate_domain(domain: &str) -> Result<(), DeployerError> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..");
    if !valid {
        return Err(DeployerError::ValidationError(format!("invalid domain {:?}", domain)));
    }
    Ok(())
}

/// Durable state of one deployment slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub template_id: String,
    pub tenant_id: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub logs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// Run duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentRecord {
    /// Fresh `in_progress` record for a newly admitted run
    pub fn started(key: &DeploymentKey, domain: &str, port: u16, now: DateTime<Utc>) -> Self {
        Self {
            template_id: key.template_id().to_string(),
            tenant_id: key.tenant_id().to_string(),
            status: DeploymentStatus::InProgress,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            duration: None,
            port: Some(port),
            domain: Some(domain.to_string()),
            error: None,
        }
    }

    pub fn mark_success(&mut self, now: DateTime<Utc>) {
        self.status = DeploymentStatus::Success;
        self.updated_at = now;
        self.completed_at = Some(now);
        self.failed_at = None;
        self.error = None;
        self.duration = Some(self.elapsed_ms(now));
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = DeploymentStatus::Failed;
        self.updated_at = now;
        self.failed_at = Some(now);
        self.completed_at = None;
        self.error = Some(error.into());
        self.duration = Some(self.elapsed_ms(now));
    }

    /// Time since the record was last written
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created_at).num_milliseconds().max(0) as u64
    }
}
