use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;
use crate::resolver::ResourceKind;

/// What to do with a reference whose fetch did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Remove the attribute, srcset candidate or `url(...)` token.
    #[default]
    Drop,
    /// Point the reference at the absolute remote address.
    KeepRemote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay before `attempt` (1-based; the first attempt never waits).
    /// Doubles with each further attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 2).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts.max(1)
    }
}

/// Browsing session settings handed to the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionProfile {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub headless: bool,
    pub profile_dir: Option<String>,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            user_agent: "SiteCloner/1.0".to_string(),
            viewport_width: 1920,
            viewport_height: 1080,
            headless: true,
            profile_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub max_depth: usize,
    pub max_pages: usize,
    pub download_images: bool,
    pub download_stylesheets: bool,
    pub download_scripts: bool,
    pub download_fonts: bool,
    pub follow_external_links: bool,
    pub worker_count: usize,
    pub fetch_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub failure_policy: FailurePolicy,
    pub retry: RetryPolicy,
    pub session: SessionProfile,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_pages: 50,
            download_images: true,
            download_stylesheets: true,
            download_scripts: false,
            download_fonts: true,
            follow_external_links: false,
            worker_count: 8,
            fetch_timeout_secs: 30,
            shutdown_grace_secs: 10,
            failure_policy: FailurePolicy::Drop,
            retry: RetryPolicy::default(),
            session: SessionProfile::default(),
        }
    }
}

impl MirrorConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: MirrorConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MirrorError> {
        if self.worker_count == 0 {
            return Err(MirrorError::Config("worker_count must be at least 1".into()));
        }
        if self.max_pages == 0 {
            return Err(MirrorError::Config("max_pages must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(MirrorError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Whether resources of `kind` are downloaded at all. Pages are governed
    /// by the frontier, not by these switches.
    pub fn downloads(&self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Page => true,
            ResourceKind::Stylesheet => self.download_stylesheets,
            ResourceKind::Script => self.download_scripts,
            ResourceKind::Image => self.download_images,
            ResourceKind::Font => self.download_fonts,
        }
    }
}
