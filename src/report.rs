use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::document::{DocumentRecord, PageStatus};
use crate::downloader::{DownloadResult, Outcome};
use crate::error::{FailureKind, MirrorError, Severity};
use crate::file_manager::FileManager;
use crate::frontier::SkippedLink;
use crate::resolver::ResourceKind;

pub const REPORT_FILE: &str = "download_report.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pages_completed: usize,
    pub pages_failed: usize,
    pub pages_skipped: usize,
    pub total_bytes: u64,
    /// Stored resources per kind.
    pub by_kind: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageEntry {
    pub address: String,
    pub depth: usize,
    pub status: PageStatus,
    pub local_path: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceEntry {
    pub address: String,
    pub kind: ResourceKind,
    pub local_path: Option<String>,
    pub outcome: Outcome,
    pub severity: Option<Severity>,
    pub failure: Option<FailureKind>,
    pub detail: Option<String>,
    pub byte_size: u64,
    pub content_kind: Option<String>,
}

/// Everything a run did, written as `download_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub seed: String,
    pub base_domain: String,
    pub output_dir: PathBuf,
    pub cancelled: bool,
    pub summary: Summary,
    pub pages: Vec<PageEntry>,
    pub resources: Vec<ResourceEntry>,
    pub skipped_links: Vec<SkippedLink>,
}

impl RunReport {
    pub fn build(
        seed: &url::Url,
        output_dir: &Path,
        cancelled: bool,
        pages: &[DocumentRecord],
        resources: &[DownloadResult],
        mut skipped_links: Vec<SkippedLink>,
    ) -> Self {
        let mut summary = Summary::default();

        let mut page_entries: Vec<PageEntry> = pages
            .iter()
            .map(|page| {
                match page.status {
                    PageStatus::Completed => {
                        summary.pages_completed += 1;
                        summary.total_bytes += page.byte_size;
                    }
                    PageStatus::Failed => summary.pages_failed += 1,
                    _ => summary.pages_skipped += 1,
                }
                PageEntry {
                    address: page.address.to_string(),
                    depth: page.depth,
                    status: page.status,
                    local_path: page
                        .local_path
                        .as_ref()
                        .filter(|_| page.status == PageStatus::Completed)
                        .map(|p| path_string(p)),
                    detail: page.detail.clone(),
                }
            })
            .collect();
        page_entries.sort_by(|a, b| a.address.cmp(&b.address));

        let mut resource_entries: Vec<ResourceEntry> = resources
            .iter()
            .map(|result| {
                match result.outcome {
                    Outcome::Ok => {
                        summary.succeeded += 1;
                        summary.total_bytes += result.byte_size;
                        *summary.by_kind.entry(result.kind.as_str().to_string()).or_default() += 1;
                    }
                    Outcome::Skipped => summary.skipped += 1,
                    Outcome::Failed => summary.failed += 1,
                }
                ResourceEntry {
                    address: result.address.clone(),
                    kind: result.kind,
                    local_path: result.local_path.as_ref().map(|p| path_string(p)),
                    outcome: result.outcome,
                    severity: result.failure.as_ref().map(|f| f.severity),
                    failure: result.failure.as_ref().map(|f| f.kind),
                    detail: result.failure.as_ref().map(|f| f.message.clone()),
                    byte_size: result.byte_size,
                    content_kind: result.content_kind.clone(),
                }
            })
            .collect();
        resource_entries.sort_by(|a, b| a.address.cmp(&b.address));
        skipped_links.sort_by(|a, b| a.address.cmp(&b.address));

        Self {
            seed: seed.to_string(),
            base_domain: seed.host_str().unwrap_or_default().to_string(),
            output_dir: output_dir.to_path_buf(),
            cancelled,
            summary,
            pages: page_entries,
            resources: resource_entries,
            skipped_links,
        }
    }

    pub fn write(&self, files: &FileManager) -> Result<PathBuf, MirrorError> {
        let json = serde_json::to_vec_pretty(self)?;
        files
            .write_atomic(Path::new(REPORT_FILE), &json)
            .map_err(|err| MirrorError::Io {
                path: files.absolute(Path::new(REPORT_FILE)),
                message: format!("{:#}", err),
            })
    }

    pub fn resource(&self, address: &str) -> Option<&ResourceEntry> {
        self.resources.iter().find(|r| r.address == address)
    }

    pub fn page(&self, address: &str) -> Option<&PageEntry> {
        self.pages.iter().find(|p| p.address == address)
    }
}

fn path_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
