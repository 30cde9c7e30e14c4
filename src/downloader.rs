use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::{MirrorConfig, RetryPolicy};
use crate::error::{FailureDetail, FetchError};
use crate::file_manager::FileManager;
use crate::registry::VisitedRegistry;
use crate::resolver::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadResult {
    pub address: String,
    pub kind: ResourceKind,
    pub local_path: Option<PathBuf>,
    pub byte_size: u64,
    pub content_kind: Option<String>,
    pub outcome: Outcome,
    pub failure: Option<FailureDetail>,
    pub attempts: u32,
}

impl DownloadResult {
    /// Terminal result for a fetch that ended in `error`. Not-found and
    /// cancellation are skips; everything else is a failure.
    pub fn from_error(address: &str, kind: ResourceKind, error: &FetchError, attempts: u32) -> Self {
        let outcome = match error {
            FetchError::NotFound(_) | FetchError::Cancelled => Outcome::Skipped,
            _ => Outcome::Failed,
        };
        Self {
            address: address.to_string(),
            kind,
            local_path: None,
            byte_size: 0,
            content_kind: None,
            outcome,
            failure: Some(error.detail()),
            attempts,
        }
    }

    pub fn cancelled(address: &str, kind: ResourceKind) -> Self {
        Self::from_error(address, kind, &FetchError::Cancelled, 0)
    }

    pub fn is_stored(&self) -> bool {
        self.outcome == Outcome::Ok && self.local_path.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CapturedBody {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// One unique address to fetch, owned by the worker that won its claim.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub key: String,
    pub address: Url,
    pub kind: ResourceKind,
    pub local_path: PathBuf,
    pub captured: Option<CapturedBody>,
}

#[derive(Debug)]
pub struct FetchOutput {
    pub result: DownloadResult,
    /// Decoded text of a stored stylesheet, for the nested scan.
    pub stylesheet_text: Option<String>,
}

/// Fetches resources and persists them under the output root.
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    client: Client,
    files: FileManager,
    retry: RetryPolicy,
    timeout: Duration,
}

impl DownloadEngine {
    pub fn new(config: &MirrorConfig, files: FileManager) -> Result<Self> {
        let client = build_http_client(&config.session.user_agent, config.fetch_timeout())?;
        Ok(Self {
            client,
            files,
            retry: config.retry.clone(),
            timeout: config.fetch_timeout(),
        })
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    /// Fetch `job` and store the bytes at its local path.
    ///
    /// A result already recorded in `registry` is returned as is, without
    /// touching the network or the disk.
    pub async fn fetch(
        &self,
        job: &FetchJob,
        registry: &VisitedRegistry,
        cancel: &CancellationToken,
    ) -> FetchOutput {
        if let Some(result) = registry.result(&job.key) {
            return FetchOutput {
                result,
                stylesheet_text: None,
            };
        }
        if cancel.is_cancelled() {
            return FetchOutput {
                result: DownloadResult::cancelled(&job.key, job.kind),
                stylesheet_text: None,
            };
        }

        let (bytes, content_type, attempts) = match &job.captured {
            Some(captured) => {
                debug!(address = %job.address, kind = job.kind.as_str(), "using captured body");
                (captured.bytes.clone(), captured.content_type.clone(), 0)
            }
            None => match self.fetch_with_retry(job, cancel).await {
                Ok((bytes, content_type, attempts)) => (bytes, content_type, attempts),
                Err((error, attempts)) => {
                    match error {
                        FetchError::NotFound(_) | FetchError::Cancelled => {
                            debug!(address = %job.address, %error, "resource skipped")
                        }
                        _ => warn!(address = %job.address, %error, attempts, "resource failed"),
                    }
                    return FetchOutput {
                        result: DownloadResult::from_error(&job.key, job.kind, &error, attempts),
                        stylesheet_text: None,
                    };
                }
            },
        };

        let content_kind = content_type
            .as_deref()
            .and_then(|raw| raw.parse::<mime::Mime>().ok())
            .map(|m| m.essence_str().to_string())
            .or_else(|| mime_guess::from_path(job.address.path()).first_raw().map(str::to_string));

        let byte_size = bytes.len() as u64;
        let (stylesheet_text, decode_warning) = if job.kind == ResourceKind::Stylesheet {
            match String::from_utf8(bytes.clone()) {
                Ok(text) => (Some(text), None),
                Err(err) => {
                    let error = FetchError::Decode(err.to_string());
                    warn!(address = %job.address, %error, "stylesheet stored without nested scan");
                    (None, Some(error.detail()))
                }
            }
        } else {
            (None, None)
        };

        if let Err(err) = self.files.persist(job.local_path.clone(), bytes).await {
            let error = FetchError::Io(format!("{:#}", err));
            warn!(address = %job.address, %error, "could not store resource");
            return FetchOutput {
                result: DownloadResult::from_error(&job.key, job.kind, &error, attempts),
                stylesheet_text: None,
            };
        }

        debug!(
            address = %job.address,
            kind = job.kind.as_str(),
            path = %job.local_path.display(),
            bytes = byte_size,
            "resource stored"
        );

        FetchOutput {
            result: DownloadResult {
                address: job.key.clone(),
                kind: job.kind,
                local_path: Some(job.local_path.clone()),
                byte_size,
                content_kind,
                outcome: Outcome::Ok,
                failure: decode_warning,
                attempts,
            },
            stylesheet_text,
        }
    }

    async fn fetch_with_retry(
        &self,
        job: &FetchJob,
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, Option<String>, u32), (FetchError, u32)> {
        let mut attempt = 1;
        loop {
            let delay = self.retry.delay_for(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err((FetchError::Cancelled, attempt - 1)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.attempt(&job.address, cancel).await {
                Ok((bytes, content_type)) => return Ok((bytes, content_type, attempt)),
                Err(error) if error.is_retryable() && self.retry.allows(attempt + 1) => {
                    warn!(address = %job.address, %error, attempt, "retrying fetch");
                    attempt += 1;
                }
                Err(error) => return Err((error, attempt)),
            }
        }
    }

    async fn attempt(
        &self,
        address: &Url,
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, Option<String>), FetchError> {
        let request = async {
            let response = self.client.get(address.clone()).send().await?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                return Err(FetchError::NotFound(status.as_u16()));
            }
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = response.bytes().await?;
            Ok::<_, FetchError>((bytes.to_vec(), content_type))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, request) => {
                outcome.unwrap_or(Err(FetchError::Timeout(self.timeout)))
            }
        }
    }
}

pub fn build_http_client(user_agent: &str, timeout: Duration) -> Result<Client> {
    let client = ClientBuilder::new()
        .use_rustls_tls()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()?;

    Ok(client)
}
