//! The seam to the page-rendering collaborator.
//!
//! Rendering is a two-phase handshake: `acquire` opens a session for an
//! address and `render` resumes it to produce the final markup. Between the
//! two, the seed page passes through a [`SeedGate`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use url::Url;

use crate::config::SessionProfile;
use crate::downloader::build_http_client;
use crate::error::RenderError;
use crate::resolver::{classify_by_extension, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkCapture {
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl NetworkCapture {
    /// Static resource kind of this request, `None` for documents, API
    /// calls and anything else the cloner does not store.
    pub fn resource_kind(&self) -> Option<ResourceKind> {
        let essence = self
            .content_type
            .as_deref()
            .and_then(|raw| raw.parse::<mime::Mime>().ok())
            .map(|m| m.essence_str().to_ascii_lowercase());

        match essence.as_deref() {
            Some("text/css") => Some(ResourceKind::Stylesheet),
            Some("application/javascript") | Some("text/javascript") => Some(ResourceKind::Script),
            Some(e) if e.starts_with("image/") => Some(ResourceKind::Image),
            Some(e) if e.starts_with("font/") || e.starts_with("application/font") => {
                Some(ResourceKind::Font)
            }
            Some(_) => None,
            None => match classify_by_extension(&self.url) {
                ResourceKind::Font => Some(ResourceKind::Font),
                ResourceKind::Stylesheet => Some(ResourceKind::Stylesheet),
                _ => mime_guess::from_path(self.url.path())
                    .first()
                    .filter(|m| m.type_() == mime::IMAGE)
                    .map(|_| ResourceKind::Image),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    /// Address after redirects; the base for relative references.
    pub final_url: Url,
    pub html: String,
    pub network: Vec<NetworkCapture>,
    /// Non-fatal problems reported by the collaborator.
    pub errors: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn acquire(&self, address: &Url, profile: &SessionProfile) -> Result<SessionHandle, RenderError>;

    async fn render(&self, session: SessionHandle) -> Result<RenderedPage, RenderError>;
}

/// Decides whether the seed page may be rendered once its session exists.
pub trait SeedGate: Send + Sync {
    fn confirm(&self, address: &Url, session: SessionHandle) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl SeedGate for AutoConfirm {
    fn confirm(&self, _address: &Url, _session: SessionHandle) -> bool {
        true
    }
}

/// Renders by plain HTTP GET. No scripts run and nothing is captured from
/// the network, so discovery relies on the markup alone.
#[derive(Debug)]
pub struct HttpRenderer {
    client: Client,
    sessions: Mutex<HashMap<u64, Url>>,
    next_id: AtomicU64,
}

impl HttpRenderer {
    pub fn new(profile: &SessionProfile, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_http_client(&profile.user_agent, timeout)?,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn acquire(&self, address: &Url, _profile: &SessionProfile) -> Result<SessionHandle, RenderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, address.clone());
        Ok(SessionHandle(id))
    }

    async fn render(&self, session: SessionHandle) -> Result<RenderedPage, RenderError> {
        let address = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&session.0)
            .ok_or(RenderError::UnknownSession(session.0))?;

        let response = self.client.get(address).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(RenderError::NotFound(status.as_u16()));
        }
        if !status.is_success() {
            return Err(RenderError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase());
        if let Some(content_type) = content_type {
            if !content_type.starts_with("text/html") && !content_type.starts_with("application/xhtml+xml") {
                return Err(RenderError::NotHtml(content_type));
            }
        }

        let final_url = response.url().clone();
        let html = response.text().await?;
        Ok(RenderedPage {
            final_url,
            html,
            network: Vec::new(),
            errors: Vec::new(),
        })
    }
}
