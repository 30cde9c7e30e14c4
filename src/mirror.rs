use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::config::MirrorConfig;
use crate::coordinator::{Coordinator, Progress};
use crate::downloader::DownloadEngine;
use crate::error::MirrorError;
use crate::file_manager::FileManager;
use crate::frontier::CrawlTask;
use crate::renderer::{AutoConfirm, Renderer, SeedGate};
use crate::report::RunReport;

/// One cloning run from a seed address into an output directory.
pub struct WebsiteMirror {
    seed: Url,
    output_dir: PathBuf,
    config: MirrorConfig,
    renderer: Arc<dyn Renderer>,
    gate: Arc<dyn SeedGate>,
    progress: Arc<Progress>,
}

impl WebsiteMirror {
    pub fn new(
        seed: &str,
        output_dir: &Path,
        config: MirrorConfig,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, MirrorError> {
        let seed = Url::parse(seed).map_err(|source| MirrorError::InvalidSeed {
            address: seed.to_string(),
            source,
        })?;
        if !matches!(seed.scheme(), "http" | "https") {
            return Err(MirrorError::InvalidSeed {
                address: seed.to_string(),
                source: url::ParseError::EmptyHost,
            });
        }
        config.validate()?;

        Ok(Self {
            seed,
            output_dir: output_dir.to_path_buf(),
            config,
            renderer,
            gate: Arc::new(AutoConfirm),
            progress: Arc::new(Progress::default()),
        })
    }

    /// Replace the default auto-confirming seed gate.
    pub fn with_gate(mut self, gate: Arc<dyn SeedGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn seed(&self) -> &Url {
        &self.seed
    }

    pub fn progress(&self) -> Arc<Progress> {
        self.progress.clone()
    }

    /// Clone the site. Only an unavailable or declined seed is fatal; every
    /// other failure ends up in the report.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, MirrorError> {
        let files = FileManager::new(&self.output_dir).map_err(|err| MirrorError::Io {
            path: self.output_dir.clone(),
            message: format!("{:#}", err),
        })?;
        let engine = DownloadEngine::new(&self.config, files.clone())
            .map_err(|err| MirrorError::Client(format!("{:#}", err)))?;

        let coordinator = Arc::new(Coordinator::new(
            &self.seed,
            self.config.clone(),
            engine,
            self.renderer.clone(),
            cancel.clone(),
            self.progress.clone(),
        ));

        info!(
            seed = %self.seed,
            output = %self.output_dir.display(),
            max_depth = self.config.max_depth,
            max_pages = self.config.max_pages,
            workers = self.config.worker_count,
            "starting clone"
        );

        let seed_task = CrawlTask {
            address: self.seed.clone(),
            depth: 0,
            origin: None,
        };
        let unavailable = |source| MirrorError::SeedUnavailable {
            address: self.seed.to_string(),
            source,
        };

        let session = coordinator
            .bounded(self.renderer.acquire(&self.seed, &self.config.session))
            .await
            .map_err(unavailable)?;
        if !self.gate.confirm(&self.seed, session) {
            return Err(MirrorError::SeedDeclined(self.seed.to_string()));
        }
        let page = coordinator
            .bounded(self.renderer.render(session))
            .await
            .map_err(unavailable)?;
        coordinator.admit_page(&seed_task, page).await;

        let interrupted = coordinator.run().await;
        coordinator.settle();
        coordinator.finalise_links().await;

        let leftovers = files.sweep_partial_files();
        if leftovers > 0 {
            warn!(files = leftovers, "removed partially written files");
        }

        let report = RunReport::build(
            &self.seed,
            &self.output_dir,
            interrupted || cancel.is_cancelled(),
            &coordinator.board().pages(),
            &coordinator.registry().results(),
            coordinator.skipped_links(),
        );
        report.write(&files)?;

        info!(
            pages = report.summary.pages_completed,
            succeeded = report.summary.succeeded,
            skipped = report.summary.skipped,
            failed = report.summary.failed,
            cancelled = report.cancelled,
            "clone finished"
        );
        Ok(report)
    }
}
