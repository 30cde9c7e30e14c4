//! Worker pool over two lanes: pages from the frontier and resource fetches.
//!
//! Workers never wait on each other's jobs. A document is registered with
//! its references; whichever worker completes the last one seals and
//! rewrites it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MirrorConfig;
use crate::document::{DocumentBoard, DocumentId, DocumentRecord, PageStatus};
use crate::downloader::{CapturedBody, DownloadEngine, DownloadResult, FetchJob, FetchOutput};
use crate::error::RenderError;
use crate::frontier::{CrawlTask, Frontier, SkippedLink};
use crate::layout::LocalLayout;
use crate::registry::{normalize, Claim, VisitedRegistry};
use crate::renderer::{RenderedPage, Renderer};
use crate::resolver::{resolve, DocumentKind, Placement, ResourceKind, ResourceReference};
use crate::rewriter::PathRewriter;

#[derive(Debug, Default)]
pub struct Progress {
    pub pages: AtomicUsize,
    pub resources: AtomicUsize,
}

impl Progress {
    pub fn snapshot(&self) -> (usize, usize) {
        (self.pages.load(Ordering::Relaxed), self.resources.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Pages,
    Resources,
}

#[derive(Debug)]
enum Job {
    Page(CrawlTask),
    Resource(FetchJob),
}

#[derive(Debug)]
struct Lanes {
    frontier: Frontier,
    resources: VecDeque<FetchJob>,
    in_flight: usize,
    turn: Lane,
}

impl Lanes {
    fn new(frontier: Frontier) -> Self {
        Self {
            frontier,
            resources: VecDeque::new(),
            in_flight: 0,
            turn: Lane::Pages,
        }
    }

    /// Take from the lane whose turn it is, falling back to the other one.
    fn pop(&mut self) -> Option<Job> {
        let order = match self.turn {
            Lane::Pages => [Lane::Pages, Lane::Resources],
            Lane::Resources => [Lane::Resources, Lane::Pages],
        };
        for lane in order {
            let job = match lane {
                Lane::Pages => self.frontier.next().map(Job::Page),
                Lane::Resources => self.resources.pop_front().map(Job::Resource),
            };
            if let Some(job) = job {
                self.turn = match lane {
                    Lane::Pages => Lane::Resources,
                    Lane::Resources => Lane::Pages,
                };
                return Some(job);
            }
        }
        None
    }
}

enum Next {
    Run(Job),
    Idle,
    Done,
}

/// Decrements the in-flight count when a job ends, however it ends.
struct InFlight<'a>(&'a Coordinator);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lanes().in_flight -= 1;
        self.0.wake.notify_waiters();
    }
}

pub struct Coordinator {
    config: MirrorConfig,
    registry: VisitedRegistry,
    board: DocumentBoard,
    layout: LocalLayout,
    engine: DownloadEngine,
    renderer: Arc<dyn Renderer>,
    cancel: CancellationToken,
    lanes: Mutex<Lanes>,
    wake: Notify,
    claimed_kinds: Mutex<HashMap<String, ResourceKind>>,
    progress: Arc<Progress>,
}

impl Coordinator {
    pub fn new(
        seed: &Url,
        config: MirrorConfig,
        engine: DownloadEngine,
        renderer: Arc<dyn Renderer>,
        cancel: CancellationToken,
        progress: Arc<Progress>,
    ) -> Self {
        let frontier = Frontier::new(seed, &config);
        Self {
            registry: VisitedRegistry::new(),
            board: DocumentBoard::new(),
            layout: LocalLayout::new(seed),
            engine,
            renderer,
            cancel,
            lanes: Mutex::new(Lanes::new(frontier)),
            wake: Notify::new(),
            claimed_kinds: Mutex::new(HashMap::new()),
            progress,
            config,
        }
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &VisitedRegistry {
        &self.registry
    }

    pub fn board(&self) -> &DocumentBoard {
        &self.board
    }

    pub fn skipped_links(&self) -> Vec<SkippedLink> {
        self.lanes().frontier.skipped_links().to_vec()
    }

    /// Run a renderer call bounded by the fetch timeout and the shutdown
    /// token.
    pub async fn bounded<T, F>(&self, call: F) -> Result<T, RenderError>
    where
        F: Future<Output = Result<T, RenderError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RenderError::Cancelled),
            outcome = tokio::time::timeout(self.config.fetch_timeout(), call) => {
                outcome.unwrap_or(Err(RenderError::Timeout))
            }
        }
    }

    /// Start `worker_count` workers and wait until the lanes are exhausted
    /// or shutdown is requested. Returns `true` when shutdown cut the run
    /// short.
    pub async fn run(self: &Arc<Self>) -> bool {
        let mut workers = JoinSet::new();
        for index in 0..self.config.worker_count {
            workers.spawn(self.clone().worker(index));
        }

        let cancelled = tokio::select! {
            _ = join_all(&mut workers) => false,
            _ = self.cancel.cancelled() => true,
        };

        if cancelled {
            let grace = self.config.shutdown_grace();
            info!(grace_secs = grace.as_secs(), "shutdown requested, waiting for in-flight work");
            if tokio::time::timeout(grace, join_all(&mut workers)).await.is_err() {
                warn!("grace period elapsed, abandoning in-flight work");
                workers.abort_all();
                join_all(&mut workers).await;
            }
        }
        cancelled
    }

    async fn worker(self: Arc<Self>, index: usize) {
        debug!(worker = index, "worker started");
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancel.is_cancelled() {
                break;
            }

            let next = {
                let mut lanes = self.lanes();
                match lanes.pop() {
                    Some(job) => {
                        lanes.in_flight += 1;
                        Next::Run(job)
                    }
                    None if lanes.in_flight == 0 => Next::Done,
                    None => Next::Idle,
                }
            };

            match next {
                Next::Done => {
                    self.wake.notify_waiters();
                    break;
                }
                Next::Idle => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Next::Run(job) => {
                    let _in_flight = InFlight(&self);
                    match job {
                        Job::Page(task) => self.process_page(task).await,
                        Job::Resource(job) => self.process_resource(job).await,
                    }
                }
            }
        }
        debug!(worker = index, "worker stopped");
    }

    async fn process_page(&self, task: CrawlTask) {
        if self.registry.is_claimed(&normalize(&task.address)) {
            debug!(address = %task.address, "link already fetched as a resource");
            self.record_page(&task, PageStatus::Skipped, "fetched as a resource".to_string());
            return;
        }

        let rendered = self
            .bounded(async {
                let session = self.renderer.acquire(&task.address, &self.config.session).await?;
                self.renderer.render(session).await
            })
            .await;

        match rendered {
            Ok(page) => self.admit_page(&task, page).await,
            Err(error) => {
                let status = match error {
                    RenderError::NotFound(_) | RenderError::NotHtml(_) | RenderError::Cancelled => PageStatus::Skipped,
                    _ => PageStatus::Failed,
                };
                if status == PageStatus::Failed {
                    warn!(address = %task.address, depth = task.depth, %error, "page failed");
                } else {
                    info!(address = %task.address, depth = task.depth, %error, "page skipped");
                }
                self.record_page(&task, status, error.to_string());
            }
        }
    }

    /// Register a rendered page and claim its resources, then queue the
    /// links that are not resources already.
    pub async fn admit_page(&self, task: &CrawlTask, page: RenderedPage) {
        let RenderedPage {
            final_url,
            html,
            network,
            errors,
        } = page;

        let key = normalize(&task.address);
        let local_path = self.layout.assign(&key, &task.address, ResourceKind::Page);
        for error in &errors {
            debug!(address = %task.address, %error, "renderer reported a page error");
        }

        let mut references = resolve(&html, &final_url, DocumentKind::Html);
        let links: Vec<Url> = references
            .iter()
            .filter(|r| r.kind == ResourceKind::Page)
            .filter(|r| r.location.as_ref().map_or(true, |l| l.placement != Placement::Base))
            .filter_map(|r| r.address.clone())
            .collect();

        let mut known: HashSet<String> = references
            .iter()
            .filter_map(|r| r.address.as_ref().map(normalize))
            .collect();
        let mut captured = HashMap::new();
        for capture in network {
            let Some(kind) = capture.resource_kind() else {
                continue;
            };
            let capture_key = normalize(&capture.url);
            if capture.is_success() {
                if let Some(bytes) = capture.body {
                    captured.insert(
                        capture_key.clone(),
                        CapturedBody {
                            bytes,
                            content_type: capture.content_type.clone(),
                        },
                    );
                }
            }
            if known.insert(capture_key) {
                references.push(ResourceReference::captured(capture.url, kind, &final_url));
            }
        }

        info!(
            address = %task.address,
            depth = task.depth,
            references = references.len(),
            links = links.len(),
            "page rendered"
        );

        let mut record = DocumentRecord::new(DocumentKind::Html, task.address.clone(), final_url.clone(), task.depth);
        record.text = html;
        record.references = references;
        record.links = links.clone();
        record.local_path = Some(local_path);
        self.admit(record, captured).await;

        // Links to claimed resources are never crawled as pages.
        {
            let mut lanes = self.lanes();
            if normalize(&final_url) != key {
                lanes.frontier.mark_seen(&final_url);
            }
            for link in links.iter().filter(|link| !self.registry.is_claimed(&normalize(link))) {
                lanes.frontier.offer(link, task.depth, &final_url);
            }
        }
        self.wake.notify_waiters();
    }

    pub fn record_page(&self, task: &CrawlTask, status: PageStatus, detail: String) {
        let record = DocumentRecord::new(DocumentKind::Html, task.address.clone(), task.address.clone(), task.depth);
        let id = self.board.register(record);
        self.board.finish(id, status, 0, Some(detail));
    }

    /// The claim loop: every owned reference is either fetched by us, waited
    /// on, or already terminal. Seals the document if nothing is left.
    async fn admit(&self, record: DocumentRecord, mut captured: HashMap<String, CapturedBody>) {
        let references = record.references.clone();
        let id = self.board.register(record);

        let mut jobs = Vec::new();
        let mut claimed = HashSet::new();
        for reference in &references {
            if reference.kind == ResourceKind::Page || !self.config.downloads(reference.kind) {
                continue;
            }
            let Some(address) = reference.address.as_ref() else {
                continue;
            };
            let key = normalize(address);
            if !claimed.insert(key.clone()) {
                continue;
            }

            self.board.add_pending(id, &key);
            match self.registry.claim(&key, id) {
                Claim::Won => {
                    let mut address = address.clone();
                    address.set_fragment(None);
                    self.claimed_kinds
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(key.clone(), reference.kind);
                    jobs.push(FetchJob {
                        local_path: self.layout.assign(&key, &address, reference.kind),
                        captured: captured.remove(&key),
                        key,
                        address,
                        kind: reference.kind,
                    });
                }
                Claim::Waiting => {}
                Claim::Done(_) => {
                    self.board.resolve(id, &key);
                }
            }
        }

        if !jobs.is_empty() {
            self.lanes().resources.extend(jobs);
            self.wake.notify_waiters();
        }

        if self.board.arm(id) {
            self.seal(id).await;
        }
    }

    async fn process_resource(&self, job: FetchJob) {
        let FetchOutput {
            result,
            stylesheet_text,
        } = self.engine.fetch(&job, &self.registry, &self.cancel).await;
        self.progress.resources.fetch_add(1, Ordering::Relaxed);

        // The raw stylesheet is on disk, so documents referencing it can
        // seal before its own references are done.
        let waiters = self.registry.complete(&job.key, result);

        if let Some(text) = stylesheet_text {
            let references = resolve(&text, &job.address, DocumentKind::Stylesheet);
            let mut record = DocumentRecord::new(DocumentKind::Stylesheet, job.address.clone(), job.address.clone(), 0);
            record.text = text;
            record.references = references;
            record.local_path = Some(job.local_path.clone());
            self.admit(record, HashMap::new()).await;
        }

        for waiter in waiters {
            if self.board.resolve(waiter, &job.key) {
                self.seal(waiter).await;
            }
        }
    }

    async fn seal(&self, id: DocumentId) {
        let Some(record) = self.board.get(id) else {
            return;
        };
        let Some(local_path) = record.local_path.clone() else {
            self.board.finish(id, PageStatus::Failed, 0, Some("no local path".into()));
            return;
        };

        let text = PathRewriter::new(&self.registry, &self.config).rewrite(&record, None);
        let size = text.len() as u64;
        match self.engine.files().persist(local_path.clone(), text.into_bytes()).await {
            Ok(_) => {
                self.board.finish(id, PageStatus::Completed, size, None);
                if record.is_page() {
                    self.progress.pages.fetch_add(1, Ordering::Relaxed);
                    info!(address = %record.address, depth = record.depth, path = %local_path.display(), "page completed");
                } else {
                    debug!(address = %record.address, path = %local_path.display(), "stylesheet rewritten");
                }
            }
            Err(err) => {
                let detail = format!("{:#}", err);
                warn!(address = %record.address, error = %detail, "could not store document");
                self.board.finish(id, PageStatus::Failed, 0, Some(detail));
            }
        }
    }

    /// After the pool has stopped: everything not terminal becomes skipped.
    pub fn settle(&self) {
        let drained = {
            let mut lanes = self.lanes();
            lanes.resources.clear();
            lanes.frontier.drain()
        };
        if !drained.is_empty() {
            info!(pages = drained.len(), "queued pages dropped by shutdown");
        }

        let kinds = self
            .claimed_kinds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for key in self.registry.unfinished() {
            let kind = kinds.get(&key).copied().unwrap_or(ResourceKind::Image);
            for waiter in self.registry.complete(&key, DownloadResult::cancelled(&key, kind)) {
                self.board.resolve(waiter, &key);
            }
        }

        let skipped = self.board.skip_unfinished("cancelled by shutdown");
        if skipped > 0 {
            info!(documents = skipped, "unfinished documents skipped");
        }
    }

    /// Point page links at mirrored pages where they exist and at the remote
    /// address otherwise.
    pub async fn finalise_links(&self) {
        let pages = self.board.pages();
        let mut mirrored: HashMap<String, PathBuf> = HashMap::new();
        for page in pages.iter().filter(|p| p.status == PageStatus::Completed) {
            if let Some(path) = &page.local_path {
                mirrored.insert(normalize(&page.address), path.clone());
                mirrored.insert(normalize(&page.final_address), path.clone());
            }
        }

        let rewriter = PathRewriter::new(&self.registry, &self.config);
        for page in pages.iter().filter(|p| p.status == PageStatus::Completed && !p.links.is_empty()) {
            let Some(path) = page.local_path.clone() else {
                continue;
            };
            let text = rewriter.rewrite(page, Some(&mirrored));
            let size = text.len() as u64;
            match self.engine.files().persist(path, text.into_bytes()).await {
                Ok(_) => self.board.finish(page.id, PageStatus::Completed, size, None),
                Err(err) => warn!(address = %page.address, error = %format!("{:#}", err), "could not finalise links"),
            }
        }
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                warn!(error = %err, "worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::FileManager;
    use crate::renderer::MockRenderer;
    use std::path::Path;
    use tempfile::tempdir;

    fn coordinator(dir: &Path) -> Coordinator {
        let seed = Url::parse("https://example.com/").unwrap();
        let config = MirrorConfig::default();
        let engine = DownloadEngine::new(&config, FileManager::new(dir).unwrap()).unwrap();
        // No expectations: any renderer call fails the test.
        let renderer = Arc::new(MockRenderer::new());
        Coordinator::new(&seed, config, engine, renderer, CancellationToken::new(), Arc::new(Progress::default()))
    }

    fn task(address: &str) -> CrawlTask {
        CrawlTask {
            address: Url::parse(address).unwrap(),
            depth: 1,
            origin: None,
        }
    }

    fn job(address: &str) -> FetchJob {
        let address = Url::parse(address).unwrap();
        FetchJob {
            key: normalize(&address),
            address,
            kind: ResourceKind::Image,
            local_path: PathBuf::from("images/x.png"),
            captured: None,
        }
    }

    #[test]
    fn test_lanes_alternate() {
        let seed = Url::parse("https://example.com/").unwrap();
        let mut frontier = Frontier::new(&seed, &MirrorConfig::default());
        frontier.offer(&task("https://example.com/a").address, 0, &seed);
        frontier.offer(&task("https://example.com/b").address, 0, &seed);
        let mut lanes = Lanes::new(frontier);
        lanes.resources.push_back(job("https://example.com/1.png"));
        lanes.resources.push_back(job("https://example.com/2.png"));
        lanes.resources.push_back(job("https://example.com/3.png"));

        let order: Vec<&str> = std::iter::from_fn(|| lanes.pop())
            .map(|job| match job {
                Job::Page(_) => "page",
                Job::Resource(_) => "resource",
            })
            .collect();
        assert_eq!(order, vec!["page", "resource", "page", "resource", "resource"]);
    }

    #[test]
    fn test_empty_lanes() {
        let seed = Url::parse("https://example.com/").unwrap();
        let mut lanes = Lanes::new(Frontier::new(&seed, &MirrorConfig::default()));
        assert!(lanes.pop().is_none());
    }

    #[tokio::test]
    async fn test_links_to_embedded_resources_are_not_crawled() {
        let temp_dir = tempdir().unwrap();
        let coordinator = coordinator(temp_dir.path());
        let seed = Url::parse("https://example.com/").unwrap();
        let page = RenderedPage {
            final_url: seed.clone(),
            html: r#"<a href="/img/big.png"><img src="/img/big.png"></a> <a href="/about">About</a>"#.to_string(),
            network: Vec::new(),
            errors: Vec::new(),
        };
        let seed_task = CrawlTask {
            address: seed,
            depth: 0,
            origin: None,
        };
        coordinator.admit_page(&seed_task, page).await;

        let mut lanes = coordinator.lanes();
        let mut queued: Vec<String> = std::iter::from_fn(|| lanes.pop())
            .map(|job| match job {
                Job::Page(task) => format!("page {}", task.address.path()),
                Job::Resource(job) => format!("resource {}", job.address.path()),
            })
            .collect();
        queued.sort();
        assert_eq!(queued, vec!["page /about", "resource /img/big.png"]);
    }

    #[tokio::test]
    async fn test_page_task_for_a_claimed_resource_is_skipped() {
        let temp_dir = tempdir().unwrap();
        let coordinator = coordinator(temp_dir.path());
        let task = task("https://example.com/img/big.png");
        coordinator.registry().claim(&normalize(&task.address), 1);

        coordinator.process_page(task).await;

        let pages = coordinator.board().pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].status, PageStatus::Skipped);
        assert_eq!(pages[0].detail.as_deref(), Some("fetched as a resource"));
    }
}
