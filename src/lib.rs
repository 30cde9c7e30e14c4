pub mod cli;
pub mod config;
pub mod coordinator;
pub mod css;
pub mod document;
pub mod downloader;
pub mod error;
pub mod file_manager;
pub mod frontier;
pub mod layout;
pub mod mirror;
pub mod registry;
pub mod renderer;
pub mod report;
pub mod resolver;
pub mod rewriter;

// Re-export main types for convenience
pub use cli::CloneCommand;
pub use config::{FailurePolicy, MirrorConfig, RetryPolicy, SessionProfile};
pub use downloader::{DownloadEngine, DownloadResult, FetchJob, Outcome};
pub use error::{FailureKind, FetchError, MirrorError, RenderError, Severity};
pub use file_manager::FileManager;
pub use frontier::{CrawlTask, Frontier};
pub use layout::LocalLayout;
pub use mirror::WebsiteMirror;
pub use registry::{normalize, VisitedRegistry};
pub use renderer::{AutoConfirm, HttpRenderer, NetworkCapture, RenderedPage, Renderer, SeedGate, SessionHandle};
pub use report::RunReport;
pub use resolver::{resolve, DocumentKind, ResourceKind, ResourceReference};
pub use rewriter::{PathRewriter, Substitution};
