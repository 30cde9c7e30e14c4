use clap::Parser;
use std::path::PathBuf;

use anyhow::Result;

use crate::config::{FailurePolicy, MirrorConfig};

#[derive(Parser, Debug)]
#[command(
    name = "site-cloner",
    about = "Clone a rendered website into a self-contained local copy",
    version,
    long_about = "Crawls the pages reachable from a seed address, downloads every referenced image, font, stylesheet and script exactly once, and rewrites all references to point at the local copy."
)]
pub struct CloneCommand {
    /// The seed URL to clone
    #[arg(required = true)]
    pub url: String,

    /// Output directory for the cloned site
    #[arg(short, long, default_value = "./cloned_site")]
    pub output_dir: PathBuf,

    /// JSON config file; flags given on the command line override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum link depth from the seed (0 = seed only)
    #[arg(short = 'd', long)]
    pub max_depth: Option<usize>,

    /// Maximum number of pages, seed included
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_pages: Option<u64>,

    /// Number of concurrent workers
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u64).range(1..))]
    pub workers: Option<u64>,

    /// Do not download images
    #[arg(long)]
    pub no_images: bool,

    /// Do not download stylesheets
    #[arg(long)]
    pub no_css: bool,

    /// Download scripts as well
    #[arg(long)]
    pub scripts: bool,

    /// Do not download fonts
    #[arg(long)]
    pub no_fonts: bool,

    /// Crawl links to other hosts
    #[arg(short = 'e', long)]
    pub follow_external: bool,

    /// Timeout for each fetch and render in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds in-flight work may take after Ctrl-C
    #[arg(long)]
    pub grace: Option<u64>,

    /// Point failed references at the remote address instead of dropping them
    #[arg(long)]
    pub keep_remote: bool,

    /// User agent string to use for requests
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Ask before rendering the seed page
    #[arg(long)]
    pub confirm: bool,

    /// Print the report path and totals only
    #[arg(short, long)]
    pub quiet: bool,
}

impl CloneCommand {
    /// Layer the flags over the config file (or the defaults).
    pub fn to_config(&self) -> Result<MirrorConfig> {
        let mut config = match &self.config {
            Some(path) => MirrorConfig::from_file(path)?,
            None => MirrorConfig::default(),
        };

        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        if let Some(max_pages) = self.max_pages {
            config.max_pages = max_pages as usize;
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers as usize;
        }
        if let Some(timeout) = self.timeout {
            config.fetch_timeout_secs = timeout;
        }
        if let Some(grace) = self.grace {
            config.shutdown_grace_secs = grace;
        }
        if let Some(user_agent) = &self.user_agent {
            config.session.user_agent = user_agent.clone();
        }
        if self.no_images {
            config.download_images = false;
        }
        if self.no_css {
            config.download_stylesheets = false;
        }
        if self.scripts {
            config.download_scripts = true;
        }
        if self.no_fonts {
            config.download_fonts = false;
        }
        if self.follow_external {
            config.follow_external_links = true;
        }
        if self.keep_remote {
            config.failure_policy = FailurePolicy::KeepRemote;
        }

        config.validate()?;
        Ok(config)
    }
}
