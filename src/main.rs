use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use site_cloner::report::REPORT_FILE;
use site_cloner::{CloneCommand, HttpRenderer, RunReport, SeedGate, SessionHandle, WebsiteMirror};

/// Asks on the terminal before the seed page is rendered.
struct PromptGate;

impl SeedGate for PromptGate {
    fn confirm(&self, address: &Url, _session: SessionHandle) -> bool {
        print!("Render {} and start cloning? [y/N] ", address.as_str().blue());
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("site_cloner=info".parse()?))
        .with_writer(io::stderr)
        .init();

    let args = CloneCommand::parse();
    let config = args.to_config()?;
    let renderer = Arc::new(HttpRenderer::new(&config.session, config.fetch_timeout())?);

    let mut mirror = WebsiteMirror::new(&args.url, &args.output_dir, config, renderer)?;
    if args.confirm {
        mirror = mirror.with_gate(Arc::new(PromptGate));
    }

    if !args.quiet {
        println!("🚀 Cloning {}", mirror.seed().as_str().blue());
        println!("📁 Output directory: {:?}", args.output_dir);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", "⏹️  Shutting down, finishing in-flight work...".yellow());
                cancel.cancel();
            }
        });
    }

    let progress_bar = ProgressBar::new_spinner();
    progress_bar.set_style(ProgressStyle::default_spinner().template("{spinner} {msg}")?);
    let progress = mirror.progress();
    let ticker = {
        let progress_bar = progress_bar.clone();
        tokio::spawn(async move {
            loop {
                let (pages, resources) = progress.snapshot();
                progress_bar.set_message(format!("{} pages, {} resources", pages, resources));
                progress_bar.tick();
                tokio::time::sleep(Duration::from_millis(120)).await;
            }
        })
    };

    let outcome = mirror.run(cancel).await;
    ticker.abort();
    progress_bar.finish_and_clear();

    let report = outcome?;
    print_summary(&report, args.quiet);
    Ok(())
}

fn print_summary(report: &RunReport, quiet: bool) {
    let summary = &report.summary;
    if report.cancelled {
        println!("{}", "⚠️  Clone interrupted; unfinished work was skipped".yellow());
    } else if !quiet {
        println!("{}", "✅ Clone finished".green());
    }
    println!(
        "📊 Pages: {} completed, {} failed, {} skipped",
        summary.pages_completed.to_string().green(),
        summary.pages_failed.to_string().red(),
        summary.pages_skipped.to_string().yellow()
    );
    println!(
        "📦 Resources: {} succeeded, {} skipped, {} failed ({} bytes)",
        summary.succeeded.to_string().green(),
        summary.skipped.to_string().yellow(),
        summary.failed.to_string().red(),
        summary.total_bytes
    );
    if !quiet {
        for (kind, count) in &summary.by_kind {
            println!("   {:<12} {}", kind, count);
        }
    }
    println!("📝 Report: {}", report.output_dir.join(REPORT_FILE).display());
}
