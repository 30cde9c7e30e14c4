use std::sync::Arc;
use std::time::{Duration, Instant};

use site_cloner::document::PageStatus;
use site_cloner::file_manager::FileManager;
use site_cloner::frontier::SkipReason;
use site_cloner::{FailureKind, HttpRenderer, MirrorConfig, Outcome, WebsiteMirror};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SEED_HTML: &str = r#"<html><head><link rel="stylesheet" href="/stall.css"></head>
<body><a href="/p1">1</a> <a href="/p2">2</a> <a href="/p3">3</a><img src="/stall.png"></body></html>"#;

/// A site whose seed page answers immediately and whose every other
/// address accepts the connection but never responds.
async fn stalling_site() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                if request.starts_with("GET / ") {
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        SEED_HTML.len(),
                        SEED_HTML
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                } else {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    drop(socket);
                }
            });
        }
    });
    format!("http://{}", address)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_is_bounded_and_skips_unfinished_work() {
    let site = stalling_site().await;
    let temp_dir = tempdir().unwrap();
    let config = MirrorConfig {
        worker_count: 1,
        fetch_timeout_secs: 60,
        shutdown_grace_secs: 1,
        ..MirrorConfig::default()
    };
    let renderer = Arc::new(HttpRenderer::new(&config.session, config.fetch_timeout()).unwrap());
    let mirror = WebsiteMirror::new(&format!("{}/", site), temp_dir.path(), config, renderer).unwrap();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });
    }

    let started = Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(10), mirror.run(cancel))
        .await
        .expect("shutdown hung")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.cancelled);

    // The single worker was rendering /p1 when shutdown arrived.
    assert_eq!(report.page(&format!("{}/p1", site)).unwrap().status, PageStatus::Skipped);
    let cancelled_links: Vec<&str> = report
        .skipped_links
        .iter()
        .filter(|s| s.reason == SkipReason::Cancelled)
        .map(|s| s.address.as_str())
        .collect();
    assert_eq!(cancelled_links, vec![format!("{}/p2", site), format!("{}/p3", site)]);

    for path in ["stall.css", "stall.png"] {
        let entry = report.resource(&format!("{}/{}", site, path)).unwrap();
        assert_eq!(entry.outcome, Outcome::Skipped);
        assert_eq!(entry.failure, Some(FailureKind::Cancelled));
    }
    assert_eq!(report.summary.failed, 0);

    let files = FileManager::new(temp_dir.path()).unwrap();
    assert!(files.partial_files().is_empty());
    assert!(!temp_dir.path().join("images/stall.png").exists());
    assert!(temp_dir.path().join("download_report.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_before_seed_is_fatal() {
    let site = stalling_site().await;
    let temp_dir = tempdir().unwrap();
    let config = MirrorConfig {
        worker_count: 2,
        shutdown_grace_secs: 1,
        ..MirrorConfig::default()
    };
    let renderer = Arc::new(HttpRenderer::new(&config.session, config.fetch_timeout()).unwrap());
    let mirror = WebsiteMirror::new(&format!("{}/", site), temp_dir.path(), config, renderer).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), mirror.run(cancel))
        .await
        .expect("shutdown hung");

    // Rendering the seed is the first thing cancelled.
    assert!(matches!(result, Err(site_cloner::MirrorError::SeedUnavailable { .. })));
}
