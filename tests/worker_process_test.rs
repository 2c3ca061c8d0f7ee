//! End-to-end worker process tests: spawn the real `crawlherd worker`
//! binary against a local fixture site and verify the exit-code contract,
//! the stdout event stream, the result file and the checkpoint corpus.

use axum::extract::Path as AxumPath;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

use crawlherd::config::{FetchConfig, PipelineConfig};
use crawlherd::models::{
    DetailSelectors, ListingSelectors, PageOrder, PaginationSpec, Recipe, RunRequest, RunResult,
    Target, TargetMode, WorkerEvent,
};

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_crawlherd");

async fn listing(AxumPath(page): AxumPath<u32>) -> axum::response::Html<String> {
    listing_body(page).await
}

async fn listing_first() -> axum::response::Html<String> {
    listing_body(1).await
}

async fn listing_body(page: u32) -> axum::response::Html<String> {
    let start = (page - 1) * 5 + 1;
    let items: String = (start..start + 5)
        .map(|id| {
            format!(r#"<a class="video" href="/video/{id}" title="Clip {id}"></a>"#)
        })
        .collect();
    axum::response::Html(format!(r#"<html><body><div class="videos">{items}</div></body></html>"#))
}

async fn detail(AxumPath(id): AxumPath<u32>) -> axum::response::Html<String> {
    axum::response::Html(format!(
        r#"<html><head><title>Clip {id}</title>
           <meta name="description" content="Description {id}"></head>
           <body><video class="player" src="/media/{id}.mp4"></video></body></html>"#
    ))
}

/// Serve a small two-page fixture site on an ephemeral port.
async fn start_fixture_site() -> SocketAddr {
    let app = Router::new()
        .route("/", get(listing_first))
        .route("/page/:page", get(listing))
        .route("/video/:id", get(detail));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn recipe() -> Recipe {
    Recipe {
        pagination: PaginationSpec::Template {
            path_template: "page/{page}".to_string(),
        },
        listing: ListingSelectors {
            item_selector: "div.videos a.video".to_string(),
            title_selector: None,
            title_attr: Some("title".to_string()),
            link_attr: "href".to_string(),
            image_attr: None,
        },
        detail: DetailSelectors {
            media_selectors: vec!["video.player".to_string()],
            media_attrs: vec!["src".to_string()],
            tag_selector: None,
            marker_selector: None,
        },
        title_strip_patterns: Vec::new(),
    }
}

fn run_request(addr: SocketAddr, dir: &Path, item_delay_ms: u64) -> RunRequest {
    RunRequest {
        run_id: Uuid::new_v4(),
        targets: vec![Target {
            base_url: format!("http://{addr}/"),
            page_limit: 2,
            page_order: PageOrder::Ascending,
            item_cap: None,
            filter: None,
            mode: TargetMode::ListingAndDetail,
            render_fallback: false,
            recipe: recipe(),
        }],
        checkpoint_dir: dir.join("checkpoints"),
        result_path: dir.join("result.json"),
        fetch: FetchConfig {
            user_agent: "crawlherd-test".to_string(),
            timeout_seconds: 5,
            retry_attempts: 1,
            backoff_base_ms: 0,
            backoff_step_ms: 0,
            render_wait_seconds: 1,
            render_nav_timeout_seconds: 5,
        },
        pipeline: PipelineConfig {
            checkpoint_batch_size: 3,
            item_delay_ms,
            page_delay_ms: 0,
            default_item_cap: 100,
        },
    }
}

fn write_request(dir: &Path, request: &RunRequest) -> std::path::PathBuf {
    let path = dir.join("request.json");
    std::fs::write(&path, serde_json::to_string_pretty(request).unwrap()).unwrap();
    path
}

#[tokio::test]
async fn test_worker_crawls_fixture_site_end_to_end() {
    let addr = start_fixture_site().await;
    let dir = tempfile::tempdir().unwrap();
    let request = run_request(addr, dir.path(), 0);
    let request_path = write_request(dir.path(), &request);

    let output = tokio::time::timeout(
        Duration::from_secs(60),
        Command::new(WORKER_BIN)
            .arg("worker")
            .arg("--request")
            .arg(&request_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .expect("worker timed out")
    .expect("worker failed to spawn");

    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    // Stdout is a typed NDJSON event stream.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let events: Vec<WorkerEvent> = stdout
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, WorkerEvent::Progress { .. })));
    assert!(events.iter().any(|e| matches!(e, WorkerEvent::Log { .. })));

    // Result file holds the per-target outcome.
    let result: RunResult =
        serde_json::from_str(&std::fs::read_to_string(&request.result_path).unwrap()).unwrap();
    assert_eq!(result.outcomes.len(), 1);
    let outcome = &result.outcomes[0];
    assert!(outcome.error.is_none());
    assert_eq!(outcome.records.len(), 10);
    assert_eq!(outcome.counts.total, 10);
    assert_eq!(outcome.counts.with_video, 10);
    assert!(outcome
        .records
        .iter()
        .all(|r| r.video_url.as_deref().unwrap_or("").ends_with(".mp4")));
}

#[tokio::test]
async fn test_worker_resumes_without_refetching() {
    let addr = start_fixture_site().await;
    let dir = tempfile::tempdir().unwrap();
    let request = run_request(addr, dir.path(), 0);
    let request_path = write_request(dir.path(), &request);

    for expected_new in [10usize, 0usize] {
        let output = tokio::time::timeout(
            Duration::from_secs(60),
            Command::new(WORKER_BIN)
                .arg("worker")
                .arg("--request")
                .arg(&request_path)
                .stdout(Stdio::piped())
                .output(),
        )
        .await
        .expect("worker timed out")
        .expect("worker failed to spawn");
        assert_eq!(output.status.code(), Some(0));

        let result: RunResult =
            serde_json::from_str(&std::fs::read_to_string(&request.result_path).unwrap()).unwrap();
        assert_eq!(result.outcomes[0].records.len(), expected_new);
        assert_eq!(result.outcomes[0].counts.total, 10);
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_cancels_worker_with_cancellation_exit_code() {
    let addr = start_fixture_site().await;
    let dir = tempfile::tempdir().unwrap();
    // Slow the pipeline down so the signal lands mid-crawl.
    let request = run_request(addr, dir.path(), 300);
    let request_path = write_request(dir.path(), &request);

    let mut child = Command::new(WORKER_BIN)
        .arg("worker")
        .arg("--request")
        .arg(&request_path)
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let pid = child.id().unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let killed = std::process::Command::new("kill")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(killed.success());

    let output = tokio::time::timeout(Duration::from_secs(30), child.wait_with_output())
        .await
        .expect("worker did not exit after SIGTERM")
        .unwrap();

    // Cooperative cancellation: the cancellation-specific exit code, and a
    // checkpoint left behind for resumption.
    assert_eq!(output.status.code(), Some(3));
    let checkpoint_dir = dir.path().join("checkpoints");
    let checkpoints: Vec<_> = std::fs::read_dir(&checkpoint_dir)
        .map(|entries| entries.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(
        !checkpoints.is_empty(),
        "cancellation must leave a checkpoint behind"
    );
}
