//! The crawl pipeline executed inside a worker process.
//!
//! Per target: paginate the listing, fetch (with escalation), extract,
//! deduplicate against the checkpointed corpus, and merge incrementally.
//! One item's failure produces an error-flagged record; one page's failure
//! skips that page; the target only fails outright when zero pages could
//! be fetched.

use chrono::Utc;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::models::{
    Record, RecordCounts, RunRequest, RunResult, Target, TargetMode, TargetOutcome, WorkerEvent,
    WorkerLogLevel,
};

pub mod extract;
pub mod fetch;
pub mod paginate;

use extract::{extract_detail, extract_listing, ListingItem};
use fetch::{EscalatingFetcher, FetchResult, FetchStrategy};
use paginate::Pager;

/// Emit one event on stdout. The parent treats these as log capture and
/// best-effort progress, never as control input. Flushed per line: the
/// pipe to the supervisor is block-buffered otherwise.
fn emit(event: &WorkerEvent) {
    use std::io::Write;
    if let Ok(line) = serde_json::to_string(event) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

fn emit_log(level: WorkerLogLevel, message: String) {
    emit(&WorkerEvent::Log { level, message });
}

fn emit_progress(pairs: Vec<(&str, Value)>) {
    let patch = pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    emit(&WorkerEvent::Progress { patch });
}

/// Worker process entrypoint. Reads the run request, crawls each target,
/// writes the result file, and returns the process exit code: 0 on
/// completion, 3 on cooperative cancellation, 1 on catastrophic failure.
pub async fn run_worker(request_path: &Path) -> i32 {
    let request: RunRequest = match std::fs::read_to_string(request_path)
        .map_err(|e| e.to_string())
        .and_then(|contents| serde_json::from_str(&contents).map_err(|e| e.to_string()))
    {
        Ok(request) => request,
        Err(e) => {
            emit_log(
                WorkerLogLevel::Error,
                format!("unreadable run request {}: {}", request_path.display(), e),
            );
            return 1;
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    emit_progress(vec![
        ("phase", json!("starting")),
        ("targets", json!(request.targets.len())),
        ("target_index", json!(0)),
    ]);

    let mut outcomes = Vec::new();
    for (index, target) in request.targets.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        emit_progress(vec![
            ("target_index", json!(index)),
            ("target", json!(target.base_url)),
        ]);

        let marker = target.recipe.detail.marker_selector.clone();
        let outcome = match EscalatingFetcher::for_target(
            &request.fetch,
            target.render_fallback,
            marker,
        ) {
            Ok(fetcher) => {
                run_target(
                    &fetcher,
                    target,
                    &request.checkpoint_dir,
                    &request.pipeline,
                    &cancel,
                )
                .await
            }
            Err(e) => failed_outcome(target, format!("fetch client setup failed: {e}")),
        };

        if let Some(error) = &outcome.error {
            emit_log(
                WorkerLogLevel::Error,
                format!("target {} failed: {}", target.base_url, error),
            );
        } else {
            emit_log(
                WorkerLogLevel::Info,
                format!(
                    "target {} done: {} new records, {} total",
                    target.base_url,
                    outcome.records.len(),
                    outcome.counts.total
                ),
            );
        }
        outcomes.push(outcome);
    }

    let canceled = cancel.load(Ordering::SeqCst);
    let result = RunResult { outcomes };
    let result_ok = write_result(&request.result_path, &result);

    emit_progress(vec![
        ("phase", json!(if canceled { "canceled" } else { "finished" })),
        ("current_url", Value::Null),
    ]);

    if canceled {
        3
    } else if result_ok {
        0
    } else {
        1
    }
}

/// Write the per-target outcomes next to the checkpoints, atomically.
fn write_result(path: &Path, result: &RunResult) -> bool {
    let contents = match serde_json::to_string_pretty(result) {
        Ok(contents) => contents,
        Err(e) => {
            emit_log(WorkerLogLevel::Error, format!("result serialization failed: {e}"));
            return false;
        }
    };
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            emit_log(WorkerLogLevel::Error, format!("result dir creation failed: {e}"));
            return false;
        }
    }
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp, contents).and_then(|_| std::fs::rename(&tmp, path)) {
        emit_log(WorkerLogLevel::Error, format!("result write failed: {e}"));
        return false;
    }
    true
}

fn failed_outcome(target: &Target, error: String) -> TargetOutcome {
    TargetOutcome {
        base_url: target.base_url.clone(),
        exit_code: 1,
        error: Some(error),
        counts: RecordCounts::default(),
        records: Vec::new(),
    }
}

/// Crawl one target. Never panics or aborts the worker; failures are
/// captured in the outcome.
pub async fn run_target(
    fetcher: &dyn FetchStrategy,
    target: &Target,
    checkpoint_dir: &Path,
    config: &PipelineConfig,
    cancel: &AtomicBool,
) -> TargetOutcome {
    match crawl_target(fetcher, target, checkpoint_dir, config, cancel).await {
        Ok(outcome) => outcome,
        Err(e) => failed_outcome(target, e),
    }
}

async fn crawl_target(
    fetcher: &dyn FetchStrategy,
    target: &Target,
    checkpoint_dir: &Path,
    config: &PipelineConfig,
    cancel: &AtomicBool,
) -> Result<TargetOutcome, String> {
    let mut store =
        CheckpointStore::open(checkpoint_dir, &target.base_url).map_err(|e| e.to_string())?;
    let known_links = store.known_links();
    let item_cap = target.item_cap.unwrap_or(config.default_item_cap) as usize;
    let filter = target.filter.as_ref().map(|f| f.to_lowercase());

    let mut pager = Pager::new(
        &target.recipe.pagination,
        &target.base_url,
        target.page_limit,
        target.page_order,
        store.last_page(),
    )
    .map_err(|e| e.to_string())?;

    let mut prev_body: Option<String> = None;
    let mut pages_attempted = 0u32;
    let mut pages_fetched = 0u32;
    let mut matched = 0usize;
    let mut since_checkpoint = 0usize;
    let mut new_records: Vec<Record> = Vec::new();
    let mut canceled = false;

    'pages: while let Some((page_index, page_url)) = pager.next_url(prev_body.as_deref()) {
        if cancel.load(Ordering::SeqCst) {
            canceled = true;
            break;
        }
        if new_records.len() >= item_cap {
            break;
        }

        pages_attempted += 1;
        emit_progress(vec![
            ("phase", json!("listing")),
            ("page", json!(page_index)),
            ("page_limit", json!(target.page_limit)),
            ("current_url", json!(page_url)),
            ("items_new", json!(new_records.len())),
        ]);

        let body = match fetcher.fetch(&page_url, Some(&target.base_url)).await {
            Ok(FetchResult::Body(body)) => body,
            Ok(other) => {
                emit_log(
                    WorkerLogLevel::Warn,
                    format!(
                        "listing page {page_index} ({page_url}) yielded no body ({})",
                        if other == FetchResult::Blocked {
                            "blocked"
                        } else {
                            "fetch failed"
                        }
                    ),
                );
                prev_body = None;
                // Without a body the link-following strategy has nothing
                // to derive the next URL from.
                if matches!(pager, Pager::NextLink(_)) {
                    break;
                }
                continue;
            }
            Err(e) => {
                emit_log(
                    WorkerLogLevel::Warn,
                    format!("listing page {page_index} ({page_url}) failed: {e}"),
                );
                prev_body = None;
                if matches!(pager, Pager::NextLink(_)) {
                    break;
                }
                continue;
            }
        };
        pages_fetched += 1;

        let items = extract_listing(
            &body,
            &target.recipe.listing,
            &target.base_url,
            &target.recipe.title_strip_patterns,
        );
        emit_log(
            WorkerLogLevel::Debug,
            format!("page {page_index}: {} candidate items", items.len()),
        );

        for item in &items {
            if cancel.load(Ordering::SeqCst) {
                canceled = true;
                break 'pages;
            }
            if new_records.len() >= item_cap {
                break 'pages;
            }

            if let Some(filter) = &filter {
                if !item.title.to_lowercase().contains(filter) {
                    continue;
                }
            }
            matched += 1;

            // Links already in the same-host corpus are not refetched.
            if known_links.contains(&item.link)
                || new_records.iter().any(|r| r.link == item.link)
            {
                continue;
            }

            let record = match target.mode {
                TargetMode::ListingOnly => record_from_listing(item),
                TargetMode::ListingAndDetail => {
                    emit_progress(vec![
                        ("phase", json!("detail")),
                        ("current_url", json!(item.link)),
                        ("items_new", json!(new_records.len())),
                    ]);
                    // Detail fetches carry the originating listing page as
                    // referer.
                    match fetcher.fetch(&item.link, Some(&page_url)).await {
                        Ok(FetchResult::Body(detail_body)) => extract_detail(
                            &detail_body,
                            item,
                            &target.recipe.detail,
                            &target.base_url,
                            &target.recipe.title_strip_patterns,
                        ),
                        Ok(_) | Err(_) => error_record(item, "failed to fetch detail page"),
                    }
                }
            };

            store.upsert(record.clone());
            store.set_position(page_index, Some(record.link.clone()));
            new_records.push(record);
            since_checkpoint += 1;

            if since_checkpoint >= config.checkpoint_batch_size {
                checkpoint(&mut store);
                since_checkpoint = 0;
            }

            if config.item_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(config.item_delay_ms)).await;
            }
        }

        store.set_position(page_index, None);
        checkpoint(&mut store);
        since_checkpoint = 0;
        prev_body = Some(body);

        if config.page_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.page_delay_ms)).await;
        }
    }

    checkpoint(&mut store);

    let error = if canceled {
        None
    } else if pages_attempted > 0 && pages_fetched == 0 {
        Some("no listing pages could be fetched".to_string())
    } else {
        None
    };

    Ok(TargetOutcome {
        base_url: target.base_url.clone(),
        exit_code: i32::from(error.is_some()),
        error,
        counts: compute_counts(&store, matched),
        records: new_records,
    })
}

/// Checkpoint persistence is best-effort: a failed write is logged and the
/// pipeline continues in memory.
fn checkpoint(store: &mut CheckpointStore) {
    if let Err(e) = store.save() {
        warn!("Checkpoint write failed: {}", e);
        emit_log(WorkerLogLevel::Warn, format!("checkpoint write failed: {e}"));
    }
}

fn record_from_listing(item: &ListingItem) -> Record {
    Record {
        title: item.title.clone(),
        title_raw: item.title_raw.clone(),
        link: item.link.clone(),
        image_url: item.image_url.clone(),
        video_url: None,
        meta_description: None,
        og_title: None,
        og_description: None,
        tags: Vec::new(),
        published: false,
        fresh: true,
        error: None,
        scraped_at: Utc::now(),
    }
}

fn error_record(item: &ListingItem, error: &str) -> Record {
    let mut record = record_from_listing(item);
    record.error = Some(error.to_string());
    record
}

fn compute_counts(store: &CheckpointStore, matched: usize) -> RecordCounts {
    let records = store.records();
    RecordCounts {
        total: records.len(),
        matched,
        with_image: records.iter().filter(|r| r.image_url.is_some()).count(),
        with_video: records.iter().filter(|r| r.video_url.is_some()).count(),
        publishable: records
            .iter()
            .filter(|r| r.error.is_none() && r.video_url.is_some())
            .count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DetailSelectors, ListingSelectors, PageOrder, PaginationSpec, Recipe,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Serves canned bodies and counts every fetch per URL.
    struct MapFetcher {
        pages: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
        detail_fetches: AtomicUsize,
    }

    impl MapFetcher {
        fn new(pages: Vec<(&str, String)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: Mutex::new(Vec::new()),
                detail_fetches: AtomicUsize::new(0),
            }
        }

        fn fetched_urls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FetchStrategy for MapFetcher {
        async fn fetch(
            &self,
            url: &str,
            _referer: Option<&str>,
        ) -> Result<FetchResult, crate::errors::FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            if url.contains("/video/") {
                self.detail_fetches.fetch_add(1, Ordering::SeqCst);
            }
            Ok(self
                .pages
                .get(url)
                .map(|body| FetchResult::Body(body.clone()))
                .unwrap_or(FetchResult::NoBody))
        }
    }

    fn recipe() -> Recipe {
        Recipe {
            pagination: PaginationSpec::Template {
                path_template: "page/{page}/".to_string(),
            },
            listing: ListingSelectors {
                item_selector: "a.video".to_string(),
                title_selector: Some("h2".to_string()),
                title_attr: Some("title".to_string()),
                link_attr: "href".to_string(),
                image_attr: None,
            },
            detail: DetailSelectors {
                media_selectors: vec!["video".to_string()],
                media_attrs: vec!["src".to_string()],
                tag_selector: None,
                marker_selector: None,
            },
            title_strip_patterns: Vec::new(),
        }
    }

    fn target(page_limit: u32) -> Target {
        Target {
            base_url: "https://x.test/".to_string(),
            page_limit,
            page_order: PageOrder::Ascending,
            item_cap: None,
            filter: None,
            mode: TargetMode::ListingAndDetail,
            render_fallback: false,
            recipe: recipe(),
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            checkpoint_batch_size: 3,
            item_delay_ms: 0,
            page_delay_ms: 0,
            default_item_cap: 100,
        }
    }

    fn listing_page(ids: &[u32]) -> String {
        let items: String = ids
            .iter()
            .map(|id| {
                format!(
                    r#"<a class="video" href="/video/{id}" title="Clip {id}"></a>"#
                )
            })
            .collect();
        format!("<html><body>{items}</body></html>")
    }

    fn detail_page(id: u32) -> String {
        format!(
            r#"<html><head><title>Clip {id}</title></head>
               <body><video src="/media/{id}.mp4"></video></body></html>"#
        )
    }

    fn seed_known_links(dir: &Path, ids: &[u32]) {
        let mut store = CheckpointStore::open(dir, "https://x.test/").unwrap();
        for id in ids {
            let item = ListingItem {
                title: format!("Clip {id}"),
                title_raw: format!("Clip {id}"),
                link: format!("https://x.test/video/{id}"),
                image_url: None,
            };
            store.upsert(record_from_listing(&item));
        }
        store.save().unwrap();
    }

    fn two_page_site() -> Vec<(String, String)> {
        let mut pages = vec![
            ("https://x.test/".to_string(), listing_page(&[1, 2, 3, 4, 5])),
            (
                "https://x.test/page/2/".to_string(),
                listing_page(&[6, 7, 8, 9, 10]),
            ),
        ];
        for id in 1..=10 {
            pages.push((format!("https://x.test/video/{id}"), detail_page(id)));
        }
        pages
    }

    #[tokio::test]
    async fn test_known_links_are_not_refetched() {
        let dir = tempfile::tempdir().unwrap();
        seed_known_links(dir.path(), &[2, 4, 6]);

        let pages = two_page_site();
        let fetcher = MapFetcher::new(pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect());
        let cancel = AtomicBool::new(false);

        let outcome = run_target(&fetcher, &target(2), dir.path(), &fast_config(), &cancel).await;

        assert!(outcome.error.is_none());
        // 3 of the 10 listed links were already known: exactly 7 new items.
        assert_eq!(outcome.records.len(), 7);
        assert_eq!(outcome.counts.total, 10);
        assert_eq!(fetcher.detail_fetches.load(Ordering::SeqCst), 7);
        for known in ["/video/2", "/video/4", "/video/6"] {
            assert!(
                !fetcher
                    .fetched_urls()
                    .iter()
                    .any(|u| u.ends_with(known)),
                "known link {known} must not be refetched"
            );
        }

        // Final corpus holds 10 unique links.
        let store = CheckpointStore::open(dir.path(), "https://x.test/").unwrap();
        assert_eq!(store.len(), 10);
    }

    #[tokio::test]
    async fn test_resume_refetches_nothing_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let pages = two_page_site();
        let cancel = AtomicBool::new(false);

        let first = MapFetcher::new(pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect());
        let outcome = run_target(&first, &target(2), dir.path(), &fast_config(), &cancel).await;
        assert_eq!(outcome.records.len(), 10);

        // Second pass over the same site resumes from the checkpoint and
        // fetches no detail page again.
        let second = MapFetcher::new(pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect());
        let outcome = run_target(&second, &target(2), dir.path(), &fast_config(), &cancel).await;
        assert_eq!(outcome.records.len(), 0);
        assert_eq!(second.detail_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.counts.total, 10);
    }

    #[tokio::test]
    async fn test_failed_page_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = two_page_site();
        // Page 1 missing entirely: fetch yields no body.
        pages.retain(|(url, _)| url != "https://x.test/");

        let fetcher = MapFetcher::new(pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect());
        let cancel = AtomicBool::new(false);
        let outcome = run_target(&fetcher, &target(2), dir.path(), &fast_config(), &cancel).await;

        assert!(outcome.error.is_none(), "one bad page must not fail the target");
        assert_eq!(outcome.records.len(), 5);
    }

    #[tokio::test]
    async fn test_target_fails_when_no_page_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MapFetcher::new(Vec::new());
        let cancel = AtomicBool::new(false);
        let outcome = run_target(&fetcher, &target(2), dir.path(), &fast_config(), &cancel).await;

        assert!(outcome.error.is_some());
        assert_eq!(outcome.exit_code, 1);
    }

    #[tokio::test]
    async fn test_item_failure_produces_error_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = vec![("https://x.test/".to_string(), listing_page(&[1, 2]))];
        pages.push(("https://x.test/video/1".to_string(), detail_page(1)));
        // Detail for item 2 is missing: flagged record, pipeline continues.

        let fetcher = MapFetcher::new(pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect());
        let cancel = AtomicBool::new(false);
        let outcome = run_target(&fetcher, &target(1), dir.path(), &fast_config(), &cancel).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.records.len(), 2);
        let failed: Vec<_> = outcome.records.iter().filter(|r| r.error.is_some()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].link, "https://x.test/video/2");
    }

    #[tokio::test]
    async fn test_item_cap_stops_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let pages = two_page_site();
        let fetcher = MapFetcher::new(pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect());
        let cancel = AtomicBool::new(false);

        let mut capped = target(2);
        capped.item_cap = Some(4);
        let outcome = run_target(&fetcher, &capped, dir.path(), &fast_config(), &cancel).await;

        assert_eq!(outcome.records.len(), 4);
        // Page 2 is never requested once the cap is reached.
        assert!(!fetcher
            .fetched_urls()
            .contains(&"https://x.test/page/2/".to_string()));
    }

    #[tokio::test]
    async fn test_filter_limits_detail_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let mut pages = vec![(
            "https://x.test/".to_string(),
            r#"<html><body>
               <a class="video" href="/video/1" title="Red Pandas"></a>
               <a class="video" href="/video/2" title="Blue Sky"></a>
               </body></html>"#
                .to_string(),
        )];
        pages.push(("https://x.test/video/1".to_string(), detail_page(1)));
        pages.push(("https://x.test/video/2".to_string(), detail_page(2)));

        let fetcher = MapFetcher::new(pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect());
        let cancel = AtomicBool::new(false);
        let mut filtered = target(1);
        filtered.filter = Some("pandas".to_string());
        let outcome = run_target(&fetcher, &filtered, dir.path(), &fast_config(), &cancel).await;

        assert_eq!(outcome.counts.matched, 1);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].link, "https://x.test/video/1");
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_items_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let pages = two_page_site();
        let fetcher = MapFetcher::new(pages.iter().map(|(k, v)| (k.as_str(), v.clone())).collect());

        // Pre-set: cancel immediately; nothing should be crawled.
        let cancel = AtomicBool::new(true);
        let outcome = run_target(&fetcher, &target(2), dir.path(), &fast_config(), &cancel).await;
        assert!(outcome.error.is_none());
        assert!(outcome.records.is_empty());
        assert!(fetcher.fetched_urls().is_empty());
    }
}
