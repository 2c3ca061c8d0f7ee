use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::{FetchConfig, PipelineConfig};

/// A persisted, possibly recurring crawl definition.
///
/// `next_due_at` is advanced only by the scheduler loop; everything else is
/// mutated only through the explicit update operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub targets: Vec<Target>,
    /// Recurrence interval in seconds. `None` means one-shot.
    pub interval_seconds: Option<i64>,
    /// Explicit first/only firing time for one-shot jobs.
    pub run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    /// `None` once a one-shot job has fired (dormant).
    pub next_due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One site/query unit of work within a run. Immutable once snapshotted
/// into a run's request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub base_url: String,
    pub page_limit: u32,
    #[serde(default)]
    pub page_order: PageOrder,
    /// Stop after this many newly extracted items. `None` uses the
    /// configured default cap.
    pub item_cap: Option<u32>,
    /// Free-text filter matched case-insensitively against item titles.
    pub filter: Option<String>,
    #[serde(default)]
    pub mode: TargetMode,
    /// Opt-in to the browser-rendered fetch fallback.
    #[serde(default)]
    pub render_fallback: bool,
    pub recipe: Recipe,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// Records are built from listing candidates only.
    ListingOnly,
    /// Each listing candidate's detail page is fetched and extracted.
    #[default]
    ListingAndDetail,
}

/// Site-specific selector/pagination configuration. Validated data, never
/// interpreted as code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub pagination: PaginationSpec,
    pub listing: ListingSelectors,
    #[serde(default)]
    pub detail: DetailSelectors,
    /// Regex patterns stripped from extracted titles (site-name suffixes
    /// and similar noise).
    #[serde(default)]
    pub title_strip_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PaginationSpec {
    /// Page N's URL is the base URL joined with `path_template`, with
    /// `{page}` substituted. Page 1 is the base URL itself.
    Template { path_template: String },
    /// Each listing page carries a "next" affordance; its block id and
    /// parameter string are merged into the root URL's query string.
    NextLink {
        selector: String,
        block_attr: String,
        params_attr: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSelectors {
    /// Selector matching one candidate item (typically an anchor).
    pub item_selector: String,
    /// Optional selector for the title element inside an item.
    pub title_selector: Option<String>,
    /// Optional attribute on the item element carrying the title.
    pub title_attr: Option<String>,
    /// Attribute carrying the canonical link, usually `href`.
    #[serde(default = "default_link_attr")]
    pub link_attr: String,
    /// Attribute carrying the thumbnail URL. When absent the inline
    /// `background-image` style is scanned instead.
    pub image_attr: Option<String>,
}

fn default_link_attr() -> String {
    "href".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailSelectors {
    /// Media candidates in preference order (earlier selectors score
    /// higher).
    #[serde(default)]
    pub media_selectors: Vec<String>,
    /// Attributes probed on each media candidate, e.g. `src`, `data-src`.
    #[serde(default)]
    pub media_attrs: Vec<String>,
    /// Selector for tag links on the detail page.
    pub tag_selector: Option<String>,
    /// Element whose presence signals a fully rendered page; also the wait
    /// marker for the rendering fetch fallback.
    pub marker_selector: Option<String>,
}

impl Recipe {
    /// Validate all selectors and the pagination template. Recipes arrive
    /// from the API layer as opaque configuration and are checked here
    /// before a job or run will accept them.
    pub fn validate(&self) -> Result<(), String> {
        match &self.pagination {
            PaginationSpec::Template { path_template } => {
                if !path_template.contains("{page}") {
                    return Err(format!(
                        "pagination template '{path_template}' is missing the {{page}} placeholder"
                    ));
                }
            }
            PaginationSpec::NextLink {
                selector,
                block_attr,
                params_attr,
            } => {
                validate_selector("pagination.selector", selector)?;
                if block_attr.is_empty() || params_attr.is_empty() {
                    return Err("pagination next-link attributes must not be empty".to_string());
                }
            }
        }

        validate_selector("listing.item_selector", &self.listing.item_selector)?;
        if let Some(sel) = &self.listing.title_selector {
            validate_selector("listing.title_selector", sel)?;
        }
        for sel in &self.detail.media_selectors {
            validate_selector("detail.media_selectors", sel)?;
        }
        if let Some(sel) = &self.detail.tag_selector {
            validate_selector("detail.tag_selector", sel)?;
        }
        if let Some(sel) = &self.detail.marker_selector {
            validate_selector("detail.marker_selector", sel)?;
        }
        for pattern in &self.title_strip_patterns {
            regex::Regex::new(pattern)
                .map_err(|e| format!("invalid title strip pattern '{pattern}': {e}"))?;
        }
        Ok(())
    }
}

fn validate_selector(field: &str, selector: &str) -> Result<(), String> {
    scraper::Selector::parse(selector)
        .map(|_| ())
        .map_err(|e| format!("invalid CSS selector in {field} ('{selector}'): {e:?}"))
}

/// One execution instance of a job's (or ad-hoc) targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    /// `None` for ad-hoc runs triggered directly through the API.
    pub job_id: Option<Uuid>,
    pub status: RunStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Immutable copy of the targets at creation time.
    pub request: Vec<Target>,
    pub result: Option<RunResult>,
    pub error: Option<String>,
    pub worker_pid: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    /// Stop accepted but the worker has not yet been confirmed dead.
    Canceling,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Canceling => "canceling",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "canceling" => Some(RunStatus::Canceling),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "canceled" => Some(RunStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal statuses are never revisited.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// A run with a (possibly) live worker process.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Canceling)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    pub outcomes: Vec<TargetOutcome>,
}

impl RunResult {
    /// Whether any target reported a fatal error.
    pub fn has_error(&self) -> bool {
        self.outcomes.iter().any(|o| o.error.is_some())
    }
}

/// Per-target outcome embedded in a run's result snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub base_url: String,
    pub exit_code: i32,
    pub error: Option<String>,
    pub counts: RecordCounts,
    /// Records discovered or refreshed during this run.
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    /// Corpus size after merge.
    pub total: usize,
    /// Listing candidates matching the free-text filter this run.
    pub matched: usize,
    pub with_image: usize,
    pub with_video: usize,
    /// Error-free records carrying a media URL.
    pub publishable: usize,
}

/// One extracted item. Identity key is the canonical `link`; the corpus
/// never holds two records with the same link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub title: String,
    #[serde(default)]
    pub title_raw: String,
    pub link: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    #[serde(default)]
    pub meta_description: Option<String>,
    #[serde(default)]
    pub og_title: Option<String>,
    #[serde(default)]
    pub og_description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Manual flag carried forward across merges.
    #[serde(default)]
    pub published: bool,
    /// Discovered during the current run (as opposed to carried over).
    #[serde(default)]
    pub fresh: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

/// Parameters handed to a worker process through its request file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: Uuid,
    pub targets: Vec<Target>,
    pub checkpoint_dir: PathBuf,
    pub result_path: PathBuf,
    pub fetch: FetchConfig,
    pub pipeline: PipelineConfig,
}

/// Typed event contract on the worker's stdout; one JSON object per line.
/// The supervisor decodes these for log capture and best-effort progress,
/// never for control decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerEvent {
    Log {
        level: WorkerLogLevel,
        message: String,
    },
    /// Key-level patch for the progress document. A JSON null value
    /// deletes the key.
    Progress {
        patch: serde_json::Map<String, serde_json::Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

// API request/response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreateRequest {
    pub name: String,
    pub targets: Vec<Target>,
    pub interval_seconds: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUpdateRequest {
    pub name: String,
    pub targets: Vec<Target>,
    pub interval_seconds: Option<i64>,
    pub run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTriggerRequest {
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTailQuery {
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTailResponse {
    pub run_id: Uuid,
    pub lines: Vec<String>,
}
