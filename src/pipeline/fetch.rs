//! Fetch strategies: a lightweight HTTP client first, a browser-rendered
//! fallback when a target opts in and the plain client fails or gets
//! blocked. The pipeline only ever sees the `FetchStrategy` trait.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::errors::FetchError;

/// Anti-bot challenge signatures. A body matching any of these is treated
/// as blocked regardless of HTTP status.
const BLOCK_MARKERS: &[&str] = &[
    "just a moment",
    "checking your browser",
    "cf-browser-verification",
    "cf-chl-widget",
    "attention required! | cloudflare",
    "ddos-guard",
    "verify you are human",
    "g-recaptcha",
    "h-captcha",
    "enable javascript and cookies to continue",
];

/// Classify a response body as an anti-bot challenge page.
pub fn looks_blocked(body: &str) -> bool {
    let lowered = body.to_lowercase();
    BLOCK_MARKERS.iter().any(|marker| lowered.contains(marker))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Body(String),
    /// Every attempt produced an anti-bot challenge page.
    Blocked,
    /// Every attempt failed outright.
    NoBody,
}

impl FetchResult {
    pub fn body(self) -> Option<String> {
        match self {
            FetchResult::Body(body) => Some(body),
            _ => None,
        }
    }
}

#[async_trait]
pub trait FetchStrategy: Send + Sync {
    async fn fetch(&self, url: &str, referer: Option<&str>) -> Result<FetchResult, FetchError>;
}

/// Plain HTTP client with bounded retries and growing backoff.
pub struct HttpFetcher {
    client: reqwest::Client,
    attempts: u32,
    backoff_base: Duration,
    backoff_step: Duration,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en-US,en;q=0.5"),
        );

        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| FetchError::request_failed("<client>", e.to_string()))?;

        Ok(Self {
            client,
            attempts: config.retry_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_step: Duration::from_millis(config.backoff_step_ms),
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let jitter = Duration::from_millis(fastrand::u64(0..250));
        self.backoff_base + self.backoff_step * attempt + jitter
    }
}

#[async_trait]
impl FetchStrategy for HttpFetcher {
    async fn fetch(&self, url: &str, referer: Option<&str>) -> Result<FetchResult, FetchError> {
        let mut saw_block = false;

        for attempt in 1..=self.attempts {
            let mut request = self.client.get(url);
            if let Some(referer) = referer {
                request = request.header(reqwest::header::REFERER, referer);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match response.text().await {
                        // The block classification is independent of
                        // status: challenge pages frequently come back 200.
                        Ok(body) if looks_blocked(&body) => {
                            debug!("Blocked response for {} (status {})", url, status);
                            saw_block = true;
                        }
                        Ok(body) if status.is_success() => {
                            return Ok(FetchResult::Body(body));
                        }
                        Ok(_) => {
                            debug!("HTTP {} for {} (attempt {})", status, url, attempt);
                        }
                        Err(e) => {
                            debug!("Body read failed for {}: {} (attempt {})", url, e, attempt);
                        }
                    }
                }
                Err(e) => {
                    debug!("Request failed for {}: {} (attempt {})", url, e, attempt);
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Ok(if saw_block {
            FetchResult::Blocked
        } else {
            FetchResult::NoBody
        })
    }
}

/// Browser-rendered fetch: executes page scripts and waits for a marker
/// element before reading the rendered body.
pub struct RenderFetcher {
    user_agent: String,
    marker_selector: Option<String>,
    marker_wait: Duration,
    nav_timeout: Duration,
}

impl RenderFetcher {
    pub fn new(config: &FetchConfig, marker_selector: Option<String>) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            marker_selector,
            marker_wait: Duration::from_secs(config.render_wait_seconds),
            nav_timeout: Duration::from_secs(config.render_nav_timeout_seconds),
        }
    }

    async fn render(&self, url: &str) -> Result<String, FetchError> {
        let browser_config = BrowserConfig::builder()
            .no_sandbox()
            .args(vec![
                "--disable-blink-features=AutomationControlled".to_string(),
                format!("--user-agent={}", self.user_agent),
            ])
            .build()
            .map_err(|e| FetchError::render_failed(url, e))?;

        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| FetchError::render_failed(url, e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let result = self.drive_page(&browser, url).await;

        if let Err(e) = browser.close().await {
            debug!("Browser close failed after rendering {}: {}", url, e);
        }
        handler_task.abort();

        result
    }

    async fn drive_page(&self, browser: &Browser, url: &str) -> Result<String, FetchError> {
        let page = tokio::time::timeout(self.nav_timeout, browser.new_page(url))
            .await
            .map_err(|_| FetchError::render_failed(url, "navigation timed out"))?
            .map_err(|e| FetchError::render_failed(url, e.to_string()))?;

        if let Err(e) =
            tokio::time::timeout(self.nav_timeout, page.wait_for_navigation()).await
        {
            debug!("Navigation wait elapsed for {}: {}", url, e);
        }

        // Poll for the marker element; its absence is not fatal, the page
        // may simply never render it.
        if let Some(selector) = &self.marker_selector {
            let deadline = tokio::time::Instant::now() + self.marker_wait;
            loop {
                if page.find_element(selector.as_str()).await.is_ok() {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!("Marker '{}' never appeared on {}", selector, url);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        page.content()
            .await
            .map_err(|e| FetchError::render_failed(url, e.to_string()))
    }
}

#[async_trait]
impl FetchStrategy for RenderFetcher {
    async fn fetch(&self, url: &str, _referer: Option<&str>) -> Result<FetchResult, FetchError> {
        match self.render(url).await {
            Ok(body) if looks_blocked(&body) => Ok(FetchResult::Blocked),
            Ok(body) => Ok(FetchResult::Body(body)),
            Err(e) => {
                warn!("{}", e);
                Ok(FetchResult::NoBody)
            }
        }
    }
}

/// Composite strategy: plain client first, rendering fallback on failure
/// or block. Returns the first non-blocked body from either path.
pub struct EscalatingFetcher {
    primary: Box<dyn FetchStrategy>,
    fallback: Option<Box<dyn FetchStrategy>>,
}

impl EscalatingFetcher {
    pub fn new(primary: Box<dyn FetchStrategy>, fallback: Option<Box<dyn FetchStrategy>>) -> Self {
        Self { primary, fallback }
    }

    /// Build the per-target strategy stack from configuration.
    pub fn for_target(
        config: &FetchConfig,
        render_fallback: bool,
        marker_selector: Option<String>,
    ) -> Result<Self, FetchError> {
        let primary = Box::new(HttpFetcher::new(config)?);
        let fallback: Option<Box<dyn FetchStrategy>> = if render_fallback {
            Some(Box::new(RenderFetcher::new(config, marker_selector)))
        } else {
            None
        };
        Ok(Self::new(primary, fallback))
    }
}

#[async_trait]
impl FetchStrategy for EscalatingFetcher {
    async fn fetch(&self, url: &str, referer: Option<&str>) -> Result<FetchResult, FetchError> {
        let first = self.primary.fetch(url, referer).await?;
        if matches!(first, FetchResult::Body(_)) {
            return Ok(first);
        }

        match &self.fallback {
            Some(fallback) => {
                debug!("Escalating {} to rendering fetch", url);
                let second = fallback.fetch(url, referer).await?;
                if matches!(second, FetchResult::Body(_)) {
                    Ok(second)
                } else if first == FetchResult::Blocked || second == FetchResult::Blocked {
                    Ok(FetchResult::Blocked)
                } else {
                    Ok(FetchResult::NoBody)
                }
            }
            None => Ok(first),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubFetcher {
        result: FetchResult,
        calls: Arc<AtomicUsize>,
    }

    impl StubFetcher {
        fn new(result: FetchResult) -> (Box<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Self {
                    result,
                    calls: calls.clone(),
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl FetchStrategy for StubFetcher {
        async fn fetch(&self, _url: &str, _referer: Option<&str>) -> Result<FetchResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    #[test]
    fn test_blocked_classification() {
        assert!(looks_blocked(
            "<html><title>Just a moment...</title><body>Checking your browser</body></html>"
        ));
        assert!(looks_blocked("<div class=\"g-recaptcha\"></div>"));
        assert!(!looks_blocked(
            "<html><body><div class=\"videos\"><a class=\"video\" href=\"/v/1\"></a></div></body></html>"
        ));
    }

    #[tokio::test]
    async fn test_escalation_discards_blocked_body_for_fallback() {
        let (primary, primary_calls) = StubFetcher::new(FetchResult::Blocked);
        let (fallback, fallback_calls) =
            StubFetcher::new(FetchResult::Body("<html>rendered</html>".to_string()));
        let fetcher = EscalatingFetcher::new(primary, Some(fallback));

        let result = fetcher.fetch("https://x.test", None).await.unwrap();
        assert_eq!(
            result,
            FetchResult::Body("<html>rendered</html>".to_string())
        );
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_escalation_when_primary_succeeds() {
        let (primary, _) = StubFetcher::new(FetchResult::Body("<html>plain</html>".to_string()));
        let (fallback, fallback_calls) =
            StubFetcher::new(FetchResult::Body("<html>rendered</html>".to_string()));
        let fetcher = EscalatingFetcher::new(primary, Some(fallback));

        let result = fetcher.fetch("https://x.test", None).await.unwrap();
        assert_eq!(result, FetchResult::Body("<html>plain</html>".to_string()));
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blocked_without_fallback_stays_blocked() {
        let (primary, _) = StubFetcher::new(FetchResult::Blocked);
        let fetcher = EscalatingFetcher::new(primary, None);
        assert_eq!(
            fetcher.fetch("https://x.test", None).await.unwrap(),
            FetchResult::Blocked
        );
    }

    #[tokio::test]
    async fn test_both_paths_exhausted_yields_no_body() {
        let (primary, _) = StubFetcher::new(FetchResult::NoBody);
        let (fallback, _) = StubFetcher::new(FetchResult::NoBody);
        let fetcher = EscalatingFetcher::new(primary, Some(fallback));
        assert_eq!(
            fetcher.fetch("https://x.test", None).await.unwrap(),
            FetchResult::NoBody
        );
    }
}
