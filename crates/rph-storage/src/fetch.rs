//! Rate-limited fetching: global pacing, identity rotation, response
//! classification and retry with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{self, HeaderMap, HeaderValue};
use rph_core::{FetchOutcome, WorkItem};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    concat!(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
        "(KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    ),
    concat!(
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 ",
        "(KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    ),
    concat!(
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 ",
        "(KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    ),
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    concat!(
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 ",
        "(KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: u16) -> RetryDisposition {
    if (500..600).contains(&status) || status == 429 {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Uniform random duration in `0..=max`.
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
            factor: 2.0,
            max_delay: Duration::from_secs(600),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// `base * factor^attempt`, capped at `max_delay`. Non-decreasing in `attempt`
    /// for any `factor >= 1`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

/// Per-worker escalation state. Consecutive transient failures climb the
/// backoff curve; `reset_after_successes` consecutive successes drop it back
/// to the base delay.
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    policy: BackoffPolicy,
    reset_after_successes: u32,
    level: usize,
    consecutive_successes: u32,
}

impl BackoffTracker {
    pub fn new(policy: BackoffPolicy, reset_after_successes: u32) -> Self {
        Self {
            policy,
            reset_after_successes: reset_after_successes.max(1),
            level: 0,
            consecutive_successes: 0,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Delay to sleep after a transient failure, excluding jitter.
    pub fn on_transient(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.level);
        self.level = self.level.saturating_add(1);
        self.consecutive_successes = 0;
        delay
    }

    pub fn on_success(&mut self) {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        if self.consecutive_successes >= self.reset_after_successes {
            self.level = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub min_gap: Duration,
    pub jitter: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            min_gap: Duration::from_secs(1),
            jitter: Duration::from_secs(2),
        }
    }
}

/// Run-wide request pacing shared by all workers. The lock on the last
/// request instant is held while waiting, so requests leave one at a time.
#[derive(Debug)]
pub struct GlobalPacer {
    policy: PacingPolicy,
    last_request: Mutex<Option<Instant>>,
    paused_until: Mutex<Option<Instant>>,
}

impl GlobalPacer {
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            policy,
            last_request: Mutex::new(None),
            paused_until: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let paused_until = *self.paused_until.lock().await;
        if let Some(until) = paused_until {
            if until > Instant::now() {
                tokio::time::sleep_until(until).await;
            }
        }

        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.policy.min_gap + random_jitter(self.policy.jitter);
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Hold every worker's next request for at least `duration`.
    pub async fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut paused = self.paused_until.lock().await;
        *paused = Some(paused.map_or(until, |current| current.max(until)));
        info!(cooldown_secs = duration.as_secs(), "pausing all workers");
    }
}

#[derive(Debug, Clone)]
pub struct IdentityRotation {
    user_agents: Vec<String>,
}

impl Default for IdentityRotation {
    fn default() -> Self {
        Self::new(DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect())
    }
}

impl IdentityRotation {
    pub fn new(user_agents: Vec<String>) -> Self {
        Self { user_agents }
    }

    pub fn pick(&self) -> &str {
        self.user_agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(DEFAULT_USER_AGENTS[0])
    }
}

/// Patterns that identify an anti-automation challenge instead of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSignatures {
    pub url_patterns: Vec<String>,
    pub body_patterns: Vec<String>,
}

impl Default for BlockSignatures {
    fn default() -> Self {
        Self {
            url_patterns: vec![
                "verifycaptcha".into(),
                "/captcha".into(),
                "challenge-platform".into(),
            ],
            body_patterns: vec![
                "g-recaptcha".into(),
                "cf-chl-".into(),
                "verify you are a human".into(),
            ],
        }
    }
}

impl BlockSignatures {
    pub fn matches(&self, final_url: &str, body: &str) -> Option<String> {
        let url = final_url.to_ascii_lowercase();
        if let Some(pattern) = self
            .url_patterns
            .iter()
            .find(|p| url.contains(&p.to_ascii_lowercase()))
        {
            return Some(format!("challenge url matched `{pattern}`"));
        }
        let body = body.to_ascii_lowercase();
        self.body_patterns
            .iter()
            .find(|p| body.contains(&p.to_ascii_lowercase()))
            .map(|pattern| format!("challenge body matched `{pattern}`"))
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseClassifier {
    pub min_body_bytes: usize,
    pub signatures: BlockSignatures,
}

impl Default for ResponseClassifier {
    fn default() -> Self {
        Self {
            min_body_bytes: 100,
            signatures: BlockSignatures::default(),
        }
    }
}

impl ResponseClassifier {
    pub fn classify(&self, response: RawResponse) -> FetchOutcome {
        if let Some(reason) = self.signatures.matches(&response.final_url, &response.body) {
            return FetchOutcome::Blocked { reason };
        }

        if (200..300).contains(&response.status) {
            if response.body.trim().len() < self.min_body_bytes {
                return FetchOutcome::PermanentFailure {
                    reason: "empty or too short body".to_string(),
                };
            }
            return FetchOutcome::Success {
                document: response.body,
                final_url: response.final_url,
            };
        }

        let reason = format!("http status {}", response.status);
        match classify_status(response.status) {
            RetryDisposition::Retryable => FetchOutcome::TransientFailure { reason },
            RetryDisposition::NonRetryable => FetchOutcome::PermanentFailure { reason },
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("unusable response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            TransportError::Timeout(_)
            | TransportError::Connect(_)
            | TransportError::Request(_) => RetryDisposition::Retryable,
            TransportError::Decode(_) => RetryDisposition::NonRetryable,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_request() || err.is_body() {
            TransportError::Request(err.to_string())
        } else {
            TransportError::Decode(err.to_string())
        }
    }
}

/// The network seam. Owned by exactly one worker.
#[async_trait]
pub trait Transport: Send {
    async fn send(
        &mut self,
        item: &WorkItem,
        user_agent: &str,
    ) -> Result<RawResponse, TransportError>;
}

#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .default_headers(browser_headers())
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(concat!(
            "text/html,application/xhtml+xml,application/xml;q=0.9,",
            "application/json;q=0.8,*/*;q=0.7",
        )),
    );
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &mut self,
        item: &WorkItem,
        user_agent: &str,
    ) -> Result<RawResponse, TransportError> {
        let request = match &item.form {
            Some(form) => self.client.post(&item.url).form(form),
            None => self.client.get(&item.url),
        };
        let resp = request.header(header::USER_AGENT, user_agent).send().await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp.text().await?;
        Ok(RawResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Turns one work item into a classified outcome. Never returns an error:
/// every failure is a [`FetchOutcome`] value.
#[async_trait]
pub trait Fetcher: Send {
    async fn fetch(&mut self, item: &WorkItem) -> FetchOutcome;
}

pub struct RateLimitedFetcher<T> {
    transport: T,
    pacer: Arc<GlobalPacer>,
    identities: Arc<IdentityRotation>,
    classifier: ResponseClassifier,
    tracker: BackoffTracker,
}

impl<T: Transport> RateLimitedFetcher<T> {
    pub fn new(
        transport: T,
        pacer: Arc<GlobalPacer>,
        identities: Arc<IdentityRotation>,
        classifier: ResponseClassifier,
        tracker: BackoffTracker,
    ) -> Self {
        Self {
            transport,
            pacer,
            identities,
            classifier,
            tracker,
        }
    }

    pub fn tracker(&self) -> &BackoffTracker {
        &self.tracker
    }

    async fn attempt(&mut self, item: &WorkItem) -> FetchOutcome {
        self.pacer.wait_turn().await;
        let user_agent = self.identities.pick().to_string();
        match self.transport.send(item, &user_agent).await {
            Ok(response) => self.classifier.classify(response),
            Err(err) => match err.disposition() {
                RetryDisposition::Retryable => FetchOutcome::TransientFailure {
                    reason: err.to_string(),
                },
                RetryDisposition::NonRetryable => FetchOutcome::PermanentFailure {
                    reason: err.to_string(),
                },
            },
        }
    }
}

#[async_trait]
impl<T: Transport> Fetcher for RateLimitedFetcher<T> {
    async fn fetch(&mut self, item: &WorkItem) -> FetchOutcome {
        let span = info_span!("http_fetch", source = %item.source, url = %item.url);
        async {
            let max_retries = self.tracker.policy().max_retries;
            let jitter = self.tracker.policy().jitter;
            let mut attempt = 0usize;
            loop {
                match self.attempt(item).await {
                    FetchOutcome::TransientFailure { reason } => {
                        if attempt >= max_retries {
                            warn!(%reason, retries = max_retries, "giving up after retry ceiling");
                            return FetchOutcome::PermanentFailure {
                                reason: format!("{reason} (gave up after {max_retries} retries)"),
                            };
                        }
                        let delay = self.tracker.on_transient() + random_jitter(jitter);
                        debug!(
                            %reason,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    FetchOutcome::Blocked { reason } => {
                        warn!(%reason, "blocked by site defenses");
                        return FetchOutcome::Blocked { reason };
                    }
                    outcome @ FetchOutcome::Success { .. } => {
                        self.tracker.on_success();
                        return outcome;
                    }
                    outcome @ FetchOutcome::PermanentFailure { .. } => {
                        debug!(outcome = outcome.label(), "permanent failure");
                        return outcome;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const PAGE: &str = concat!(
        "<html><body><h1>Royal Meadows</h1>",
        "<p>Plenty of body text so the short-body check passes comfortably for tests.</p>",
        "</body></html>",
    );

    struct ScriptedTransport {
        responses: VecDeque<Result<RawResponse, TransportError>>,
        calls: usize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<RawResponse, TransportError>>) -> Self {
            Self {
                responses: responses.into(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &mut self,
            item: &WorkItem,
            _user_agent: &str,
        ) -> Result<RawResponse, TransportError> {
            self.calls += 1;
            self.responses.pop_front().unwrap_or_else(|| {
                Ok(RawResponse {
                    status: 200,
                    final_url: item.url.clone(),
                    body: PAGE.to_string(),
                })
            })
        }
    }

    fn status(code: u16) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status: code,
            final_url: "https://a.example/p/royal-meadows".to_string(),
            body: "busy".to_string(),
        })
    }

    fn no_jitter_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
            factor: 2.0,
            max_delay: Duration::from_secs(600),
            jitter: Duration::ZERO,
        }
    }

    fn fetcher(transport: ScriptedTransport) -> RateLimitedFetcher<ScriptedTransport> {
        RateLimitedFetcher::new(
            transport,
            Arc::new(GlobalPacer::new(PacingPolicy {
                min_gap: Duration::ZERO,
                jitter: Duration::ZERO,
            })),
            Arc::new(IdentityRotation::default()),
            ResponseClassifier::default(),
            BackoffTracker::new(no_jitter_policy(), 1),
        )
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_millis(350),
            jitter: Duration::ZERO,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(350));
    }

    #[test]
    fn tracker_delays_never_decrease_and_reset_after_successes() {
        let mut tracker = BackoffTracker::new(no_jitter_policy(), 2);
        let delays: Vec<_> = (0..8).map(|_| tracker.on_transient()).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(600)));

        tracker.on_success();
        assert_eq!(tracker.level(), 8);
        tracker.on_success();
        assert_eq!(tracker.level(), 0);
        assert_eq!(tracker.on_transient(), Duration::from_secs(30));
    }

    #[test]
    fn classification_covers_each_outcome() {
        let classifier = ResponseClassifier::default();
        let ok = classifier.classify(RawResponse {
            status: 200,
            final_url: "https://a.example/x".into(),
            body: PAGE.into(),
        });
        assert_eq!(ok.label(), "success");

        let short = classifier.classify(RawResponse {
            status: 200,
            final_url: "https://a.example/x".into(),
            body: "<html></html>".into(),
        });
        assert_eq!(
            short,
            FetchOutcome::PermanentFailure {
                reason: "empty or too short body".into()
            }
        );

        assert_eq!(classifier.classify(status(404).unwrap()).label(), "permanent");
        assert_eq!(classifier.classify(status(429).unwrap()).label(), "transient");
        assert_eq!(classifier.classify(status(503).unwrap()).label(), "transient");

        let captcha = classifier.classify(RawResponse {
            status: 200,
            final_url: "https://www.site-a.example/load/verifycaptcha?redirect=1".into(),
            body: PAGE.into(),
        });
        assert!(captcha.is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn three_transient_failures_back_off_30_60_120_then_give_up() {
        let transport =
            ScriptedTransport::new(vec![status(429), status(429), status(429), status(429)]);
        let mut fetcher = fetcher(transport);
        let item = WorkItem::single("https://a.example/p/royal-meadows", "site-a");

        let started = Instant::now();
        let outcome = fetcher.fetch(&item).await;

        assert_eq!(started.elapsed(), Duration::from_secs(30 + 60 + 120));
        assert_eq!(fetcher.transport.calls, 4);
        match outcome {
            FetchOutcome::PermanentFailure { reason } => {
                assert!(reason.contains("http status 429"))
            }
            other => panic!("expected permanent failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_is_not_retried() {
        let blocked = Ok(RawResponse {
            status: 200,
            final_url: "https://www.site-a.example/load/verifycaptcha".into(),
            body: PAGE.into(),
        });
        let mut fetcher = fetcher(ScriptedTransport::new(vec![blocked]));
        let outcome = fetcher.fetch(&WorkItem::single("https://a.example/p/1", "site-a")).await;

        assert!(outcome.is_blocked());
        assert_eq!(fetcher.transport.calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_timeouts_are_retried_until_success() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout("deadline".into())),
            Err(TransportError::Connect("reset".into())),
        ]);
        let mut fetcher = fetcher(transport);
        let outcome = fetcher.fetch(&WorkItem::single("https://a.example/p/1", "site-a")).await;

        assert_eq!(outcome.label(), "success");
        assert_eq!(fetcher.transport.calls, 3);
        assert_eq!(fetcher.tracker().level(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_requests_and_honours_cooldown() {
        let pacer = GlobalPacer::new(PacingPolicy {
            min_gap: Duration::from_secs(1),
            jitter: Duration::ZERO,
        });
        let started = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        pacer.pause_for(Duration::from_secs(120)).await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_secs(122));
    }
}
