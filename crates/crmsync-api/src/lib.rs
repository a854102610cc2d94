//! CRM REST client: retry/backoff policy, rate-limit handling, cursor
//! pagination, and the `DealApi` seam the pipeline is written against.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use crmsync_core::RawDeal;
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "crmsync-api";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("rate limited by source")]
    RateLimited { retry_after: Option<Duration> },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("retries exhausted after {attempts} failed attempts")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<ApiError>,
    },
}

impl ApiError {
    /// Transient failures are retried with backoff; everything else aborts
    /// immediately. Only timeouts, connection failures, and 5xx qualify:
    /// request-construction errors are deterministic and retrying them just
    /// burns the budget. Rate limiting is classified separately.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(err) => err.is_timeout() || err.is_connect(),
            ApiError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Transient failures tolerated per operation before giving up.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Sleep applied on a 429 without a `Retry-After` hint.
    pub rate_limit_delay: Duration,
    /// Absolute bound on attempts of any kind, so rate-limit retries cannot
    /// livelock even though they do not consume `max_retries`.
    pub attempt_ceiling: usize,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            rate_limit_delay: Duration::from_secs(2),
            attempt_ceiling: 12,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// The one retry loop shared by page fetches and reference-data fetches.
///
/// Transient errors are retried with exponential backoff up to
/// `max_retries`; a rate-limit signal sleeps for the mandated delay without
/// consuming the transient budget; any other error aborts at once. The
/// `attempt_ceiling` bounds the loop regardless of error mix. Every sleep is
/// an await point, so a caller-side deadline interrupts the backoff.
pub async fn with_retry<T, Op, Fut>(policy: &BackoffPolicy, mut op: Op) -> Result<T, ApiError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut transient_failures = 0usize;
    let mut last: Option<ApiError> = None;

    for _ in 0..policy.attempt_ceiling.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ApiError::RateLimited { retry_after }) => {
                let delay = retry_after.unwrap_or(policy.rate_limit_delay);
                debug!(delay_ms = delay.as_millis() as u64, "rate limited; pausing");
                tokio::time::sleep(delay).await;
                last = Some(ApiError::RateLimited { retry_after });
            }
            Err(err) if err.is_transient() => {
                transient_failures += 1;
                if transient_failures >= policy.max_retries {
                    return Err(ApiError::RetriesExhausted {
                        attempts: transient_failures,
                        last: Box::new(err),
                    });
                }
                let delay = policy.delay_for_attempt(transient_failures - 1);
                debug!(
                    attempt = transient_failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure; backing off"
                );
                tokio::time::sleep(delay).await;
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(ApiError::RetriesExhausted {
        attempts: policy.attempt_ceiling,
        last: Box::new(last.unwrap_or(ApiError::RateLimited { retry_after: None })),
    })
}

/// Page filter for the deal list endpoint.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Lower bound on the record creation date, ISO-8601.
    pub created_since: Option<String>,
}

impl ListFilter {
    fn to_wire(&self) -> JsonValue {
        let mut filter = serde_json::Map::new();
        if let Some(since) = &self.created_since {
            filter.insert(">=DATE_CREATE".to_string(), json!(since));
        }
        JsonValue::Object(filter)
    }
}

/// One page of raw deals plus the opaque cursor for the next page, absent on
/// the last page.
#[derive(Debug, Clone, Default)]
pub struct DealPage {
    pub deals: Vec<RawDeal>,
    pub next: Option<u64>,
}

/// The outbound seam to the CRM. The pipeline, cache, and tests all talk to
/// this trait; `CrmClient` is the reqwest implementation.
#[async_trait]
pub trait DealApi: Send + Sync {
    async fn list_deals(
        &self,
        filter: &ListFilter,
        select: &[String],
        start: u64,
    ) -> Result<DealPage, ApiError>;

    async fn get_deal(&self, id: &str) -> Result<Option<RawDeal>, ApiError>;

    async fn fetch_categories(&self) -> Result<HashMap<String, String>, ApiError>;

    async fn fetch_stages(&self, category_code: &str) -> Result<HashMap<String, String>, ApiError>;

    async fn fetch_field_options(
        &self,
        field_code: &str,
    ) -> Result<HashMap<String, String>, ApiError>;
}

/// Drains the deal list endpoint page by page, following the server-supplied
/// cursor. Restartable only from page 0: retry of a failed page happens
/// inside the API call, so the cursor is never advanced past an unfetched
/// page.
pub struct DealPager<'a> {
    api: &'a dyn DealApi,
    filter: ListFilter,
    select: Vec<String>,
    cursor: u64,
    done: bool,
}

impl<'a> DealPager<'a> {
    pub fn new(api: &'a dyn DealApi, filter: ListFilter, select: Vec<String>) -> Self {
        Self {
            api,
            filter,
            select,
            cursor: 0,
            done: false,
        }
    }

    /// Whether the last page has been seen. Lets callers pace between page
    /// fetches without a pointless delay after the final one.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The next page of raw deals, or `None` once the server omits the
    /// cursor or returns an empty result set.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawDeal>>, ApiError> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .api
            .list_deals(&self.filter, &self.select, self.cursor)
            .await?;
        if page.deals.is_empty() {
            self.done = true;
            return Ok(None);
        }
        match page.next {
            Some(next) => self.cursor = next,
            None => self.done = true,
        }
        Ok(Some(page.deals))
    }
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(30),
            user_agent: "crmsync/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Wire envelopes. List responses carry `result` plus an optional numeric
/// `next` offset; point lookups carry a single `result` object.
#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    result: Vec<RawDeal>,
    #[serde(default)]
    next: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GetEnvelope {
    #[serde(default)]
    result: Option<RawDeal>,
}

#[derive(Debug, Deserialize)]
struct RowsEnvelope {
    #[serde(default)]
    result: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct FieldsEnvelope {
    #[serde(default)]
    result: HashMap<String, JsonValue>,
}

pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl CrmClient {
    pub fn new(config: &CrmConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &JsonValue,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(method);
        let response = self.http.post(&url).json(body).send().await?;
        Self::decode(response, &url).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let url = self.endpoint(method);
        let response = self.http.get(&url).query(query).send().await?;
        Self::decode(response, &url).await
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
        url: &str,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ApiError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| ApiError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

fn json_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn rows_to_map(rows: &[JsonValue], key: &str, label: &str) -> HashMap<String, String> {
    rows.iter()
        .filter_map(|row| {
            let code = row.get(key).and_then(json_to_string)?;
            let name = row.get(label).and_then(json_to_string)?;
            Some((code, name))
        })
        .collect()
}

#[async_trait]
impl DealApi for CrmClient {
    async fn list_deals(
        &self,
        filter: &ListFilter,
        select: &[String],
        start: u64,
    ) -> Result<DealPage, ApiError> {
        let body = json!({
            "start": start,
            "order": {"ID": "ASC"},
            "filter": filter.to_wire(),
            "select": select,
        });
        with_retry(&self.backoff, || async {
            let envelope: ListEnvelope = self.post_json("crm.deal.list", &body).await?;
            Ok(DealPage {
                deals: envelope.result,
                next: envelope.next,
            })
        })
        .instrument(info_span!("list_deals", start))
        .await
    }

    async fn get_deal(&self, id: &str) -> Result<Option<RawDeal>, ApiError> {
        with_retry(&self.backoff, || async {
            let envelope: GetEnvelope = self.get_json("crm.deal.get", &[("id", id)]).await?;
            Ok(envelope.result)
        })
        .instrument(info_span!("get_deal", id))
        .await
    }

    async fn fetch_categories(&self) -> Result<HashMap<String, String>, ApiError> {
        let body = json!({});
        with_retry(&self.backoff, || async {
            let envelope: RowsEnvelope = self.post_json("crm.dealcategory.list", &body).await?;
            Ok(rows_to_map(&envelope.result, "ID", "NAME"))
        })
        .instrument(info_span!("fetch_categories"))
        .await
    }

    async fn fetch_stages(&self, category_code: &str) -> Result<HashMap<String, String>, ApiError> {
        let body = json!({"id": category_code});
        with_retry(&self.backoff, || async {
            let envelope: RowsEnvelope =
                self.post_json("crm.dealcategory.stage.list", &body).await?;
            Ok(rows_to_map(&envelope.result, "STATUS_ID", "NAME"))
        })
        .instrument(info_span!("fetch_stages", category_code))
        .await
    }

    async fn fetch_field_options(
        &self,
        field_code: &str,
    ) -> Result<HashMap<String, String>, ApiError> {
        with_retry(&self.backoff, || async {
            let envelope: FieldsEnvelope = self.get_json("crm.deal.fields", &[]).await?;
            let items = envelope
                .result
                .get(field_code)
                .and_then(|field| field.get("items"))
                .and_then(|items| items.as_array())
                .cloned()
                .unwrap_or_default();
            Ok(rows_to_map(&items, "ID", "VALUE"))
        })
        .instrument(info_span!("fetch_field_options", field_code))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            rate_limit_delay: Duration::from_millis(1),
            attempt_ceiling: 10,
        }
    }

    fn transient() -> ApiError {
        ApiError::Status {
            status: 503,
            url: "http://crm.test/crm.deal.list".to_string(),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            rate_limit_delay: Duration::from_secs(1),
            attempt_ceiling: 10,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retry_succeeds_below_the_retry_bound() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&fast_policy(3), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(transient())
                } else {
                    Ok("page")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "page");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_at_exactly_max_retries() {
        let calls = AtomicUsize::new(0);
        let result: Result<&str, _> = with_retry(&fast_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        match result {
            Err(ApiError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_abort_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<&str, _> = with_retry(&fast_policy(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ApiError::Status {
                    status: 401,
                    url: "http://crm.test".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(ApiError::Status { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limits_do_not_consume_the_transient_budget() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&fast_policy(2), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match attempt {
                    // More 429s than max_retries, then one transient, then ok.
                    0..=3 => Err(ApiError::RateLimited { retry_after: None }),
                    4 => Err(transient()),
                    _ => Ok("page"),
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "page");
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn request_construction_errors_are_not_transient() {
        let err = reqwest::Client::new()
            .get("not a url")
            .build()
            .expect_err("invalid url");
        assert!(!ApiError::Transport(err).is_transient());
    }

    #[tokio::test]
    async fn too_many_requests_carries_the_retry_after_hint() {
        let response = http::Response::builder()
            .status(429)
            .header("Retry-After", "7")
            .body("slow down")
            .unwrap();
        let err =
            CrmClient::decode::<ListEnvelope>(reqwest::Response::from(response), "http://crm.test")
                .await
                .expect_err("rate limited");
        match err {
            ApiError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        // Absent or unparsable hints fall back to the policy default.
        let response = http::Response::builder()
            .status(429)
            .header("Retry-After", "soon")
            .body("slow down")
            .unwrap();
        let err =
            CrmClient::decode::<ListEnvelope>(reqwest::Response::from(response), "http://crm.test")
                .await
                .expect_err("rate limited");
        assert!(matches!(err, ApiError::RateLimited { retry_after: None }));
    }

    #[tokio::test]
    async fn rate_limit_hint_overrides_the_default_delay() {
        let policy = BackoffPolicy {
            rate_limit_delay: Duration::from_millis(1),
            ..fast_policy(2)
        };
        let calls = AtomicUsize::new(0);
        let started = std::time::Instant::now();
        let result = with_retry(&policy, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(ApiError::RateLimited {
                        retry_after: Some(Duration::from_millis(50)),
                    })
                } else {
                    Ok("page")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "page");
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn rate_limits_are_bounded_by_the_attempt_ceiling() {
        let policy = BackoffPolicy {
            attempt_ceiling: 4,
            ..fast_policy(2)
        };
        let calls = AtomicUsize::new(0);
        let result: Result<&str, _> = with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::RateLimited { retry_after: None }) }
        })
        .await;
        assert!(matches!(result, Err(ApiError::RetriesExhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    struct ScriptedApi {
        pages: Mutex<Vec<Result<DealPage, ApiError>>>,
        requested_starts: Mutex<Vec<u64>>,
    }

    impl ScriptedApi {
        fn new(pages: Vec<Result<DealPage, ApiError>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                requested_starts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DealApi for ScriptedApi {
        async fn list_deals(
            &self,
            _filter: &ListFilter,
            _select: &[String],
            start: u64,
        ) -> Result<DealPage, ApiError> {
            self.requested_starts.lock().unwrap().push(start);
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok(DealPage::default());
            }
            pages.remove(0)
        }

        async fn get_deal(&self, _id: &str) -> Result<Option<RawDeal>, ApiError> {
            Ok(None)
        }

        async fn fetch_categories(&self) -> Result<HashMap<String, String>, ApiError> {
            Ok(HashMap::new())
        }

        async fn fetch_stages(
            &self,
            _category_code: &str,
        ) -> Result<HashMap<String, String>, ApiError> {
            Ok(HashMap::new())
        }

        async fn fetch_field_options(
            &self,
            _field_code: &str,
        ) -> Result<HashMap<String, String>, ApiError> {
            Ok(HashMap::new())
        }
    }

    fn deal(id: &str) -> RawDeal {
        serde_json::from_value(json!({"ID": id})).expect("raw deal")
    }

    #[tokio::test]
    async fn pager_concatenates_pages_in_cursor_order() {
        let api = ScriptedApi::new(vec![
            Ok(DealPage {
                deals: vec![deal("1"), deal("2")],
                next: Some(2),
            }),
            Ok(DealPage {
                deals: vec![deal("3")],
                next: None,
            }),
        ]);
        let mut pager = DealPager::new(&api, ListFilter::default(), vec!["*".to_string()]);

        let mut ids = Vec::new();
        assert!(!pager.is_done());
        while let Some(page) = pager.next_page().await.expect("page") {
            for raw in &page {
                ids.push(raw.id().expect("id"));
            }
        }
        assert!(pager.is_done());
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(*api.requested_starts.lock().unwrap(), vec![0, 2]);

        // The drained pager stays finished.
        assert!(pager.next_page().await.expect("page").is_none());
    }

    #[tokio::test]
    async fn pager_stops_on_empty_result_even_with_cursor() {
        let api = ScriptedApi::new(vec![
            Ok(DealPage {
                deals: vec![deal("1")],
                next: Some(50),
            }),
            Ok(DealPage {
                deals: vec![],
                next: Some(100),
            }),
        ]);
        let mut pager = DealPager::new(&api, ListFilter::default(), vec!["*".to_string()]);
        assert!(pager.next_page().await.expect("page").is_some());
        assert!(pager.next_page().await.expect("page").is_none());
    }

    #[tokio::test]
    async fn pager_surfaces_fetch_errors_without_advancing() {
        let api = ScriptedApi::new(vec![Err(ApiError::RetriesExhausted {
            attempts: 3,
            last: Box::new(transient()),
        })]);
        let mut pager = DealPager::new(&api, ListFilter::default(), vec!["*".to_string()]);
        assert!(matches!(
            pager.next_page().await,
            Err(ApiError::RetriesExhausted { .. })
        ));
    }
}
