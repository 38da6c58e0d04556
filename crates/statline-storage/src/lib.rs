//! Upstream HTTP access, call budgeting and record stores for statline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use statline_core::{
    Competition, Country, Entity, EntityKind, Fixture, GoalEvent, MatchResult, Player,
    PlayerStats, Round, Season, Squad, SubstitutionEvent, Team, TeamStats, Venue,
};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub mod postgres;

pub use postgres::{connect as connect_postgres, ensure_schema, PgEntityStore, PgScopeSource};

pub const CRATE_NAME: &str = "statline-storage";

/// Fixed budget of upstream calls, shared by every worker of a run.
#[derive(Debug)]
pub struct RateGate {
    budget: u64,
    remaining: AtomicU64,
}

impl RateGate {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            remaining: AtomicU64::new(budget),
        }
    }

    /// Admit one call if budget remains. Never blocks.
    pub fn try_consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn used(&self) -> u64 {
        self.budget - self.remaining()
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {path}")]
    HttpStatus { status: u16, path: String },
    #[error("invalid upstream url: {0}")]
    Url(String),
    #[error("undecodable upstream body for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("upstream envelope for {path} has unexpected `data`: {found}")]
    Envelope { path: String, found: &'static str },
    #[error("http fetcher is shut down")]
    Closed,
}

/// Shared `reqwest` client with a timeout, a global in-flight limit and
/// optional backoff on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.timeout)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// Body of a successful response.
    pub async fn fetch_bytes(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        // The query string carries the api token; only the path is logged.
        let path = url.path().to_string();
        let mut attempt = 0usize;

        loop {
            let resp_result = self
                .client
                .get(url.clone())
                .send()
                .instrument(info_span!("http_fetch", path = %path, attempt))
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        path,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// One page of an upstream collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiPage {
    pub items: Vec<JsonValue>,
    pub current_page: u32,
    pub total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: JsonValue,
    #[serde(default)]
    meta: Option<EnvelopeMeta>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeMeta {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    current_page: u32,
    total_pages: u32,
}

impl ApiPage {
    pub fn single(items: Vec<JsonValue>) -> Self {
        Self {
            items,
            current_page: 1,
            total_pages: 1,
        }
    }

    /// Decode a `{ "data": .., "meta": { "pagination": .. } }` body.
    pub fn from_body(path: &str, body: &[u8]) -> Result<Self, FetchError> {
        let envelope: Envelope = serde_json::from_slice(body).map_err(|source| FetchError::Decode {
            path: path.to_string(),
            source,
        })?;

        let items = match envelope.data {
            JsonValue::Array(items) => items,
            JsonValue::Object(map) => vec![JsonValue::Object(map)],
            JsonValue::Null => Vec::new(),
            JsonValue::Bool(_) => return Err(envelope_error(path, "bool")),
            JsonValue::Number(_) => return Err(envelope_error(path, "number")),
            JsonValue::String(_) => return Err(envelope_error(path, "string")),
        };

        let (current_page, total_pages) = envelope
            .meta
            .and_then(|meta| meta.pagination)
            .map(|p| (p.current_page, p.total_pages))
            .unwrap_or((1, 1));

        Ok(Self {
            items,
            current_page,
            total_pages,
        })
    }

    pub fn is_last_page(&self) -> bool {
        self.current_page >= self.total_pages
    }

    pub fn next_page(&self) -> Option<u32> {
        if self.is_last_page() {
            None
        } else {
            Some(self.current_page + 1)
        }
    }
}

fn envelope_error(path: &str, found: &'static str) -> FetchError {
    FetchError::Envelope {
        path: path.to_string(),
        found,
    }
}

/// Paged access to the upstream statistics API.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch_page(
        &self,
        path: &str,
        includes: &[&str],
        page: u32,
    ) -> Result<ApiPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub api_token: String,
    pub http: HttpClientConfig,
}

#[derive(Debug)]
pub struct ApiClient {
    base_url: String,
    api_token: String,
    http: HttpFetcher,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            http: HttpFetcher::new(config.http)?,
        })
    }

    pub fn page_url(&self, path: &str, includes: &[&str], page: u32) -> Result<Url, FetchError> {
        let mut url = Url::parse(&format!(
            "{}/{}",
            self.base_url,
            path.trim_start_matches('/')
        ))
        .map_err(|e| FetchError::Url(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            if !self.api_token.is_empty() {
                query.append_pair("api_token", &self.api_token);
            }
            if !includes.is_empty() {
                query.append_pair("include", &includes.join(","));
            }
            query.append_pair("page", &page.to_string());
        }
        Ok(url)
    }
}

#[async_trait]
impl UpstreamClient for ApiClient {
    async fn fetch_page(
        &self,
        path: &str,
        includes: &[&str],
        page: u32,
    ) -> Result<ApiPage, FetchError> {
        let url = self.page_url(path, includes, page)?;
        let body = self.http.fetch_bytes(url).await?;
        let page = ApiPage::from_body(path, &body)?;
        debug!(
            path,
            items = page.items.len(),
            current_page = page.current_page,
            total_pages = page.total_pages,
            "fetched upstream page"
        );
        Ok(page)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {key} not found")]
    NotFound { entity: EntityKind, key: String },
    #[error("{entity} {key} already exists")]
    Conflict { entity: EntityKind, key: String },
    #[error("record codec failure: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Persistence for one entity kind, addressed by natural key.
#[async_trait]
pub trait EntityStore<R: Entity>: Send + Sync {
    /// `Ok(None)` is the only "not found" signal.
    async fn find(&self, key: &R::Key) -> Result<Option<R>, StoreError>;

    /// Fails with `Conflict` if the key already exists.
    async fn insert(&self, record: &R) -> Result<(), StoreError>;

    /// Idempotent; fails with `NotFound` if the key does not exist.
    async fn update(&self, record: &R) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureFilter {
    All,
    CurrentSeasons,
    /// `[from, to)`
    Between(DateTime<Utc>, DateTime<Utc>),
}

/// Store-side queries used to turn a command scope into target IDs.
#[async_trait]
pub trait ScopeSource: Send + Sync {
    async fn season_ids(&self, current_only: bool) -> Result<Vec<u64>, StoreError>;
    async fn squad_player_ids(&self, current_only: bool) -> Result<Vec<u64>, StoreError>;
    async fn fixture_ids(&self, filter: FixtureFilter) -> Result<Vec<u64>, StoreError>;
}

/// In-process store with write counters.
#[derive(Debug)]
pub struct MemoryStore<R: Entity> {
    records: Mutex<HashMap<R::Key, R>>,
    inserts: AtomicUsize,
    updates: AtomicUsize,
}

impl<R: Entity> Default for MemoryStore<R> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            inserts: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }
}

impl<R: Entity> MemoryStore<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed records without counting them as writes.
    pub fn with_records(records: impl IntoIterator<Item = R>) -> Self {
        let map = records.into_iter().map(|r| (r.key(), r)).collect();
        Self {
            records: Mutex::new(map),
            ..Self::default()
        }
    }

    pub async fn get(&self, key: &R::Key) -> Option<R> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> Vec<R> {
        self.records.lock().await.values().cloned().collect()
    }

    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: Entity> EntityStore<R> for MemoryStore<R> {
    async fn find(&self, key: &R::Key) -> Result<Option<R>, StoreError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn insert(&self, record: &R) -> Result<(), StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().await;
        let key = record.key();
        if records.contains_key(&key) {
            return Err(StoreError::Conflict {
                entity: R::KIND,
                key: key.to_string(),
            });
        }
        records.insert(key, record.clone());
        Ok(())
    }

    async fn update(&self, record: &R) -> Result<(), StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().await;
        let key = record.key();
        match records.get_mut(&key) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: R::KIND,
                key: key.to_string(),
            }),
        }
    }
}

/// Scope queries answered from in-process stores.
#[derive(Debug, Clone)]
pub struct MemoryScopeSource {
    seasons: Arc<MemoryStore<Season>>,
    squads: Arc<MemoryStore<Squad>>,
    fixtures: Arc<MemoryStore<Fixture>>,
}

impl MemoryScopeSource {
    pub fn new(
        seasons: Arc<MemoryStore<Season>>,
        squads: Arc<MemoryStore<Squad>>,
        fixtures: Arc<MemoryStore<Fixture>>,
    ) -> Self {
        Self {
            seasons,
            squads,
            fixtures,
        }
    }

    async fn current_season_ids(&self) -> Vec<u64> {
        self.seasons
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.is_current)
            .map(|s| s.id)
            .collect()
    }
}

fn sorted_unique(mut ids: Vec<u64>) -> Vec<u64> {
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[async_trait]
impl ScopeSource for MemoryScopeSource {
    async fn season_ids(&self, current_only: bool) -> Result<Vec<u64>, StoreError> {
        let ids = self
            .seasons
            .snapshot()
            .await
            .into_iter()
            .filter(|s| !current_only || s.is_current)
            .map(|s| s.id)
            .collect();
        Ok(sorted_unique(ids))
    }

    async fn squad_player_ids(&self, current_only: bool) -> Result<Vec<u64>, StoreError> {
        let current = if current_only {
            Some(self.current_season_ids().await)
        } else {
            None
        };
        let ids = self
            .squads
            .snapshot()
            .await
            .into_iter()
            .filter(|sq| current.as_ref().map_or(true, |ids| ids.contains(&sq.season_id)))
            .flat_map(|sq| sq.player_ids)
            .collect();
        Ok(sorted_unique(ids))
    }

    async fn fixture_ids(&self, filter: FixtureFilter) -> Result<Vec<u64>, StoreError> {
        let fixtures = self.fixtures.snapshot().await;
        let ids = match filter {
            FixtureFilter::All => fixtures.into_iter().map(|f| f.id).collect(),
            FixtureFilter::CurrentSeasons => {
                let current = self.current_season_ids().await;
                fixtures
                    .into_iter()
                    .filter(|f| current.contains(&f.season_id))
                    .map(|f| f.id)
                    .collect()
            }
            FixtureFilter::Between(from, to) => fixtures
                .into_iter()
                .filter(|f| f.date >= from && f.date < to)
                .map(|f| f.id)
                .collect(),
        };
        Ok(sorted_unique(ids))
    }
}

/// One store handle per entity kind.
#[derive(Clone)]
pub struct EntityStores {
    pub countries: Arc<dyn EntityStore<Country>>,
    pub competitions: Arc<dyn EntityStore<Competition>>,
    pub seasons: Arc<dyn EntityStore<Season>>,
    pub rounds: Arc<dyn EntityStore<Round>>,
    pub venues: Arc<dyn EntityStore<Venue>>,
    pub teams: Arc<dyn EntityStore<Team>>,
    pub squads: Arc<dyn EntityStore<Squad>>,
    pub players: Arc<dyn EntityStore<Player>>,
    pub fixtures: Arc<dyn EntityStore<Fixture>>,
    pub results: Arc<dyn EntityStore<MatchResult>>,
    pub goal_events: Arc<dyn EntityStore<GoalEvent>>,
    pub substitution_events: Arc<dyn EntityStore<SubstitutionEvent>>,
    pub player_stats: Arc<dyn EntityStore<PlayerStats>>,
    pub team_stats: Arc<dyn EntityStore<TeamStats>>,
}

impl EntityStores {
    pub fn in_memory() -> Self {
        Self {
            countries: Arc::new(MemoryStore::<Country>::new()),
            competitions: Arc::new(MemoryStore::<Competition>::new()),
            seasons: Arc::new(MemoryStore::<Season>::new()),
            rounds: Arc::new(MemoryStore::<Round>::new()),
            venues: Arc::new(MemoryStore::<Venue>::new()),
            teams: Arc::new(MemoryStore::<Team>::new()),
            squads: Arc::new(MemoryStore::<Squad>::new()),
            players: Arc::new(MemoryStore::<Player>::new()),
            fixtures: Arc::new(MemoryStore::<Fixture>::new()),
            results: Arc::new(MemoryStore::<MatchResult>::new()),
            goal_events: Arc::new(MemoryStore::<GoalEvent>::new()),
            substitution_events: Arc::new(MemoryStore::<SubstitutionEvent>::new()),
            player_stats: Arc::new(MemoryStore::<PlayerStats>::new()),
            team_stats: Arc::new(MemoryStore::<TeamStats>::new()),
        }
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            countries: Arc::new(PgEntityStore::<Country>::new(pool.clone())),
            competitions: Arc::new(PgEntityStore::<Competition>::new(pool.clone())),
            seasons: Arc::new(PgEntityStore::<Season>::new(pool.clone())),
            rounds: Arc::new(PgEntityStore::<Round>::new(pool.clone())),
            venues: Arc::new(PgEntityStore::<Venue>::new(pool.clone())),
            teams: Arc::new(PgEntityStore::<Team>::new(pool.clone())),
            squads: Arc::new(PgEntityStore::<Squad>::new(pool.clone())),
            players: Arc::new(PgEntityStore::<Player>::new(pool.clone())),
            fixtures: Arc::new(PgEntityStore::<Fixture>::new(pool.clone())),
            results: Arc::new(PgEntityStore::<MatchResult>::new(pool.clone())),
            goal_events: Arc::new(PgEntityStore::<GoalEvent>::new(pool.clone())),
            substitution_events: Arc::new(PgEntityStore::<SubstitutionEvent>::new(pool.clone())),
            player_stats: Arc::new(PgEntityStore::<PlayerStats>::new(pool.clone())),
            team_stats: Arc::new(PgEntityStore::<TeamStats>::new(pool)),
        }
    }
}
