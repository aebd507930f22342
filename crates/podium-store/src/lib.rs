//! Persistence seams and polite HTTP fetch plumbing for Podium.
//!
//! The canonical opportunity store and the run log are traits so the
//! ingestion pipeline never reaches through ambient globals; callers hand
//! an explicit store handle to every component. Two implementations ship:
//! an in-memory store (tests, credential-less dev runs) and a Postgres
//! store over runtime `sqlx` queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use podium_core::{Opportunity, RunStatus, ScrapeRun};
use reqwest::StatusCode;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "podium-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("row not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Canonical listing store. Writes are per-row; the upsert race between
/// two sources reporting the same URL resolves last-writer-wins.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn find_active_by_url(&self, url: &str) -> Result<Option<Opportunity>, StoreError>;
    async fn insert(&self, opportunity: Opportunity) -> Result<(), StoreError>;
    /// Full replace of the row with the same id.
    async fn replace(&self, opportunity: Opportunity) -> Result<(), StoreError>;
    /// Active rows first seen at or after the cutoff, for the notifier scan.
    async fn created_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Opportunity>, StoreError>;
}

/// Append-only run log. Rows are created `running` and finalized exactly
/// once; dashboards read this as the durable per-source status contract.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    async fn create(&self, run: &ScrapeRun) -> Result<(), StoreError>;
    async fn finalize(&self, run: &ScrapeRun) -> Result<(), StoreError>;
    async fn recent(&self, limit: usize) -> Result<Vec<ScrapeRun>, StoreError>;
}

/// In-memory store backing tests and `DATABASE_URL`-less dev runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    opportunities: Mutex<Vec<Opportunity>>,
    runs: Mutex<Vec<ScrapeRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn opportunity_count(&self) -> usize {
        self.opportunities.lock().await.len()
    }

    pub async fn all_opportunities(&self) -> Vec<Opportunity> {
        self.opportunities.lock().await.clone()
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn find_active_by_url(&self, url: &str) -> Result<Option<Opportunity>, StoreError> {
        let rows = self.opportunities.lock().await;
        Ok(rows
            .iter()
            .find(|o| o.active && o.source_url.as_deref() == Some(url))
            .cloned())
    }

    async fn insert(&self, opportunity: Opportunity) -> Result<(), StoreError> {
        self.opportunities.lock().await.push(opportunity);
        Ok(())
    }

    async fn replace(&self, opportunity: Opportunity) -> Result<(), StoreError> {
        let mut rows = self.opportunities.lock().await;
        let slot = rows
            .iter_mut()
            .find(|o| o.id == opportunity.id)
            .ok_or_else(|| StoreError::NotFound(opportunity.id.to_string()))?;
        *slot = opportunity;
        Ok(())
    }

    async fn created_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Opportunity>, StoreError> {
        let rows = self.opportunities.lock().await;
        Ok(rows
            .iter()
            .filter(|o| o.active && o.first_seen_at >= cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RunLogStore for MemoryStore {
    async fn create(&self, run: &ScrapeRun) -> Result<(), StoreError> {
        self.runs.lock().await.push(run.clone());
        Ok(())
    }

    async fn finalize(&self, run: &ScrapeRun) -> Result<(), StoreError> {
        let mut rows = self.runs.lock().await;
        let slot = rows
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| StoreError::NotFound(run.id.to_string()))?;
        if slot.status.is_terminal() {
            return Err(StoreError::Query(format!(
                "run {} already finalized as {}",
                run.id,
                slot.status.as_str()
            )));
        }
        *slot = run.clone();
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ScrapeRun>, StoreError> {
        let rows = self.runs.lock().await;
        let mut out: Vec<ScrapeRun> = rows.clone();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        Ok(out)
    }
}

/// Postgres-backed store. Runtime queries only, so the crate builds
/// without a database at hand.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS opportunities (
    id UUID PRIMARY KEY,
    source_url TEXT,
    name TEXT NOT NULL,
    organizer_name TEXT,
    organizer_email TEXT,
    description TEXT,
    location TEXT,
    audience_size INTEGER,
    fee_min DOUBLE PRECISION,
    fee_max DOUBLE PRECISION,
    event_date DATE,
    submission_deadline DATE,
    source_tag TEXT NOT NULL,
    first_seen_at TIMESTAMPTZ NOT NULL,
    active BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE INDEX IF NOT EXISTS opportunities_source_url_active
    ON opportunities (source_url) WHERE active;

CREATE TABLE IF NOT EXISTS scrape_runs (
    id UUID PRIMARY KEY,
    source_tag TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ,
    found INTEGER NOT NULL DEFAULT 0,
    inserted INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    error TEXT
);
"#;

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_SQL.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn row_to_opportunity(row: &sqlx::postgres::PgRow) -> Result<Opportunity, StoreError> {
        let audience: Option<i32> = row.try_get("audience_size").map_err(StoreError::from)?;
        Ok(Opportunity {
            id: row.try_get("id").map_err(StoreError::from)?,
            source_url: row.try_get("source_url").map_err(StoreError::from)?,
            name: row.try_get("name").map_err(StoreError::from)?,
            organizer_name: row.try_get("organizer_name").map_err(StoreError::from)?,
            organizer_email: row.try_get("organizer_email").map_err(StoreError::from)?,
            description: row.try_get("description").map_err(StoreError::from)?,
            location: row.try_get("location").map_err(StoreError::from)?,
            audience_size: audience.map(|v| v.max(0) as u32),
            fee_min: row.try_get("fee_min").map_err(StoreError::from)?,
            fee_max: row.try_get("fee_max").map_err(StoreError::from)?,
            event_date: row.try_get("event_date").map_err(StoreError::from)?,
            submission_deadline: row
                .try_get("submission_deadline")
                .map_err(StoreError::from)?,
            source_tag: row.try_get("source_tag").map_err(StoreError::from)?,
            first_seen_at: row.try_get("first_seen_at").map_err(StoreError::from)?,
            active: row.try_get("active").map_err(StoreError::from)?,
        })
    }

    fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<ScrapeRun, StoreError> {
        let status: String = row.try_get("status").map_err(StoreError::from)?;
        let found: i32 = row.try_get("found").map_err(StoreError::from)?;
        let inserted: i32 = row.try_get("inserted").map_err(StoreError::from)?;
        let updated: i32 = row.try_get("updated").map_err(StoreError::from)?;
        Ok(ScrapeRun {
            id: row.try_get("id").map_err(StoreError::from)?,
            source_tag: row.try_get("source_tag").map_err(StoreError::from)?,
            status: status.parse::<RunStatus>().map_err(StoreError::Query)?,
            started_at: row.try_get("started_at").map_err(StoreError::from)?,
            completed_at: row.try_get("completed_at").map_err(StoreError::from)?,
            found: found.max(0) as u32,
            inserted: inserted.max(0) as u32,
            updated: updated.max(0) as u32,
            error: row.try_get("error").map_err(StoreError::from)?,
        })
    }
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn find_active_by_url(&self, url: &str) -> Result<Option<Opportunity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM opportunities
             WHERE source_url = $1 AND active
             LIMIT 1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::row_to_opportunity(&r)).transpose()
    }

    async fn insert(&self, o: Opportunity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO opportunities
                (id, source_url, name, organizer_name, organizer_email,
                 description, location, audience_size, fee_min, fee_max,
                 event_date, submission_deadline, source_tag, first_seen_at, active)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            "#,
        )
        .bind(o.id)
        .bind(&o.source_url)
        .bind(&o.name)
        .bind(&o.organizer_name)
        .bind(&o.organizer_email)
        .bind(&o.description)
        .bind(&o.location)
        .bind(o.audience_size.map(|v| v as i32))
        .bind(o.fee_min)
        .bind(o.fee_max)
        .bind(o.event_date)
        .bind(o.submission_deadline)
        .bind(&o.source_tag)
        .bind(o.first_seen_at)
        .bind(o.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace(&self, o: Opportunity) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET source_url = $2, name = $3, organizer_name = $4,
                   organizer_email = $5, description = $6, location = $7,
                   audience_size = $8, fee_min = $9, fee_max = $10,
                   event_date = $11, submission_deadline = $12,
                   source_tag = $13, first_seen_at = $14, active = $15
             WHERE id = $1
            "#,
        )
        .bind(o.id)
        .bind(&o.source_url)
        .bind(&o.name)
        .bind(&o.organizer_name)
        .bind(&o.organizer_email)
        .bind(&o.description)
        .bind(&o.location)
        .bind(o.audience_size.map(|v| v as i32))
        .bind(o.fee_min)
        .bind(o.fee_max)
        .bind(o.event_date)
        .bind(o.submission_deadline)
        .bind(&o.source_tag)
        .bind(o.first_seen_at)
        .bind(o.active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(o.id.to_string()));
        }
        Ok(())
    }

    async fn created_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Opportunity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM opportunities
             WHERE active AND first_seen_at >= $1
             ORDER BY first_seen_at DESC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_opportunity).collect()
    }
}

#[async_trait]
impl RunLogStore for PgStore {
    async fn create(&self, run: &ScrapeRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_runs
                (id, source_tag, status, started_at, completed_at,
                 found, inserted, updated, error)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(run.id)
        .bind(&run.source_tag)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.found as i32)
        .bind(run.inserted as i32)
        .bind(run.updated as i32)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize(&self, run: &ScrapeRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = $2, completed_at = $3, found = $4,
                   inserted = $5, updated = $6, error = $7
             WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.completed_at)
        .bind(run.found as i32)
        .bind(run.inserted as i32)
        .bind(run.updated as i32)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Query(format!(
                "run {} missing or already finalized",
                run.id
            )));
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ScrapeRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scrape_runs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_run).collect()
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
            max_retries: 3,
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

/// Enforces a minimum wall-clock gap between consecutive requests to the
/// same source, keyed by source tag. Polite-crawling floor is 2000 ms.
#[derive(Debug)]
pub struct PoliteDelay {
    min_interval: Duration,
    last_request: Mutex<HashMap<String, Instant>>,
}

pub const POLITE_MIN_INTERVAL: Duration = Duration::from_millis(2000);

impl PoliteDelay {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    /// Sleep until at least `min_interval` has passed since the previous
    /// `pause` for this source. The first call per source returns
    /// immediately.
    pub async fn pause(&self, source_tag: &str) {
        let wait = {
            let map = self.last_request.lock().await;
            map.get(source_tag).and_then(|last| {
                (last.elapsed() < self.min_interval).then(|| self.min_interval - last.elapsed())
            })
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        self.last_request
            .lock()
            .await
            .insert(source_tag.to_string(), Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrying GET client shared by all source fetchers. Retries only
/// transport faults and 5xx/429 responses, with exponential backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        source_tag: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_tag, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
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

/// Convenience bundle handed to the orchestrator: one trait object per
/// persistence concern, resolvable from either backend.
#[derive(Clone)]
pub struct StoreHandles {
    pub opportunities: Arc<dyn OpportunityStore>,
    pub runs: Arc<dyn RunLogStore>,
}

impl StoreHandles {
    pub fn memory() -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            Self {
                opportunities: store.clone(),
                runs: store.clone(),
            },
            store,
        )
    }

    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            opportunities: store.clone(),
            runs: store,
        }
    }
}
