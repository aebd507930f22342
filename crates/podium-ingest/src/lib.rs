//! Ingestion orchestration: sequences source fetchers, isolates their
//! failures, routes every candidate through the deduplicating upsert,
//! writes run log rows, and fires the post-run match notifier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use podium_core::{Candidate, Opportunity, RunStatus, ScrapeRun, AGGREGATE_SOURCE_TAG};
use podium_sources::{FetcherRegistry, SourceConfig};
use podium_store::{HttpFetcher, OpportunityStore, PoliteDelay, RunLogStore, StoreError, StoreHandles};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "podium-ingest";

/// Minimum opaque relevance score that makes an opportunity a high match.
pub const HIGH_MATCH_THRESHOLD: f64 = 85.0;

/// Trailing window the notifier scans for freshly created opportunities.
pub const NOTIFY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Only orchestrator-level bookkeeping failures escape as errors; every
/// source- and candidate-level failure is folded into the summary.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("aggregate run log write failed: {0}")]
    RunLog(#[from] StoreError),
    #[error("no configured source with tag {0}")]
    UnknownSource(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceResult {
    pub source: String,
    pub success: bool,
    pub found: u32,
    pub inserted: u32,
    pub updated: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunTotals {
    pub found: u32,
    pub inserted: u32,
    pub updated: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub success: bool,
    pub results: Vec<SourceResult>,
    pub totals: RunTotals,
    pub failed_sources: Vec<String>,
}

impl RunSummary {
    fn from_results(run_id: Uuid, results: Vec<SourceResult>) -> Self {
        let failed_sources: Vec<String> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.source.clone())
            .collect();
        let succeeded = results.len() - failed_sources.len();
        let status = RunStatus::classify(succeeded, failed_sources.len());
        let totals = results.iter().fold(RunTotals::default(), |acc, r| RunTotals {
            found: acc.found + r.found,
            inserted: acc.inserted + r.inserted,
            updated: acc.updated + r.updated,
        });
        Self {
            run_id,
            status,
            // Partial is a first-class expected outcome, not a failure.
            success: status != RunStatus::Failed,
            results,
            totals,
            failed_sources,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Inserted,
    Updated,
}

/// Insert-vs-update decision keyed on the source URL, applied one row at
/// a time so partial progress survives any later candidate's failure.
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn OpportunityStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn OpportunityStore>) -> Self {
        Self { store }
    }

    /// Upsert with last-writer-wins semantics. Candidates without a dedup
    /// key are always inserted; content-based fallback matching is
    /// deliberately absent.
    pub async fn apply(&self, candidate: Candidate) -> Result<WriteKind, StoreError> {
        if let Some(url) = candidate.source_url.clone() {
            if let Some(existing) = self.store.find_active_by_url(&url).await? {
                let refreshed = candidate.apply_to(&existing);
                self.store.replace(refreshed).await?;
                return Ok(WriteKind::Updated);
            }
        }
        let row = candidate.into_opportunity(Uuid::new_v4(), Utc::now());
        self.store.insert(row).await?;
        Ok(WriteKind::Inserted)
    }
}

/// Opaque relevance collaborator. Owns both the (user, listing) score and
/// the user's pipeline stage for a listing; this crate only reads it.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, user_id: Uuid, opportunity: &Opportunity) -> anyhow::Result<f64>;
    async fn stage_is_new(&self, user_id: Uuid, opportunity_id: Uuid) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn user_ids(&self) -> anyhow::Result<Vec<Uuid>>;
}

/// Fixed roster of subscriber ids, resolved at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles(pub Vec<Uuid>);

#[async_trait]
impl ProfileDirectory for StaticProfiles {
    async fn user_ids(&self) -> anyhow::Result<Vec<Uuid>> {
        Ok(self.0.clone())
    }
}

/// One durable "this user has at least one new high match" record per
/// run. Never one per opportunity.
#[derive(Debug, Clone, Serialize)]
pub struct MatchSignal {
    pub user_id: Uuid,
    pub run_id: Uuid,
    pub noted_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn record(&self, signal: MatchSignal) -> anyhow::Result<()>;
}

/// Log-only sink; the digest/email collaborator can swap in a durable one.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn record(&self, signal: MatchSignal) -> anyhow::Result<()> {
        info!(
            user_id = %signal.user_id,
            run_id = %signal.run_id,
            "user has new high-match opportunities"
        );
        Ok(())
    }
}

/// Stateless post-run scan: flags each user with at least one fresh
/// opportunity scoring at or above the threshold whose pipeline stage is
/// still "new".
pub struct MatchNotifier {
    scorer: Arc<dyn RelevanceScorer>,
    profiles: Arc<dyn ProfileDirectory>,
    sink: Arc<dyn NotificationSink>,
    threshold: f64,
    window: Duration,
}

impl MatchNotifier {
    pub fn new(
        scorer: Arc<dyn RelevanceScorer>,
        profiles: Arc<dyn ProfileDirectory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            scorer,
            profiles,
            sink,
            threshold: HIGH_MATCH_THRESHOLD,
            window: NOTIFY_WINDOW,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Returns how many users were flagged as notification-eligible.
    pub async fn notify_after_run(
        &self,
        store: &dyn OpportunityStore,
        run_id: Uuid,
    ) -> anyhow::Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::hours(24));
        let recent = store.created_since(cutoff).await?;
        if recent.is_empty() {
            return Ok(0);
        }

        let mut eligible = 0usize;
        for user_id in self.profiles.user_ids().await? {
            let mut has_high_match = false;
            for opportunity in &recent {
                if !self.scorer.stage_is_new(user_id, opportunity.id).await? {
                    continue;
                }
                if self.scorer.score(user_id, opportunity).await? >= self.threshold {
                    has_high_match = true;
                    break;
                }
            }
            if has_high_match {
                self.sink
                    .record(MatchSignal {
                        user_id,
                        run_id,
                        noted_at: Utc::now(),
                    })
                    .await?;
                eligible += 1;
            }
        }
        Ok(eligible)
    }
}

struct SourceIngest {
    run_id: Uuid,
    result: SourceResult,
}

/// Sequences the configured sources through fetch, dedup, and run log
/// writes. Fully sequential per run; the caller-supplied timeout bounds
/// the aggregate walk.
pub struct Orchestrator {
    stores: StoreHandles,
    registry: FetcherRegistry,
    sources: Vec<SourceConfig>,
    http: HttpFetcher,
    delay: PoliteDelay,
    dedup: Deduplicator,
    notifier: Option<MatchNotifier>,
    run_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        stores: StoreHandles,
        registry: FetcherRegistry,
        sources: Vec<SourceConfig>,
        http: HttpFetcher,
        delay: PoliteDelay,
    ) -> Self {
        let dedup = Deduplicator::new(stores.opportunities.clone());
        Self {
            stores,
            registry,
            sources,
            http,
            delay,
            dedup,
            notifier: None,
            run_timeout: None,
        }
    }

    pub fn with_notifier(mut self, notifier: MatchNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn source_tags(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.tag.clone()).collect()
    }

    pub fn run_log(&self) -> Arc<dyn RunLogStore> {
        self.stores.runs.clone()
    }

    /// Aggregate run across every enabled source, in configured order.
    pub async fn run_all(&self) -> Result<RunSummary, OrchestratorError> {
        let started_at = Utc::now();
        let aggregate = ScrapeRun::begin(AGGREGATE_SOURCE_TAG, started_at);
        // The one fatal failure class: without the aggregate row there is
        // no accounting to attach anything to.
        self.stores.runs.create(&aggregate).await?;

        let deadline = self.run_timeout.map(|t| tokio::time::Instant::now() + t);
        let mut results = Vec::new();

        for source in self.sources.iter().filter(|s| s.enabled) {
            let ingest = match deadline {
                None => self.ingest_source(source).await,
                Some(deadline) if tokio::time::Instant::now() >= deadline => {
                    self.record_timed_out_source(source, "run timeout exceeded before source started")
                        .await
                }
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.ingest_source(source)).await {
                        Ok(ingest) => ingest,
                        // In-flight source abandoned; its committed writes
                        // stay, its run log row stays `running`.
                        Err(_) => SourceIngest {
                            run_id: Uuid::nil(),
                            result: SourceResult {
                                source: source.tag.clone(),
                                success: false,
                                found: 0,
                                inserted: 0,
                                updated: 0,
                                error: Some("run timeout exceeded mid-fetch".into()),
                            },
                        },
                    }
                }
            };
            results.push(ingest.result);
        }

        let summary = RunSummary::from_results(aggregate.id, results);
        let error = (!summary.failed_sources.is_empty()).then(|| summary.failed_sources.join(","));
        let finalized = aggregate.complete(
            summary.status,
            Utc::now(),
            summary.totals.found,
            summary.totals.inserted,
            summary.totals.updated,
            error,
        );
        if let Err(err) = self.stores.runs.finalize(&finalized).await {
            // Best-effort terminal mark before surfacing the fatal error.
            let failed = finalized.clone().complete(
                RunStatus::Failed,
                Utc::now(),
                0,
                0,
                0,
                Some("aggregate run log finalize failed".into()),
            );
            let _ = self.stores.runs.finalize(&failed).await;
            return Err(err.into());
        }

        if let Some(notifier) = &self.notifier {
            match notifier
                .notify_after_run(self.stores.opportunities.as_ref(), summary.run_id)
                .await
            {
                Ok(eligible) => info!(eligible, run_id = %summary.run_id, "match scan complete"),
                // Ingestion success is not contingent on notification.
                Err(err) => warn!(error = %err, "match notifier failed after run"),
            }
        }

        info!(
            run_id = %summary.run_id,
            status = summary.status.as_str(),
            found = summary.totals.found,
            inserted = summary.totals.inserted,
            updated = summary.totals.updated,
            "aggregate ingestion run finished"
        );
        Ok(summary)
    }

    /// Single-source path: same fetch/dedup/run-log machinery, no
    /// aggregate row and no notifier.
    pub async fn run_source(&self, tag: &str) -> Result<RunSummary, OrchestratorError> {
        let source = self
            .sources
            .iter()
            .find(|s| s.tag == tag)
            .ok_or_else(|| OrchestratorError::UnknownSource(tag.to_string()))?;

        let ingest = match self.run_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.ingest_source(source)).await {
                    Ok(ingest) => ingest,
                    Err(_) => SourceIngest {
                        run_id: Uuid::nil(),
                        result: SourceResult {
                            source: source.tag.clone(),
                            success: false,
                            found: 0,
                            inserted: 0,
                            updated: 0,
                            error: Some("run timeout exceeded mid-fetch".into()),
                        },
                    },
                }
            }
            None => self.ingest_source(source).await,
        };

        Ok(RunSummary::from_results(ingest.run_id, vec![ingest.result]))
    }

    /// One source through the isolation boundary: every failure below
    /// this frame becomes a `SourceResult` with `success: false`.
    async fn ingest_source(&self, source: &SourceConfig) -> SourceIngest {
        let started_at = Utc::now();
        let run = ScrapeRun::begin(&source.tag, started_at);
        let run_id = run.id;

        let fail = |run_id: Uuid, message: String| SourceIngest {
            run_id,
            result: SourceResult {
                source: source.tag.clone(),
                success: false,
                found: 0,
                inserted: 0,
                updated: 0,
                error: Some(message),
            },
        };

        // A per-source run log failure isolates to this source only.
        if let Err(err) = self.stores.runs.create(&run).await {
            warn!(source = %source.tag, error = %err, "could not open source run log row");
            return fail(run_id, format!("run log unavailable: {err}"));
        }

        let Some(fetcher) = self.registry.get(&source.tag) else {
            let message = format!("no fetcher registered for tag {}", source.tag);
            self.finalize_source_run(run, RunStatus::Failed, 0, 0, 0, Some(message.clone()))
                .await;
            return fail(run_id, message);
        };

        let outcome = fetcher.fetch(&self.http, &self.delay, source).await;
        let found = outcome.candidates.len() as u32;
        let mut inserted = 0u32;
        let mut updated = 0u32;

        for candidate in outcome.candidates {
            match self.dedup.apply(candidate).await {
                Ok(WriteKind::Inserted) => inserted += 1,
                Ok(WriteKind::Updated) => updated += 1,
                // Swallowed at candidate level: not counted, siblings
                // continue.
                Err(err) => warn!(source = %source.tag, error = %err, "candidate write failed"),
            }
        }

        let error = outcome.error.map(|e| e.to_string());
        let success = error.is_none();
        let status = if success {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        self.finalize_source_run(run, status, found, inserted, updated, error.clone())
            .await;

        SourceIngest {
            run_id,
            result: SourceResult {
                source: source.tag.clone(),
                success,
                found,
                inserted,
                updated,
                error,
            },
        }
    }

    async fn finalize_source_run(
        &self,
        run: ScrapeRun,
        status: RunStatus,
        found: u32,
        inserted: u32,
        updated: u32,
        error: Option<String>,
    ) {
        let tag = run.source_tag.clone();
        let finalized = run.complete(status, Utc::now(), found, inserted, updated, error);
        if let Err(err) = self.stores.runs.finalize(&finalized).await {
            warn!(source = %tag, error = %err, "could not finalize source run log row");
        }
    }

    async fn record_timed_out_source(&self, source: &SourceConfig, reason: &str) -> SourceIngest {
        let run = ScrapeRun::begin(&source.tag, Utc::now());
        let run_id = run.id;
        if self.stores.runs.create(&run).await.is_ok() {
            self.finalize_source_run(run, RunStatus::Failed, 0, 0, 0, Some(reason.to_string()))
                .await;
        }
        SourceIngest {
            run_id,
            result: SourceResult {
                source: source.tag.clone(),
                success: false,
                found: 0,
                inserted: 0,
                updated: 0,
                error: Some(reason.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podium_sources::{FetchOutcome, SourceFetchError, SourceFetcher, SourceKind};
    use podium_store::{HttpClientConfig, MemoryStore, RunLogStore};
    use tokio::sync::Mutex;

    fn config(tag: &str) -> SourceConfig {
        SourceConfig {
            tag: tag.to_string(),
            display_name: tag.to_string(),
            enabled: true,
            kind: SourceKind::JsonApi,
            listing_url: format!("https://{tag}.example/api"),
        }
    }

    fn candidate(tag: &str, url: Option<&str>, name: &str) -> Candidate {
        Candidate {
            source_url: url.map(ToString::to_string),
            name: name.to_string(),
            source_tag: tag.to_string(),
            ..Candidate::default()
        }
    }

    struct StaticFetcher {
        tag: &'static str,
        behavior: Box<dyn Fn() -> FetchOutcome + Send + Sync>,
    }

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        fn tag(&self) -> &'static str {
            self.tag
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _delay: &PoliteDelay,
            _config: &SourceConfig,
        ) -> FetchOutcome {
            (self.behavior)()
        }
    }

    struct StalledFetcher {
        tag: &'static str,
    }

    #[async_trait]
    impl SourceFetcher for StalledFetcher {
        fn tag(&self) -> &'static str {
            self.tag
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _delay: &PoliteDelay,
            _config: &SourceConfig,
        ) -> FetchOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            FetchOutcome::ok(vec![])
        }
    }

    fn static_fetcher(
        tag: &'static str,
        behavior: impl Fn() -> FetchOutcome + Send + Sync + 'static,
    ) -> Arc<dyn SourceFetcher> {
        Arc::new(StaticFetcher {
            tag,
            behavior: Box::new(behavior),
        })
    }

    fn orchestrator(
        registry: FetcherRegistry,
        sources: Vec<SourceConfig>,
    ) -> (Orchestrator, Arc<MemoryStore>) {
        let (stores, memory) = StoreHandles::memory();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let delay = PoliteDelay::new(Duration::ZERO);
        (
            Orchestrator::new(stores, registry, sources, http, delay),
            memory,
        )
    }

    #[tokio::test]
    async fn ingesting_same_dedup_key_twice_updates_in_place() {
        let mut registry = FetcherRegistry::new();
        registry.register(static_fetcher("alpha", || {
            FetchOutcome::ok(vec![candidate(
                "alpha",
                Some("https://conf.example/1"),
                "Conf A",
            )])
        }));
        let (orchestrator, memory) = orchestrator(registry, vec![config("alpha")]);

        let first = orchestrator.run_all().await.unwrap();
        assert_eq!(first.totals.inserted, 1);
        assert_eq!(first.totals.updated, 0);

        let second = orchestrator.run_all().await.unwrap();
        assert_eq!(second.totals.inserted, 0);
        assert_eq!(second.totals.updated, 1);

        assert_eq!(memory.opportunity_count().await, 1);
    }

    #[tokio::test]
    async fn one_broken_source_never_blocks_the_others() {
        let mut registry = FetcherRegistry::new();
        registry.register(static_fetcher("alpha", || {
            FetchOutcome::ok(vec![candidate("alpha", Some("https://a.example/1"), "A1")])
        }));
        registry.register(static_fetcher("bravo", || {
            FetchOutcome::failed(SourceFetchError::Network("connection refused".into()))
        }));
        registry.register(static_fetcher("charlie", || {
            FetchOutcome::ok(vec![candidate("charlie", Some("https://c.example/1"), "C1")])
        }));
        let (orchestrator, memory) = orchestrator(
            registry,
            vec![config("alpha"), config("bravo"), config("charlie")],
        );

        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.status, RunStatus::Partial);
        assert!(summary.success);
        assert_eq!(summary.totals.inserted, 2);
        assert_eq!(summary.failed_sources, vec!["bravo".to_string()]);

        let bravo = summary.results.iter().find(|r| r.source == "bravo").unwrap();
        assert!(!bravo.success);
        assert!(bravo.error.as_deref().unwrap().contains("connection refused"));

        let aggregate = memory
            .recent(10)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.source_tag == AGGREGATE_SOURCE_TAG)
            .unwrap();
        assert_eq!(aggregate.status, RunStatus::Partial);
        assert_eq!(aggregate.error.as_deref(), Some("bravo"));
    }

    #[tokio::test]
    async fn all_sources_failing_classifies_failed() {
        let mut registry = FetcherRegistry::new();
        for tag in ["alpha", "bravo"] {
            registry.register(static_fetcher(tag, || {
                FetchOutcome::failed(SourceFetchError::Status {
                    status: 503,
                    url: "https://down.example".into(),
                })
            }));
        }
        let (orchestrator, _memory) = orchestrator(registry, vec![config("alpha"), config("bravo")]);

        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(!summary.success);
        assert_eq!(summary.failed_sources.len(), 2);
    }

    #[tokio::test]
    async fn empty_but_healthy_sources_still_classify_success() {
        let mut registry = FetcherRegistry::new();
        registry.register(static_fetcher("alpha", || FetchOutcome::ok(vec![])));
        registry.register(static_fetcher("bravo", || {
            FetchOutcome::ok(vec![candidate("bravo", None, "B1")])
        }));
        let (orchestrator, _memory) = orchestrator(registry, vec![config("alpha"), config("bravo")]);

        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.totals.found, 1);
    }

    #[tokio::test]
    async fn null_key_candidates_always_insert_as_distinct_rows() {
        let mut registry = FetcherRegistry::new();
        registry.register(static_fetcher("alpha", || {
            FetchOutcome::ok(vec![
                candidate("alpha", None, "Same Name"),
                candidate("alpha", None, "Same Name"),
            ])
        }));
        let (orchestrator, memory) = orchestrator(registry, vec![config("alpha")]);

        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.totals.inserted, 2);
        assert_eq!(summary.totals.updated, 0);
        assert_eq!(memory.opportunity_count().await, 2);
    }

    #[tokio::test]
    async fn later_source_in_same_run_wins_the_shared_key() {
        let mut registry = FetcherRegistry::new();
        registry.register(static_fetcher("src-x", || {
            FetchOutcome::ok(vec![candidate("src-x", Some("u1"), "Conf A")])
        }));
        registry.register(static_fetcher("src-y", || {
            FetchOutcome::ok(vec![candidate("src-y", Some("u1"), "Conf A (updated)")])
        }));
        let (orchestrator, memory) =
            orchestrator(registry, vec![config("src-x"), config("src-y")]);

        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.totals.found, 2);
        assert_eq!(summary.totals.inserted, 1);
        assert_eq!(summary.totals.updated, 1);

        let rows = memory.all_opportunities().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Conf A (updated)");
    }

    #[tokio::test]
    async fn partial_fetch_outcomes_persist_candidates_but_fail_the_source() {
        let mut registry = FetcherRegistry::new();
        registry.register(static_fetcher("alpha", || {
            FetchOutcome::partial(
                vec![candidate("alpha", Some("https://a.example/1"), "A1")],
                SourceFetchError::Malformed("page 2 truncated".into()),
            )
        }));
        let (orchestrator, memory) = orchestrator(registry, vec![config("alpha")]);

        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.totals.found, 1);
        assert_eq!(summary.totals.inserted, 1);
        assert_eq!(memory.opportunity_count().await, 1);
    }

    #[tokio::test]
    async fn single_source_path_writes_only_its_own_run_row() {
        let mut registry = FetcherRegistry::new();
        registry.register(static_fetcher("alpha", || {
            FetchOutcome::ok(vec![candidate("alpha", Some("https://a.example/1"), "A1")])
        }));
        registry.register(static_fetcher("bravo", || {
            FetchOutcome::ok(vec![candidate("bravo", Some("https://b.example/1"), "B1")])
        }));
        let (orchestrator, memory) = orchestrator(registry, vec![config("alpha"), config("bravo")]);

        let summary = orchestrator.run_source("alpha").await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.totals.inserted, 1);

        let runs = memory.recent(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].source_tag, "alpha");
        assert!(memory
            .all_opportunities()
            .await
            .iter()
            .all(|o| o.source_tag == "alpha"));
    }

    #[tokio::test]
    async fn unknown_single_source_tag_is_rejected() {
        let (orchestrator, _memory) = orchestrator(FetcherRegistry::new(), vec![]);
        assert!(matches!(
            orchestrator.run_source("nope").await,
            Err(OrchestratorError::UnknownSource(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_fails_inflight_and_unstarted_sources() {
        let mut registry = FetcherRegistry::new();
        registry.register(Arc::new(StalledFetcher { tag: "alpha" }));
        registry.register(static_fetcher("bravo", || {
            FetchOutcome::ok(vec![candidate("bravo", Some("https://b.example/1"), "B1")])
        }));
        let (orchestrator, _memory) = orchestrator(registry, vec![config("alpha"), config("bravo")]);
        let orchestrator = orchestrator.with_run_timeout(Duration::from_millis(200));

        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        let alpha = summary.results.iter().find(|r| r.source == "alpha").unwrap();
        assert!(alpha.error.as_deref().unwrap().contains("timeout"));
        let bravo = summary.results.iter().find(|r| r.source == "bravo").unwrap();
        assert!(bravo.error.as_deref().unwrap().contains("timeout"));
    }

    struct FlakyWriteStore {
        inner: MemoryStore,
        poison_name: &'static str,
    }

    #[async_trait]
    impl OpportunityStore for FlakyWriteStore {
        async fn find_active_by_url(&self, url: &str) -> Result<Option<Opportunity>, StoreError> {
            self.inner.find_active_by_url(url).await
        }

        async fn insert(&self, opportunity: Opportunity) -> Result<(), StoreError> {
            if opportunity.name == self.poison_name {
                return Err(StoreError::Unavailable("write rejected".into()));
            }
            self.inner.insert(opportunity).await
        }

        async fn replace(&self, opportunity: Opportunity) -> Result<(), StoreError> {
            self.inner.replace(opportunity).await
        }

        async fn created_since(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<Opportunity>, StoreError> {
            self.inner.created_since(cutoff).await
        }
    }

    #[tokio::test]
    async fn single_candidate_write_failure_is_swallowed_and_uncounted() {
        let mut registry = FetcherRegistry::new();
        registry.register(static_fetcher("alpha", || {
            FetchOutcome::ok(vec![
                candidate("alpha", None, "good one"),
                candidate("alpha", None, "bad one"),
                candidate("alpha", None, "good two"),
            ])
        }));

        let runs = Arc::new(MemoryStore::new());
        let opportunities = Arc::new(FlakyWriteStore {
            inner: MemoryStore::new(),
            poison_name: "bad one",
        });
        let stores = StoreHandles {
            opportunities: opportunities.clone(),
            runs: runs.clone(),
        };
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let orchestrator = Orchestrator::new(
            stores,
            registry,
            vec![config("alpha")],
            http,
            PoliteDelay::new(Duration::ZERO),
        );

        let summary = orchestrator.run_all().await.unwrap();
        // Source still succeeds; the poisoned candidate just isn't counted.
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.totals.found, 3);
        assert_eq!(summary.totals.inserted, 2);
        assert_eq!(opportunities.inner.opportunity_count().await, 2);
    }

    struct NoAggregateRunLog {
        inner: MemoryStore,
    }

    #[async_trait]
    impl RunLogStore for NoAggregateRunLog {
        async fn create(&self, run: &ScrapeRun) -> Result<(), StoreError> {
            if run.source_tag == AGGREGATE_SOURCE_TAG {
                return Err(StoreError::Unavailable("run log down".into()));
            }
            self.inner.create(run).await
        }

        async fn finalize(&self, run: &ScrapeRun) -> Result<(), StoreError> {
            self.inner.finalize(run).await
        }

        async fn recent(&self, limit: usize) -> Result<Vec<ScrapeRun>, StoreError> {
            self.inner.recent(limit).await
        }
    }

    #[tokio::test]
    async fn aggregate_run_log_failure_is_fatal() {
        let stores = StoreHandles {
            opportunities: Arc::new(MemoryStore::new()),
            runs: Arc::new(NoAggregateRunLog {
                inner: MemoryStore::new(),
            }),
        };
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let orchestrator = Orchestrator::new(
            stores,
            FetcherRegistry::new(),
            vec![],
            http,
            PoliteDelay::new(Duration::ZERO),
        );
        assert!(matches!(
            orchestrator.run_all().await,
            Err(OrchestratorError::RunLog(_))
        ));
    }

    #[derive(Default)]
    struct MemorySink {
        signals: Mutex<Vec<MatchSignal>>,
    }

    #[async_trait]
    impl NotificationSink for MemorySink {
        async fn record(&self, signal: MatchSignal) -> anyhow::Result<()> {
            self.signals.lock().await.push(signal);
            Ok(())
        }
    }

    struct FixedScorer {
        score: f64,
    }

    #[async_trait]
    impl RelevanceScorer for FixedScorer {
        async fn score(&self, _user_id: Uuid, _opportunity: &Opportunity) -> anyhow::Result<f64> {
            Ok(self.score)
        }

        async fn stage_is_new(&self, _user_id: Uuid, _opportunity_id: Uuid) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn two_qualifying_opportunities_surface_one_signal_per_user() {
        let store = MemoryStore::new();
        for name in ["Conf A", "Conf B"] {
            store
                .insert(
                    candidate("alpha", None, name).into_opportunity(Uuid::new_v4(), Utc::now()),
                )
                .await
                .unwrap();
        }

        let sink = Arc::new(MemorySink::default());
        let user = Uuid::new_v4();
        let notifier = MatchNotifier::new(
            Arc::new(FixedScorer { score: 92.0 }),
            Arc::new(StaticProfiles(vec![user])),
            sink.clone(),
        );

        let eligible = notifier.notify_after_run(&store, Uuid::new_v4()).await.unwrap();
        assert_eq!(eligible, 1);
        let signals = sink.signals.lock().await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].user_id, user);
    }

    #[tokio::test]
    async fn scores_below_threshold_flag_nobody() {
        let store = MemoryStore::new();
        store
            .insert(candidate("alpha", None, "Conf A").into_opportunity(Uuid::new_v4(), Utc::now()))
            .await
            .unwrap();

        let sink = Arc::new(MemorySink::default());
        let notifier = MatchNotifier::new(
            Arc::new(FixedScorer { score: 60.0 }),
            Arc::new(StaticProfiles(vec![Uuid::new_v4()])),
            sink.clone(),
        );

        let eligible = notifier
            .notify_after_run(&store, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(eligible, 0);
        assert!(sink.signals.lock().await.is_empty());
    }

    struct BrokenScorer;

    #[async_trait]
    impl RelevanceScorer for BrokenScorer {
        async fn score(&self, _user_id: Uuid, _opportunity: &Opportunity) -> anyhow::Result<f64> {
            anyhow::bail!("scoring service unreachable")
        }

        async fn stage_is_new(&self, _user_id: Uuid, _opportunity_id: Uuid) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn notifier_failure_never_changes_the_run_status() {
        let mut registry = FetcherRegistry::new();
        registry.register(static_fetcher("alpha", || {
            FetchOutcome::ok(vec![candidate("alpha", Some("https://a.example/1"), "A1")])
        }));
        let (orchestrator, _memory) = orchestrator(registry, vec![config("alpha")]);
        let orchestrator = orchestrator.with_notifier(MatchNotifier::new(
            Arc::new(BrokenScorer),
            Arc::new(StaticProfiles(vec![Uuid::new_v4()])),
            Arc::new(TracingNotificationSink),
        ));

        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
    }
}
