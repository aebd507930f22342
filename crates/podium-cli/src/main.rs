use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use podium_ingest::Orchestrator;
use podium_sources::{load_source_configs, FetcherRegistry};
use podium_store::{
    HttpClientConfig, HttpFetcher, PgStore, PoliteDelay, StoreHandles, POLITE_MIN_INTERVAL,
};
use podium_web::auth::AuthConfig;
use podium_web::AppState;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "podium-cli")]
#[command(about = "Podium speaking-opportunity ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregate ingestion pass across all configured sources.
    Ingest,
    /// Run exactly one source through the same machinery.
    IngestSource { tag: String },
    /// Serve the ingestion HTTP entry points (optionally with a cron
    /// schedule for machine-triggered runs).
    Serve,
}

#[derive(Debug, Clone)]
struct CliConfig {
    database_url: Option<String>,
    sources_file: String,
    user_agent: String,
    http_timeout_secs: u64,
    run_timeout_secs: Option<u64>,
    web_port: u16,
    scheduler_enabled: bool,
    ingest_cron: String,
}

impl CliConfig {
    fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            sources_file: std::env::var("PODIUM_SOURCES_FILE")
                .unwrap_or_else(|_| "sources.yaml".to_string()),
            user_agent: std::env::var("PODIUM_USER_AGENT")
                .unwrap_or_else(|_| "podium-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("PODIUM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            run_timeout_secs: std::env::var("PODIUM_RUN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            web_port: std::env::var("PODIUM_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            scheduler_enabled: std::env::var("PODIUM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("PODIUM_INGEST_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn token_set(var: &str) -> HashSet<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn auth_from_env() -> AuthConfig {
    AuthConfig {
        admin_tokens: token_set("PODIUM_ADMIN_TOKENS"),
        member_tokens: token_set("PODIUM_MEMBER_TOKENS"),
        service_token: std::env::var("PODIUM_SERVICE_TOKEN").ok(),
        internal_secret: std::env::var("PODIUM_INTERNAL_SECRET").ok(),
    }
}

async fn stores_from_config(config: &CliConfig) -> Result<StoreHandles> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.ensure_schema().await.context("preparing schema")?;
            Ok(StoreHandles::postgres(store))
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory store (nothing survives exit)");
            let (stores, _memory) = StoreHandles::memory();
            Ok(stores)
        }
    }
}

async fn orchestrator_from_config(config: &CliConfig) -> Result<Orchestrator> {
    let sources = load_source_configs(&config.sources_file)
        .with_context(|| format!("loading sources from {}", config.sources_file))?;
    let stores = stores_from_config(config).await?;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let delay = PoliteDelay::new(POLITE_MIN_INTERVAL);

    // The relevance scorer is an external collaborator; without one
    // configured the post-run match scan is skipped.
    let mut orchestrator =
        Orchestrator::new(stores, FetcherRegistry::builtin(), sources, http, delay);
    if let Some(secs) = config.run_timeout_secs {
        orchestrator = orchestrator.with_run_timeout(Duration::from_secs(secs));
    }
    Ok(orchestrator)
}

fn report(summary: &podium_ingest::RunSummary) {
    println!(
        "run {}: status={} found={} inserted={} updated={} failed_sources=[{}]",
        summary.run_id,
        summary.status.as_str(),
        summary.totals.found,
        summary.totals.inserted,
        summary.totals.updated,
        summary.failed_sources.join(",")
    );
    for result in &summary.results {
        match &result.error {
            Some(error) => println!("  {}: FAILED ({error})", result.source),
            None => println!(
                "  {}: ok found={} inserted={} updated={}",
                result.source, result.found, result.inserted, result.updated
            ),
        }
    }
}

async fn maybe_start_scheduler(
    config: &CliConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.ingest_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run_all().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    status = summary.status.as_str(),
                    "scheduled ingestion run finished"
                ),
                Err(err) => warn!(error = %err, "scheduled ingestion run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.ingest_cron, "scheduled ingestion enabled");
    Ok(Some(sched))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = CliConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let orchestrator = orchestrator_from_config(&config).await?;
            let summary = orchestrator.run_all().await?;
            report(&summary);
        }
        Commands::IngestSource { tag } => {
            let orchestrator = orchestrator_from_config(&config).await?;
            let summary = orchestrator.run_source(&tag).await?;
            report(&summary);
        }
        Commands::Serve => {
            let orchestrator = Arc::new(orchestrator_from_config(&config).await?);
            let _scheduler = maybe_start_scheduler(&config, orchestrator.clone()).await?;

            let runs = orchestrator.run_log();
            let state = AppState {
                orchestrator,
                runs,
                auth: auth_from_env(),
            };
            podium_web::serve(state, config.web_port).await?;
        }
    }

    Ok(())
}
