use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vhar_scheduler::{
    CloudSchedulerAdapter, CloudSchedulerConfig, InMemoryScheduler, LocalCronAdapter, SchedulerAdapter,
};
use vhar_storage::{
    postgres, CorrelationEngine, FsBlobStore, InMemoryObservationStore, InMemoryVineyardStore, ObservationStore,
    PgObservationStore, PgVineyardStore, VineyardStore,
};
use vhar_sync::{DataSourceRegistry, HarvesterConfig, HarvesterEnv, ReconcileReport, Reconciler, SchedulerBackend};
use vhar_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "vhar-cli")]
#[command(about = "Vineyard environmental data harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ensure one scheduler job per enabled data source.
    Reconcile {
        /// Exit non-zero when any source could not be reconciled.
        #[arg(long)]
        strict: bool,
    },
    /// Delete the jobs of disabled data sources.
    Prune,
    /// Apply database migrations.
    Migrate,
    /// Reconcile, then serve the HTTP API.
    Serve {
        #[arg(long)]
        skip_reconcile: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env = HarvesterEnv::from_env()?;
    let config = load_config(&env).await?;
    init_tracing(&config.app.log_level);
    let registry = config.registry()?;

    match cli.command.unwrap_or(Commands::Reconcile { strict: false }) {
        Commands::Reconcile { strict } => {
            let adapter = build_adapter(&env).await?;
            if env.scheduler_backend == SchedulerBackend::Local {
                warn!("local cron jobs only live as long as this process; use `serve` to keep them running");
            }
            let report = reconcile(adapter, &config, &registry).await;
            if strict && !report.is_complete() {
                anyhow::bail!("{} data source(s) could not be reconciled", report.failed.len());
            }
        }
        Commands::Prune => {
            let adapter = build_adapter(&env).await?;
            let reconciler = Reconciler::new(adapter, config.scheduler.clone());
            let report = reconciler.prune_disabled(&registry).await;
            println!("pruned={} failed={}", report.pruned.len(), report.failed.len());
            for (source, err) in &report.failed {
                eprintln!("  {source}: {err}");
            }
        }
        Commands::Migrate => {
            let url = env.database_url.as_deref().context("DATABASE_URL is required for migrate")?;
            let pool = postgres::connect(url, 2).await?;
            postgres::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Serve { skip_reconcile } => {
            // Held for the server's lifetime so in-process cron jobs keep firing.
            let _adapter = if skip_reconcile {
                None
            } else {
                let adapter = build_adapter(&env).await?;
                reconcile(Arc::clone(&adapter), &config, &registry).await;
                Some(adapter)
            };
            let state = build_state(&env).await?;
            vhar_web::serve(&env.listen_addr_or(config.app.port), state).await?;
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn load_config(env: &HarvesterEnv) -> Result<HarvesterConfig> {
    if tokio::fs::try_exists(&env.config_path).await.unwrap_or(false) {
        HarvesterConfig::load(&env.config_path).await
    } else {
        eprintln!(
            "config file {} not found; running with no data sources",
            env.config_path.display()
        );
        Ok(HarvesterConfig::default())
    }
}

async fn build_adapter(env: &HarvesterEnv) -> Result<Arc<dyn SchedulerAdapter>> {
    let adapter: Arc<dyn SchedulerAdapter> = match env.scheduler_backend {
        SchedulerBackend::Cloud => {
            let defaults = CloudSchedulerConfig::default();
            Arc::new(
                CloudSchedulerAdapter::new(CloudSchedulerConfig {
                    base_url: env.scheduler_api_base.clone().unwrap_or(defaults.base_url),
                    access_token: env.scheduler_access_token.clone(),
                    timeout: defaults.timeout,
                })
                .context("building hosted scheduler client")?,
            )
        }
        SchedulerBackend::Local => {
            let local = LocalCronAdapter::new().await.context("creating local cron scheduler")?;
            local.start().await.context("starting local cron scheduler")?;
            Arc::new(local)
        }
        SchedulerBackend::Memory => Arc::new(InMemoryScheduler::new()),
    };
    info!(backend = adapter.backend_tag(), "scheduler adapter ready");
    Ok(adapter)
}

/// Logs the outcome; partial failure never stops startup.
async fn reconcile(
    adapter: Arc<dyn SchedulerAdapter>,
    config: &HarvesterConfig,
    registry: &DataSourceRegistry,
) -> ReconcileReport {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let report = Reconciler::new(adapter, config.scheduler.clone())
        .with_parallelism(config.parallelism())
        .with_cancellation(cancel)
        .reconcile_all(registry)
        .await;
    watcher.abort();

    for (source, err) in &report.failed {
        warn!(%source, error = %err, "data source not reconciled");
    }
    info!(
        run_id = %report.run_id,
        succeeded = report.succeeded.len(),
        created = report.created.len(),
        failed = report.failed.len(),
        "reconciliation complete"
    );
    report
}

async fn build_state(env: &HarvesterEnv) -> Result<AppState> {
    let (observations, vineyards): (Arc<dyn ObservationStore>, Arc<dyn VineyardStore>) = match &env.database_url {
        Some(url) => {
            let pool = postgres::connect(url, 10).await?;
            (
                Arc::new(PgObservationStore::new(pool.clone())),
                Arc::new(PgVineyardStore::new(pool)),
            )
        }
        None => {
            warn!("DATABASE_URL not set; observations are kept in memory");
            (
                Arc::new(InMemoryObservationStore::new()),
                Arc::new(InMemoryVineyardStore::new()),
            )
        }
    };
    let engine = Arc::new(CorrelationEngine::new(observations, vineyards));
    let mut blobs = FsBlobStore::new(env.blob_dir.clone());
    if let Some(base) = &env.blob_public_base {
        blobs = blobs.with_public_base(base.clone());
    }
    let blobs = Arc::new(blobs);
    Ok(AppState::new(engine, blobs))
}
