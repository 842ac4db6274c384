//! geocat — CLI entry point for the import pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};

use geocatalog::config::{self, Settings};
use geocatalog::fetch::FetchClient;
use geocatalog::geocode::{GeocodingService, NominatimProvider};
use geocatalog::models::{Frequency, Schedule, ScheduledImport};
use geocatalog::pipeline::Pipeline;
use geocatalog::queue::{JobQueue, TaskHandler, Worker};
use geocatalog::repository::{
    create_pool, init_schema, run_blocking, LocationCacheRepository, ScheduledImportRepository,
    SqlitePool,
};
use geocatalog::scheduler::Scheduler;
use geocatalog::server::{self, AppState};
use geocatalog::storage::BlobStore;

#[derive(Parser)]
#[command(
    name = "geocat",
    about = "Geospatial event catalog import pipeline",
    version
)]
struct Cli {
    /// Override the data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server.
    Serve {
        /// Bind host (defaults to configuration).
        #[arg(long)]
        host: Option<String>,
        /// Bind port (defaults to configuration).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a queue worker.
    Worker {
        /// Drain the queue and exit instead of polling forever.
        #[arg(long)]
        once: bool,
    },
    /// Run the schedule sweeper and stuck-import reaper.
    Scheduler {
        /// Run one sweep and exit.
        #[arg(long)]
        once: bool,
    },
    /// Run one stuck-import reaper pass and exit.
    Reaper,
    /// Import a local file and process it to completion.
    Import {
        /// Path to a CSV or Excel file.
        path: PathBuf,
        /// Catalog to import into.
        #[arg(long)]
        catalog: String,
        /// Target dataset id; inferred from content when omitted.
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Register a recurring fetch of a remote source.
    Schedule {
        /// Display name for the schedule.
        name: String,
        /// Source URL to fetch.
        url: String,
        /// Catalog to import into.
        #[arg(long)]
        catalog: String,
        /// Target dataset id; inferred from content when omitted.
        #[arg(long)]
        dataset: Option<String>,
        /// Cron expression (five-field crontab syntax).
        #[arg(long, conflicts_with = "every")]
        cron: Option<String>,
        /// Named frequency: hourly, daily, weekly or monthly.
        #[arg(long)]
        every: Option<String>,
        /// Owner charged for quota accounting.
        #[arg(long, default_value = "local")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "geocatalog=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = config::load_settings().await;
    if let Some(dir) = cli.data_dir {
        settings = Settings::with_data_dir(dir);
    }
    settings.ensure_directories()?;

    let pool = create_pool(&settings.database_path())?;
    run_blocking(pool.clone(), init_schema).await?;

    let pipeline = Arc::new(build_pipeline(&settings, pool.clone())?);

    match cli.command {
        Command::Serve { host, port } => {
            let state = AppState::new(pipeline, pool);
            let host = host.unwrap_or_else(|| settings.host.clone());
            let port = port.unwrap_or(settings.port);
            server::serve(state, &host, port).await
        }
        Command::Worker { once } => {
            let handler: Arc<dyn TaskHandler> = pipeline;
            let worker = Worker::new(JobQueue::new(pool), handler);
            if once {
                let processed = worker.run_until_idle().await?;
                tracing::info!(processed, "queue drained");
                Ok(())
            } else {
                worker.run_forever().await?;
                Ok(())
            }
        }
        Command::Scheduler { once } => {
            let scheduler = Scheduler::new(
                ScheduledImportRepository::new(pool.clone()),
                JobQueue::new(pool),
            );
            if once {
                scheduler.run_due(Utc::now()).await?;
                let report = scheduler.reap_stuck(Utc::now()).await?;
                tracing::info!(
                    running = report.total_running,
                    reset = report.reset_count,
                    "reaper pass finished"
                );
                return Ok(());
            }
            run_scheduler_loop(&scheduler, &settings).await
        }
        Command::Reaper => {
            let scheduler = Scheduler::new(
                ScheduledImportRepository::new(pool.clone()),
                JobQueue::new(pool),
            );
            let report = scheduler.reap_stuck(Utc::now()).await?;
            tracing::info!(
                running = report.total_running,
                reset = report.reset_count,
                "reaper pass finished"
            );
            Ok(())
        }
        Command::Import {
            path,
            catalog,
            dataset,
        } => {
            let bytes = tokio::fs::read(&path).await?;
            let mime_type = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .essence_str()
                .to_string();
            let filename = path.file_name().and_then(|n| n.to_str());

            let file = pipeline
                .ingest_upload(
                    &catalog,
                    dataset.as_deref(),
                    filename,
                    &mime_type,
                    &bytes,
                    "local",
                )
                .await?;
            tracing::info!(import = %file.id, "file ingested, processing");

            let handler: Arc<dyn TaskHandler> = pipeline.clone();
            let worker = Worker::new(JobQueue::new(pool), handler);
            worker.run_until_idle().await?;

            let file = pipeline
                .files
                .get(&file.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("import record disappeared"))?;
            println!("{} {}", file.id, file.status.as_str());
            if let Some(error) = &file.error {
                println!("error: {}", error);
            }
            Ok(())
        }
        Command::Schedule {
            name,
            url,
            catalog,
            dataset,
            cron,
            every,
            user,
        } => {
            let trigger = match (cron, every) {
                (Some(expression), None) => Schedule::cron(&expression)?,
                (None, Some(every)) => {
                    let frequency = Frequency::from_str(&every).ok_or_else(|| {
                        anyhow::anyhow!("unknown frequency '{}'", every)
                    })?;
                    Schedule::Frequency { frequency }
                }
                _ => anyhow::bail!("exactly one of --cron or --every is required"),
            };
            let mut schedule = ScheduledImport::new(name, url, trigger, catalog, user);
            schedule.dataset_id = dataset;
            pipeline.register_schedule(&schedule).await?;
            println!("{} token {}", schedule.id, schedule.webhook_token);
            Ok(())
        }
    }
}

fn build_pipeline(settings: &Settings, pool: SqlitePool) -> anyhow::Result<Pipeline> {
    let store = BlobStore::new(&settings.data_dir);
    let nominatim = match &settings.nominatim_url {
        Some(url) => NominatimProvider::with_base_url(url)?,
        None => NominatimProvider::new()?,
    };
    let geocoder = GeocodingService::new(
        LocationCacheRepository::new(pool.clone()),
        vec![Arc::new(nominatim)],
    );
    let fetcher = FetchClient::new(Duration::from_secs(settings.fetch_timeout))?;
    Ok(Pipeline::new(pool, store, geocoder, fetcher))
}

async fn run_scheduler_loop(scheduler: &Scheduler, settings: &Settings) -> anyhow::Result<()> {
    let mut sweep = tokio::time::interval(Duration::from_secs(settings.scheduler_interval_secs));
    let mut reap = tokio::time::interval(Duration::from_secs(settings.reaper_interval_secs));
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                if let Err(e) = scheduler.run_due(Utc::now()).await {
                    tracing::error!(error = %e, "schedule sweep failed");
                }
            }
            _ = reap.tick() => {
                if let Err(e) = scheduler.reap_stuck(Utc::now()).await {
                    tracing::error!(error = %e, "reaper pass failed");
                }
            }
        }
    }
}
