mod aggregator;
mod buffer;
mod capture;
mod chat;
mod coordinator;
mod filter;
mod optimizer;
mod perception;
mod pipeline;
mod sampler;
mod service;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use lifetrace_core::config::{init_logging, AppConfig};
use lifetrace_core::db::DatabaseManager;
use lifetrace_core::llm::LlmManager;
use lifetrace_core::store::{ImageStore, DEFAULT_CACHE_CAPACITY};
use tracing::{info, warn};

use crate::coordinator::{Coordinator, Mode};
use crate::service::SystemService;

#[derive(Parser)]
#[command(name = "lifetrace-daemon", about = "LifeTrace activity-rewind engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the engine (default when no subcommand given)
    Run,
    /// Generate (or regenerate) the diary for a UTC date
    Diary {
        /// Date as YYYY-MM-DD
        date: String,
    },
    /// Soft-delete data older than the retention window
    Cleanup {
        /// Retention in days
        #[arg(long, default_value = "90")]
        days: i64,
        /// Also delete image-store thumbnails older than the window
        #[arg(long)]
        images: bool,
    },
    /// Manage configured LLM models
    Models {
        #[command(subcommand)]
        action: Option<ModelsAction>,
    },
}

#[derive(Subcommand)]
enum ModelsAction {
    /// List configured models
    List,
    /// Run a connectivity test against a model and store the outcome
    Test {
        /// Model id (see `models list`)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon().await,
        Command::Diary { date } => run_diary(&date).await,
        Command::Cleanup { days, images } => run_cleanup(days, images).await,
        Command::Models { action } => run_models(action.unwrap_or(ModelsAction::List)).await,
    }
}

fn build_service(config: AppConfig) -> anyhow::Result<SystemService> {
    let db_path = config.db_path()?;
    let db = Arc::new(DatabaseManager::open(&db_path)?);
    info!(path = %db_path.display(), "database opened");

    let store = Arc::new(ImageStore::new(
        config.screenshot_dir()?,
        DEFAULT_CACHE_CAPACITY,
    ));
    let llm = Arc::new(LlmManager::new(db.clone()));
    let coordinator = Coordinator::new(config.clone(), db.clone(), store.clone(), llm.clone());

    let config_path = AppConfig::config_dir().ok().map(|d| d.join("config.toml"));
    Ok(SystemService::new(
        coordinator, db, store, llm, config, config_path,
    ))
}

async fn run_daemon() -> anyhow::Result<()> {
    init_logging();

    let config = AppConfig::load()?;
    info!(
        capture_interval = config.monitoring.capture_interval,
        processing_interval = config.monitoring.processing_interval,
        "lifetrace-daemon starting"
    );

    let service = build_service(config)?;
    service.system_start().await?;

    let status = service.system_stats();
    if status["coordinator"]["mode"] == serde_json::json!(Mode::RequiresModel) {
        warn!("no usable LLM model configured; capture idle until a model is activated");
    }

    wait_for_shutdown().await;

    service.system_stop().await?;
    info!("lifetrace-daemon stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
    }
}

async fn run_diary(date: &str) -> anyhow::Result<()> {
    init_logging();
    let config = AppConfig::load()?;
    let service = build_service(config)?;

    match service.generate_diary(date).await? {
        Some(diary) => println!("{}", serde_json::to_string_pretty(&diary)?),
        None => println!("no activities recorded on {date}"),
    }
    Ok(())
}

async fn run_cleanup(days: i64, images: bool) -> anyhow::Result<()> {
    init_logging();
    let config = AppConfig::load()?;
    let service = build_service(config)?;

    let touched = service.cleanup_old_data(days).await?;
    println!("soft-deleted {touched} rows older than {days} days");

    if images {
        let removed = service.image_cleanup(days as u64 * 24);
        println!("removed {removed} stale image files");
    }
    Ok(())
}

async fn run_models(action: ModelsAction) -> anyhow::Result<()> {
    init_logging();
    let config = AppConfig::load()?;
    let service = build_service(config)?;

    match action {
        ModelsAction::List => {
            let models = service.list_models().await?;
            if models.is_empty() {
                println!("no models configured");
                return Ok(());
            }
            for model in models {
                println!(
                    "{} {} [{}] {} active={} tested={}",
                    model.id,
                    model.name,
                    model.provider,
                    model.model,
                    model.is_active,
                    model.last_test_status
                );
            }
        }
        ModelsAction::Test { id } => {
            let (ok, error) = service.test_model(&id).await?;
            if ok {
                println!("model {id} reachable");
            } else {
                println!(
                    "model {id} test failed: {}",
                    error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
    }
    Ok(())
}
