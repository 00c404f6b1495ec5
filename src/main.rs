use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod aggregator;
mod cache;
mod config;
mod db;
mod error;
mod generator;
mod governor;
mod models;
mod provider;
mod report;
mod service;
mod signals;
mod snapshot;
mod store;
mod validator;

#[cfg(test)]
mod testing;

use crate::aggregator::Aggregator;
use crate::cache::MemoryCache;
use crate::config::AppConfig;
use crate::generator::InsightGenerator;
use crate::governor::Governor;
use crate::provider::OpenAiCompatibleGenerator;
use crate::service::{GenerateRequest, InsightService, ScopeParams};
use crate::snapshot::SnapshotManager;

#[derive(Parser)]
#[command(name = "insight-pipeline")]
#[command(about = "Evidence-grounded learning insights from student activity", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ScopeArgs {
    #[arg(long)]
    student: Uuid,
    #[arg(long)]
    course: Option<Uuid>,
    #[arg(long, default_value = "7d")]
    range: String,
}

impl ScopeArgs {
    fn params(&self) -> ScopeParams {
        ScopeParams {
            student_id: self.student,
            course_id: self.course,
            range: self.range.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a week of demo activity
    Seed,
    /// Import behavior events from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print the activity summary for a student
    Summary {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Recompute even if the stored summary is current
        #[arg(long)]
        refresh: bool,
    },
    /// Generate (or reuse) an insight
    #[command(group(
        ArgGroup::new("trigger")
            .args(["force", "self_trigger"])
            .multiple(false)
    ))]
    Generate {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        self_trigger: bool,
    },
    /// Print the latest insight
    Latest {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Write a markdown report of the latest summary and insight
    Report {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn build_service(config: &AppConfig, pool: sqlx::PgPool) -> anyhow::Result<InsightService> {
    let store = Arc::new(db::PgStore::new(pool));
    let day_offset = config.day_offset()?;

    let provider = OpenAiCompatibleGenerator::new(
        &config.provider.base_url,
        &config.provider.api_key,
        config.provider.timeout(),
    )
    .context("failed to set up the text generation provider")?;

    Ok(InsightService::new(
        SnapshotManager::new(
            store.clone(),
            store.clone(),
            Aggregator::new(day_offset),
            config.aggregation.event_cap,
        ),
        store.clone(),
        InsightGenerator::new(
            Arc::new(provider),
            store.clone(),
            config.provider.model.clone(),
            config.provider.temperature,
        ),
        Governor::new(store, config.quota_policy()?),
        Arc::new(MemoryCache::new()),
        config.latest_ttl(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let inserted = db::seed(&pool).await?;
            println!(
                "Inserted {inserted} events for student {} in course {}.",
                db::SEED_STUDENT,
                db::SEED_COURSE
            );
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} events from {}.", csv.display());
        }
        Commands::Summary { scope, refresh } => {
            let service = build_service(&config, pool)?;
            let snapshot = service.summary(&scope.params(), refresh).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Generate {
            scope,
            model,
            force,
            self_trigger,
        } => {
            let service = build_service(&config, pool)?;
            let response = service
                .generate(&GenerateRequest {
                    scope: scope.params(),
                    model,
                    force,
                    self_trigger,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Latest { scope } => {
            let service = build_service(&config, pool)?;
            match service.get_latest(&scope.params()).await? {
                Some(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                None => println!("No insight yet."),
            }
        }
        Commands::Report { scope, out } => {
            let service = build_service(&config, pool)?;
            let params = scope.params();
            let snapshot = service.summary(&params, false).await?;
            let latest = service.get_latest(&params).await?;
            let report = report::build_report(&snapshot, latest.as_ref());
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
