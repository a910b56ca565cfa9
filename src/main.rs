use sql_copilot::context::format_context;
use sql_copilot::db::{init_pool, ConnectionHealth, HealthMonitor, PgExecutor, PoolSettings, RetryPolicy};
use sql_copilot::pipeline::{AskRequest, QueryPipeline, SessionState};
use sql_copilot::result_formatter::ResultFormatter;
use sql_copilot::schema::{PgSchemaSource, SchemaCache, SnapshotOptions};
use sql_copilot::synthesis::QuerySynthesizer;
use sql_copilot::{validate, Config, LlmClient, OracleAuthState};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sql-copilot")]
#[command(about = "Answer business questions with safe, read-only SQL against PostgreSQL")]
#[command(version)]
struct Args {
    /// Schema cache file (overrides SCHEMA_CACHE_PATH)
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question in natural language
    Ask {
        question: String,

        /// Extra conversation context passed to the generator
        #[arg(long)]
        context: Option<String>,

        /// Re-introspect the schema before answering
        #[arg(long)]
        refresh: bool,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the cached schema briefing
    Schema {
        /// Re-introspect instead of using the cache
        #[arg(long)]
        refresh: bool,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a statement against the safety validator
    Validate { sql: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(path) = args.cache_path {
        config.schema_cache_path = path;
    }

    match args.command {
        Commands::Validate { sql } => run_validate(&sql),
        Commands::Schema { refresh, json } => run_schema(&config, refresh, json).await,
        Commands::Ask {
            question,
            context,
            refresh,
            json,
        } => run_ask(&config, question, context, refresh, json).await,
    }
}

fn run_validate(sql: &str) -> Result<()> {
    let validated = validate(sql);
    println!("{}", serde_json::to_string_pretty(&validated)?);
    if !validated.is_accepted() {
        std::process::exit(2);
    }
    Ok(())
}

fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy::new(config.retry_max, config.retry_initial_delay, config.retry_max_delay)
}

async fn connect(config: &Config) -> Result<(PgPool, Arc<SchemaCache>)> {
    let url = config.require_database_url()?;
    let settings = PoolSettings {
        min_connections: config.pool_min,
        max_connections: config.pool_max,
        ..PoolSettings::default()
    };
    let pool = init_pool(url, &settings)
        .await
        .context("Failed to connect to the database")?;

    let source = Arc::new(PgSchemaSource::new(pool.clone(), retry_policy(config)));
    let cache = Arc::new(SchemaCache::new(
        source,
        config.schema_cache_path.clone(),
        config.schema_max_age_hours,
        config.introspection_concurrency,
    ));
    Ok((pool, cache))
}

/// Let a background refresh started during this run finish before exiting.
async fn finish_refresh(cache: &SchemaCache) {
    if let Some(handle) = cache.take_refresh_handle().await {
        info!("Waiting for background schema refresh started at {}", handle.started_at());
        if let Err(e) = handle.wait().await {
            warn!("Background schema refresh failed: {}", e);
        }
    }
}

async fn run_schema(config: &Config, refresh: bool, json: bool) -> Result<()> {
    let (_pool, cache) = connect(config).await?;
    let options = if refresh {
        SnapshotOptions::refresh()
    } else {
        SnapshotOptions::default()
    };
    let snapshot = cache.get_snapshot(options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
    } else {
        println!("{}", format_context(&snapshot));
        println!("Cached at {}", snapshot.cached_at.to_rfc3339());
        if !snapshot.is_complete() {
            println!(
                "Incomplete snapshot: {} of {} tables could not be inspected",
                snapshot.failed_tables().len(),
                snapshot.total_tables
            );
        }
    }

    finish_refresh(&cache).await;
    Ok(())
}

async fn run_ask(config: &Config, question: String, context: Option<String>, refresh: bool, json: bool) -> Result<()> {
    let (pool, cache) = connect(config).await?;
    let monitor = HealthMonitor::spawn(pool.clone(), config.health_check_interval);

    let executor = Arc::new(PgExecutor::new(pool, retry_policy(config), config.statement_timeout));
    let synthesizer = LlmClient::from_config(config).map(|client| QuerySynthesizer::new(Arc::new(client)));
    let oracle_auth = if synthesizer.is_some() {
        OracleAuthState::Unknown
    } else {
        warn!("OPENAI_API_KEY not set; only recognized question shapes can be answered");
        OracleAuthState::Rejected
    };

    let options = if refresh {
        SnapshotOptions::refresh()
    } else {
        SnapshotOptions::default()
    };
    let pipeline = QueryPipeline::new(Arc::clone(&cache), synthesizer, executor)
        .with_formatter(ResultFormatter::new(config.briefing_rows, config.chart_max_points))
        .with_snapshot_options(options);

    let state = SessionState {
        connection: monitor.health.borrow().clone(),
        oracle_auth,
    };
    let request = AskRequest { question, context };

    let outcome = tokio::select! {
        outcome = pipeline.ask(&request, state) => outcome,
        message = wait_for_fatal(monitor.health.clone()) => {
            error!("Stopping: database pool failed: {}", message);
            std::process::exit(1);
        }
    };
    monitor.handle.abort();

    let code = match &outcome.result {
        Ok(response) => {
            if json {
                println!("{}", serde_json::to_string_pretty(response)?);
            } else {
                println!("SQL ({:?}):\n{}\n", response.source, response.sql);
                println!("{}", response.briefing);
                if !response.chart_tuples.is_empty() {
                    println!("Chart: {}", serde_json::to_string(&response.chart_tuples)?);
                }
            }
            0
        }
        Err(e) => {
            let report = e.report();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                eprintln!("{}\n{}", report.hint, report.message);
                if let Some(sql) = &report.sql {
                    eprintln!("SQL: {}", sql);
                }
            }
            1
        }
    };
    info!("Session state after request: {:?}", outcome.state);

    finish_refresh(&cache).await;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Resolves once the health monitor reports a fatal pool failure.
async fn wait_for_fatal(mut health: watch::Receiver<ConnectionHealth>) -> String {
    loop {
        if let ConnectionHealth::Fatal { message } = &*health.borrow() {
            return message.clone();
        }
        if health.changed().await.is_err() {
            // Monitor stopped without a fatal state.
            std::future::pending::<()>().await;
        }
    }
}
