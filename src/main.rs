//! Application entry point for the `damwatch` service.
//!
//! Startup sequence:
//! - Load configuration from environment variables or `.env`
//! - Initialize structured logging/tracing
//! - Connect the PostgreSQL pool and create the schema if needed
//! - Build the reading pipeline over the PostgreSQL store
//! - Mount the API routes via the `routes` gateway (EMBP) and serve
//!
//! # Environment Variables
//! See [`damwatch::config::load_from_env`] for the configuration variables.
//! Logging is controlled by `RUST_LOG`, or `AXUM_LOG_LEVEL` (default
//! `debug`) when `RUST_LOG` is unset, plus `AXUM_SPAN_EVENTS` and
//! `FORCE_COLOR`.
use std::{env, io::IsTerminal, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use damwatch::{config, routes, schema, PgStore, ReadingPipeline};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Connecting to database: {}", cfg.masked_db_url());

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .with_context(|| format!("Failed to connect to database '{}'", cfg.masked_db_url()))?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let pipeline = Arc::new(ReadingPipeline::new(store, cfg.engine));
    let app = routes::router(pipeline);

    tracing::info!("Listening on {}", cfg.listen_addr);

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Span events to emit, from `AXUM_SPAN_EVENTS`:
/// `"full"` for ENTER/EXIT/CLOSE with timing, `"enter_exit"` for ENTER and
/// EXIT only, anything else for CLOSE only.
fn span_events_from_env() -> FmtSpan {
    match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    }
}

/// `FORCE_COLOR=1|true|yes` forces colors on, `0|false|no` forces them off,
/// anything else auto-detects a TTY.
fn use_color_from_env() -> bool {
    match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    }
}

/// `RUST_LOG` when set, otherwise `AXUM_LOG_LEVEL` with noisy SQL logging
/// kept at `warn`.
fn env_filter_from_env() -> EnvFilter {
    // ---
    if env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
        Some(level @ ("trace" | "debug" | "info" | "warn" | "error")) => level.to_string(),
        _ => "debug".to_string(),
    };
    EnvFilter::new(format!("{level},sqlx::query=warn"))
}

/// Install the global tracing subscriber.
///
/// Compact formatter with target, file and line numbers. Must run once at
/// startup before any logging macro is invoked.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events_from_env())
        .with_env_filter(env_filter_from_env())
        .with_ansi(use_color_from_env())
        .compact()
        .init();
}
