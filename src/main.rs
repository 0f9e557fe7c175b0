//! pglink - Main entry point.
//!
//! Runs a command while holding a PostgreSQL session advisory lock, so that only one copy of a job
//! runs at a time across every host sharing the database.

use pglink::config::{Config, DbConfig};
use pglink::{AdvisoryLock, Context, Db, DbError, DbResult};
use std::process::{ExitCode, ExitStatus};
use tokio::process::Command;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn acquire_lock(db: &Db, config: &Config) -> DbResult<AdvisoryLock> {
    if config.try_lock {
        return db.try_lock(config.lock_id).await;
    }

    match config.wait_timeout_duration() {
        Some(timeout) => {
            let (ctx, _cancel) = Context::with_timeout(&Context::background(), timeout);
            ctx.run(db.lock(config.lock_id)).await
        }
        None => db.lock(config.lock_id).await,
    }
}

async fn run_command(command: &[String]) -> std::io::Result<ExitStatus> {
    let Some((program, args)) = command.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no command given",
        ));
    };

    info!(program = %program, "Running command");
    let mut child = Command::new(program).args(args).kill_on_drop(true).spawn()?;

    tokio::select! {
        status = child.wait() => status,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping command");
            child.kill().await?;
            child.wait().await
        }
    }
}

fn exit_code(status: ExitStatus) -> ExitCode {
    match status.code() {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    info!(
        lock_id = config.lock_id,
        try_lock = config.try_lock,
        "Starting pglink v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db_config = DbConfig::parse(&config.database)?;
    let db = Db::connect_with(&db_config).await?;

    let acquired = tokio::select! {
        result = acquire_lock(&db, &config) => result,
        _ = tokio::signal::ctrl_c() => Err(DbError::Cancelled),
    };

    let lock = match acquired {
        Ok(lock) => lock,
        Err(DbError::Locked { id }) => {
            info!(lock_id = id, "Lock is held elsewhere, skipping command");
            db.shutdown().await;
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => {
            error!(error = %e, lock_id = config.lock_id, "Failed to acquire lock");
            db.shutdown().await;
            return Err(e.into());
        }
    };

    info!(lock_id = lock.id(), "Lock acquired");

    let status = run_command(&config.command).await;
    let released = lock.release().await;
    drop(lock);
    db.shutdown().await;

    let status = status.inspect_err(|e| error!(error = %e, "Failed to run command"))?;
    released?;

    info!(status = %status, "Command finished, lock released");
    Ok(exit_code(status))
}
