use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use logfold::{Config, Engine};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    init_logging();

    if config.test_mode {
        return match logfold::self_check().await {
            Ok(()) => {
                tracing::info!("self-check passed");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "self-check failed");
                ExitCode::FAILURE
            }
        };
    }

    // Guaranteed by the argument parser when test_mode is off.
    let database_url = config
        .database_url
        .as_deref()
        .expect("database_url is required outside test mode");

    let engine = match Engine::open(database_url, config.sendgrid_api_key.as_deref()).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "failed to open engine");
            return ExitCode::FAILURE;
        }
    };

    let mut fatal = engine.handle().fatal_signal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            engine.shutdown().await;
            ExitCode::SUCCESS
        }
        result = fatal.wait_for(|fatal| *fatal) => {
            // Either the watch fired or the coordinator is gone entirely;
            // both mean durability can no longer be guaranteed.
            let _ = result;
            tracing::error!("fatal storage failure, exiting for log recovery");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("logfold=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
