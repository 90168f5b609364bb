//! Process configuration, parsed from CLI flags with environment
//! fallbacks.

use clap::Parser;

/// Engine configuration.
///
/// Every option can be supplied as a flag or through the environment
/// variable named next to it.
#[derive(Debug, Clone, Parser)]
#[command(name = "logfold", version, about = "Event-sourced command-processing engine")]
pub struct Config {
    /// Path to the SQLite database backing the log-structured store.
    #[arg(long, env = "DATABASE_URL", required_unless_present = "test_mode")]
    pub database_url: Option<String>,

    /// Enables the outbound email effect when present; without it a
    /// no-op handler is registered and commits have no outbound
    /// consequences.
    #[arg(long, env = "SENDGRID_API_KEY", hide_env_values = true)]
    pub sendgrid_api_key: Option<String>,

    /// Run the built-in self-check and exit (0 on success).
    #[arg(long, env = "TEST_MODE")]
    pub test_mode: bool,
}
