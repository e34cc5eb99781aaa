use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Reuse MFA-derived short-lived credentials across shell invocations
#[derive(Parser, Debug)]
#[command(name = "stscache")]
#[command(version)]
pub struct Cli {
    /// Cache directory (overrides STSCACHE_CACHE_DIR and the config file)
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print credentials for an identity, refreshing them if needed
    Get {
        identity: String,

        /// Refresh when fewer than this many seconds of validity remain
        #[arg(long, value_name = "SECS")]
        skew: Option<u64>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Process)]
        format: OutputFormat,

        /// Provider command; `{identity}` and `{mfa}` are substituted
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Remove cached credentials for an identity
    Invalidate { identity: String },
    /// List cached identities
    List,
    /// Exit 0 if valid credentials are cached, 1 otherwise. Never prompts.
    Status {
        identity: String,

        #[arg(long, value_name = "SECS")]
        skew: Option<u64>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// AWS `credential_process` JSON
    Process,
    /// Shell `export` statements
    Env,
    /// Cache record JSON
    Json,
}
