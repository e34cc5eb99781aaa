use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use stscache_core::{
    CommandProvider, CredentialBundle, CredentialCache, CredentialProvider, FileCacheStore,
    ProviderError,
};
use tracing::debug;

use crate::cli::{Cli, Commands, OutputFormat};
use crate::config::Config;
use crate::output;

pub fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load()?;
    let env = |key: &str| std::env::var(key).ok();
    let cache_dir = config.cache_dir(cli.cache_dir.as_deref(), env)?;
    let cache = open_cache(cache_dir);

    match cli.command {
        Commands::Get {
            identity,
            skew,
            format,
            command,
        } => {
            let skew = config.skew(skew, env)?;
            let argv = if command.is_empty() {
                config.provider_command(&identity).map(<[String]>::to_vec)
            } else {
                Some(command)
            };
            get(&cache, &identity, argv, skew, format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Invalidate { identity } => {
            cache.invalidate(&identity)?;
            eprintln!("Invalidated cached credentials for {}", identity);
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            let entries = cache.entries()?;
            println!("{}", output::render_list(&entries, cache.now()));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { identity, skew } => {
            let skew = config.skew(skew, env)?;
            if cache.is_fresh(&identity, skew)? {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

/// The directory is only created once a refresh writes an entry, so `list`
/// and `status` leave the filesystem untouched.
fn open_cache(dir: PathBuf) -> CredentialCache<FileCacheStore> {
    debug!(dir = %dir.display(), "Opening credential cache");
    CredentialCache::new(FileCacheStore::new(dir))
}

fn get(
    cache: &CredentialCache<FileCacheStore>,
    identity: &str,
    argv: Option<Vec<String>>,
    skew: Duration,
    format: OutputFormat,
) -> Result<()> {
    let command = argv
        .map(|argv| CommandProvider::new(argv).map(|p| p.with_mfa_prompt(prompt_mfa)))
        .transpose()?;

    // Only needed on a miss, so a missing command is reported lazily
    let provider = |identity: &str| -> Result<CredentialBundle, ProviderError> {
        match command {
            Some(ref command) => command.fetch(identity),
            None => Err(ProviderError::Failed(format!(
                "no provider command for `{}`; pass one after `--` or add it to `providers` in the config file",
                identity
            ))),
        }
    };

    let bundle = cache
        .get(identity, &provider, skew)
        .with_context(|| format!("Failed to get credentials for {}", identity))?;

    println!("{}", output::render(&bundle, format)?);
    Ok(())
}

/// Read an MFA code from the terminal without echoing it.
fn prompt_mfa(identity: &str) -> Result<String, ProviderError> {
    rpassword::prompt_password(format!("MFA code for {}: ", identity))
        .map_err(|e| ProviderError::MfaPrompt(e.to_string()))
}
