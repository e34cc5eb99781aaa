use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// The external credential exchange failed.
///
/// These are surfaced to the caller unchanged. Nothing in this crate retries
/// a provider, since that usually means re-prompting for an MFA code.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Credential provider failed: {0}")]
    Failed(String),

    #[error("Failed to run credential command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Credential command `{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Invalid credential output: {0}")]
    InvalidOutput(String),

    #[error("Failed to read MFA code: {0}")]
    MfaPrompt(String),

    #[error("Provider returned credentials for `{returned}` but `{requested}` was requested")]
    IdentityMismatch { requested: String, returned: String },

    #[error("Provider returned credentials expiring at {expires_at}, which is inside the {skew_seconds}s refresh window")]
    InsufficientLifetime {
        expires_at: DateTime<Utc>,
        skew_seconds: u64,
    },
}

/// The persistence layer could not be read or written.
///
/// A missing entry is not an error. A corrupt entry is not an error either;
/// the cache downgrades it to a miss before it reaches this type.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize credential record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Identity must not be empty")]
    EmptyIdentity,

    #[error("Skew of {0}s is out of range")]
    InvalidSkew(u64),
}

/// Maximum length for captured stderr in error messages
const MAX_STDERR_LENGTH: usize = 500;

impl ProviderError {
    /// Build a `CommandFailed`, trimming stderr so a chatty command doesn't
    /// flood the terminal.
    pub fn command_failed(command: &str, status: std::process::ExitStatus, stderr: &[u8]) -> Self {
        let stderr = String::from_utf8_lossy(stderr);
        let stderr = stderr.trim();
        let stderr = if stderr.len() <= MAX_STDERR_LENGTH {
            stderr.to_string()
        } else {
            let mut end = MAX_STDERR_LENGTH;
            while !stderr.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &stderr[..end], stderr.len())
        };

        ProviderError::CommandFailed {
            command: command.to_string(),
            status: status.to_string(),
            stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_command_failed_truncates_stderr() {
        use std::os::unix::process::ExitStatusExt;

        let status = std::process::ExitStatus::from_raw(1 << 8);
        let stderr = "x".repeat(2000);
        let err = ProviderError::command_failed("aws sts", status, stderr.as_bytes());

        match err {
            ProviderError::CommandFailed { stderr, .. } => {
                assert!(stderr.starts_with(&"x".repeat(MAX_STDERR_LENGTH)));
                assert!(stderr.ends_with("(truncated, 2000 total bytes)"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cache_error_is_transparent_for_provider() {
        let err = CacheError::from(ProviderError::Failed("bad MFA code".to_string()));
        assert_eq!(err.to_string(), "Credential provider failed: bad MFA code");
    }
}
