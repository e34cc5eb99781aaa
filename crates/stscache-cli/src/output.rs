use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use stscache_core::credentials::StoredRecord;
use stscache_core::CredentialBundle;

use crate::cli::OutputFormat;

/// AWS `credential_process` output. Version 1 is the only one defined.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessCredentials<'a> {
    version: u8,
    access_key_id: &'a str,
    secret_access_key: &'a str,
    session_token: &'a str,
    expiration: String,
}

pub fn render(bundle: &CredentialBundle, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Process => {
            let creds = ProcessCredentials {
                version: 1,
                access_key_id: bundle.access_key(),
                secret_access_key: bundle.secret_key(),
                session_token: bundle.session_token(),
                expiration: rfc3339(bundle.expires_at()),
            };
            Ok(serde_json::to_string_pretty(&creds)?)
        }
        OutputFormat::Env => Ok([
            ("AWS_ACCESS_KEY_ID", bundle.access_key().to_string()),
            ("AWS_SECRET_ACCESS_KEY", bundle.secret_key().to_string()),
            ("AWS_SESSION_TOKEN", bundle.session_token().to_string()),
            ("AWS_CREDENTIAL_EXPIRATION", rfc3339(bundle.expires_at())),
        ]
        .iter()
        .map(|(name, value)| format!("export {}={}", name, shell_quote(value)))
        .collect::<Vec<_>>()
        .join("\n")),
        OutputFormat::Json => Ok(String::from_utf8(StoredRecord::encode(bundle)?)?),
    }
}

/// One line per cached bundle: identity, issue age, remaining validity.
pub fn render_list(bundles: &[CredentialBundle], now: DateTime<Utc>) -> String {
    if bundles.is_empty() {
        return "No cached credentials".to_string();
    }

    let width = bundles
        .iter()
        .map(|b| b.identity().len())
        .max()
        .unwrap_or(0)
        .max("IDENTITY".len());

    let mut lines = vec![format!("{:<width$}  {:<10}  {}", "IDENTITY", "ISSUED", "EXPIRES")];
    lines.extend(bundles.iter().map(|b| {
        format!(
            "{:<width$}  {:<10}  {}",
            b.identity(),
            b.age_display(now),
            b.remaining_display(now)
        )
    }));
    lines.join("\n")
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
