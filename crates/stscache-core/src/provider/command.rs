use std::io::{ErrorKind, Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::CredentialProvider;
use crate::credentials::CredentialBundle;
use crate::error::ProviderError;

/// Placeholder replaced with the identity being refreshed
const IDENTITY_PLACEHOLDER: &str = "{identity}";

/// Placeholder replaced with a freshly prompted MFA code
const MFA_PLACEHOLDER: &str = "{mfa}";

/// Upper bound on stderr kept for error reports. Everything is still
/// forwarded to the terminal.
const MAX_CAPTURED_STDERR: usize = 64 * 1024;

/// Callback used to ask the user for an MFA code. Receives the identity.
pub type MfaPrompt = Box<dyn Fn(&str) -> Result<String, ProviderError>>;

/// Credentials as printed by the AWS CLI (`Credentials` block of an STS
/// response) or by a `credential_process` helper.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandOutput {
    /// `aws sts get-session-token` / `aws sts assume-role`
    Sts {
        #[serde(rename = "Credentials")]
        credentials: RawCredentials,
    },
    /// `credential_process` format (`Version: 1`)
    Process(RawCredentials),
}

/// Provider that runs an external command and reads credentials from its
/// stdout.
///
/// `{identity}` in any argument is replaced with the identity. `{mfa}` is
/// replaced with a code from the MFA prompt, which is only called when the
/// placeholder is present.
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    mfa_prompt: Option<MfaPrompt>,
}

impl CommandProvider {
    pub fn new(argv: Vec<String>) -> Result<Self, ProviderError> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ProviderError::Failed("Credential command is empty".to_string()))?;

        Ok(Self {
            program,
            args: argv.collect(),
            mfa_prompt: None,
        })
    }

    pub fn with_mfa_prompt<F>(mut self, prompt: F) -> Self
    where
        F: Fn(&str) -> Result<String, ProviderError> + 'static,
    {
        self.mfa_prompt = Some(Box::new(prompt));
        self
    }

    pub fn needs_mfa(&self) -> bool {
        self.args.iter().any(|a| a.contains(MFA_PLACEHOLDER))
    }

    /// Command line for logs and errors, with placeholders left unexpanded
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn render_args(&self, identity: &str) -> Result<Vec<String>, ProviderError> {
        let mfa_code = if self.needs_mfa() {
            let prompt = self.mfa_prompt.as_ref().ok_or_else(|| {
                ProviderError::MfaPrompt("command needs {mfa} but no prompt is available".to_string())
            })?;
            let code = prompt(identity)?.trim().to_string();
            if code.is_empty() {
                return Err(ProviderError::MfaPrompt("empty MFA code".to_string()));
            }
            Some(code)
        } else {
            None
        };

        Ok(self
            .args
            .iter()
            .map(|arg| {
                let arg = arg.replace(IDENTITY_PLACEHOLDER, identity);
                match mfa_code {
                    Some(ref code) => arg.replace(MFA_PLACEHOLDER, code),
                    None => arg,
                }
            })
            .collect())
    }
}

impl CredentialProvider for CommandProvider {
    fn fetch(&self, identity: &str) -> Result<CredentialBundle, ProviderError> {
        let args = self.render_args(identity)?;
        let command_line = self.command_line();
        info!(identity, command = %command_line, "Running credential command");

        let spawn_error = |source| ProviderError::Spawn {
            command: command_line.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        // The command may prompt on stderr (e.g. the AWS CLI asking for an
        // MFA code), so it is forwarded while the command runs.
        let stderr = child
            .stderr
            .take()
            .map(|pipe| thread::spawn(move || tee(pipe, std::io::stderr())));

        let output = child.wait_with_output().map_err(spawn_error)?;
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !output.status.success() {
            return Err(ProviderError::command_failed(
                &command_line,
                output.status,
                &stderr,
            ));
        }

        debug!(identity, bytes = output.stdout.len(), "Credential command succeeded");
        parse_output(identity, &output.stdout)
    }
}

/// Copy `from` to `to` as bytes arrive and return what was copied, capped
/// at `MAX_CAPTURED_STDERR`. Write errors on `to` are ignored.
fn tee(mut from: impl Read, mut to: impl Write) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match from.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let _ = to.write_all(&buf[..n]);
                let _ = to.flush();
                let room = MAX_CAPTURED_STDERR.saturating_sub(captured.len());
                captured.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    captured
}

/// Parse STS or `credential_process` JSON into a bundle for `identity`.
pub(crate) fn parse_output(identity: &str, stdout: &[u8]) -> Result<CredentialBundle, ProviderError> {
    let parsed: CommandOutput = serde_json::from_slice(stdout).map_err(|_| {
        ProviderError::InvalidOutput(
            "expected STS `Credentials` or credential_process JSON".to_string(),
        )
    })?;

    let raw = match parsed {
        CommandOutput::Sts { credentials } => credentials,
        CommandOutput::Process(credentials) => credentials,
    };

    let session_token = raw
        .session_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProviderError::InvalidOutput("missing SessionToken".to_string()))?;

    let expiration = raw
        .expiration
        .ok_or_else(|| ProviderError::InvalidOutput("missing Expiration".to_string()))?;
    let expires_at = DateTime::parse_from_rfc3339(&expiration)
        .map_err(|e| ProviderError::InvalidOutput(format!("bad Expiration `{}`: {}", expiration, e)))?
        .with_timezone(&Utc);

    Ok(CredentialBundle::new(
        identity,
        raw.access_key_id,
        raw.secret_access_key,
        session_token,
        expires_at,
    ))
}

// ============================================================================
// Tests
// ============================================================================
