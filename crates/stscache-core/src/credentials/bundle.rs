use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk record version. Records carrying any other version are
/// treated as cache misses.
pub const RECORD_VERSION: u32 = 1;

/// A set of short-lived credentials for one identity.
///
/// Fields are private so credential material can't be changed after issue;
/// a refresh replaces the whole bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    identity: String,
    access_key: String,
    secret_key: String,
    session_token: String,
    expires_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
}

impl CredentialBundle {
    /// Create a bundle stamped as issued now.
    pub fn new(
        identity: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self::new_at(
            identity,
            access_key,
            secret_key,
            session_token,
            expires_at,
            Utc::now(),
        )
    }

    pub fn new_at(
        identity: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity: identity.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: session_token.into(),
            expires_at,
            issued_at,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Time left before expiry. Negative once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the bundle stays valid for at least `skew` past `now`.
    pub fn is_valid_for(&self, skew: Duration, now: DateTime<Utc>) -> bool {
        self.remaining(now) >= skew
    }

    /// How long ago the bundle was issued, for display
    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = (now - self.issued_at).num_minutes();
        if minutes < 1 {
            // Also covers clock skew between writers
            "just now".to_string()
        } else {
            format!("{} ago", format_minutes(minutes))
        }
    }

    /// Remaining validity for display
    pub fn remaining_display(&self, now: DateTime<Utc>) -> String {
        if self.is_expired(now) {
            return "expired".to_string();
        }
        let minutes = self.remaining(now).num_minutes();
        if minutes < 1 {
            "<1m left".to_string()
        } else {
            format!("{} left", format_minutes(minutes))
        }
    }
}

fn format_minutes(minutes: i64) -> String {
    if minutes < 60 {
        format!("{}m", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        let remaining_mins = minutes % 60;
        if remaining_mins == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h{}m", hours, remaining_mins)
        }
    } else {
        format!("{}d{}h", minutes / 1440, (minutes % 1440) / 60)
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("identity", &self.identity)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Versioned wrapper written to the cache store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub version: u32,
    #[serde(flatten)]
    pub bundle: CredentialBundle,
}

impl StoredRecord {
    pub fn encode(bundle: &CredentialBundle) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&StoredRecord {
            version: RECORD_VERSION,
            bundle: bundle.clone(),
        })
    }

    /// Parse a stored record, rejecting unknown versions.
    pub fn decode(bytes: &[u8]) -> Result<CredentialBundle, String> {
        let record: StoredRecord = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        if record.version != RECORD_VERSION {
            return Err(format!("unsupported record version {}", record.version));
        }
        Ok(record.bundle)
    }
}

// ============================================================================
// Tests
// ============================================================================
