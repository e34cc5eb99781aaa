//! Short-lived credential bundles.
//!
//! A `CredentialBundle` is issued by an external provider (an STS exchange,
//! usually behind an MFA prompt) and cached until it expires or is replaced.
//! Bundles are immutable; expiry is checked against a caller-supplied `now`.

pub mod bundle;

pub use bundle::{CredentialBundle, StoredRecord, RECORD_VERSION};
