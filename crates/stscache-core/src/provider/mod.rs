//! Credential providers.
//!
//! A provider performs the expensive, possibly interactive, exchange that
//! issues a fresh `CredentialBundle`. The cache treats it as opaque and only
//! calls it on a miss.

pub mod command;

pub use command::{CommandProvider, MfaPrompt};

use crate::credentials::CredentialBundle;
use crate::error::ProviderError;

pub trait CredentialProvider {
    /// Obtain freshly issued credentials for `identity`.
    fn fetch(&self, identity: &str) -> Result<CredentialBundle, ProviderError>;
}

impl<F> CredentialProvider for F
where
    F: Fn(&str) -> Result<CredentialBundle, ProviderError>,
{
    fn fetch(&self, identity: &str) -> Result<CredentialBundle, ProviderError> {
        self(identity)
    }
}
