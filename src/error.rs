//! Error taxonomy shared by the store, the OAuth flow and the command API.

use crate::credentials::CredentialId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CredvaultError>;

#[derive(Error, Debug)]
pub enum CredvaultError {
    /// Bad input to registration; the user corrects and resubmits.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("credential {0} not found")]
    NotFound(CredentialId),

    #[error("no OAuth provider configured for service '{0}'; add a [providers.{0}] table to the config")]
    ProviderNotConfigured(String),

    #[error("token exchange rejected: {0}")]
    ExchangeRejected(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("redirect listener error: {0}")]
    Listener(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl CredvaultError {
    /// Returns a copy of this error with every occurrence of `secret` masked.
    ///
    /// Applied before an error derived from provider or transport output
    /// leaves the flow.
    pub fn scrub(self, secret: &str) -> Self {
        if secret.is_empty() {
            return self;
        }
        let mask = |s: String| s.replace(secret, "[redacted]");
        match self {
            CredvaultError::ExchangeRejected(msg) => CredvaultError::ExchangeRejected(mask(msg)),
            CredvaultError::Network(msg) => CredvaultError::Network(mask(msg)),
            CredvaultError::Listener(msg) => CredvaultError::Listener(mask(msg)),
            CredvaultError::Validation(msg) => CredvaultError::Validation(mask(msg)),
            CredvaultError::Storage(e) => {
                CredvaultError::Storage(anyhow::anyhow!(mask(format!("{:#}", e))))
            }
            other => other,
        }
    }

    /// Whether a caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CredvaultError::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_masks_secret() {
        let err = CredvaultError::ExchangeRejected("bad client_secret=s3cr3t".to_string());
        let scrubbed = err.scrub("s3cr3t").to_string();
        assert!(!scrubbed.contains("s3cr3t"));
        assert!(scrubbed.contains("[redacted]"));
    }

    #[test]
    fn test_scrub_storage_error() {
        let err = CredvaultError::Storage(anyhow::anyhow!("row for s3cr3t"));
        assert!(!err.scrub("s3cr3t").to_string().contains("s3cr3t"));
    }

    #[test]
    fn test_scrub_ignores_empty_secret() {
        let err = CredvaultError::Network("connection refused".to_string());
        assert_eq!(err.scrub("").to_string(), "network error: connection refused");
    }

    #[test]
    fn test_retryable() {
        assert!(CredvaultError::Network("reset".into()).is_retryable());
        assert!(!CredvaultError::ExchangeRejected("invalid_grant".into()).is_retryable());
        assert!(!CredvaultError::NotFound(7).is_retryable());
    }

    #[test]
    fn test_provider_not_configured_names_config_table() {
        let message = CredvaultError::ProviderNotConfigured("twitch".into()).to_string();
        assert!(message.contains("'twitch'"));
        assert!(message.contains("[providers.twitch]"));
    }
}
