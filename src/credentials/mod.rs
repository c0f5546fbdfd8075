//! Encrypted storage for third-party OAuth client credentials and their tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - register / list / get / delete        │
//! │  - one token record per credential       │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!     (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SecretBox                          │
//! │  - AES-256-GCM, nonce per value          │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - client secrets and tokens sealed      │
//! │  - ACID upserts                          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use credvault::credentials::{generate_key, CredentialStore};
//!
//! # fn main() -> credvault::Result<()> {
//! let store = CredentialStore::new("credvault.db", &generate_key())?;
//!
//! let id = store.register("github", "cid123", "secret456")?;
//! for summary in store.list_summaries()? {
//!     println!("{} {} has_token={}", summary.id, summary.service_name, summary.has_token);
//! }
//! assert!(store.get_token(id)?.is_none());
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod storage;

pub use encryption::{generate_key, Sealed, SecretBox};
pub use storage::CredentialStore;

/// Opaque, stable identifier of a registered credential.
pub type CredentialId = i64;

const REDACTED: &str = "[redacted]";

/// A registered third-party OAuth client.
///
/// Immutable once created. `client_secret` is plaintext in memory only; it is
/// sealed at rest and must not cross the API boundary except through the
/// explicit reveal path.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredential {
    pub id: CredentialId,
    pub service_name: String,
    pub client_id: String,
    pub client_secret: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredential")
            .field("id", &self.id)
            .field("service_name", &self.service_name)
            .field("client_id", &self.client_id)
            .field("client_secret", &REDACTED)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Listing view of a credential with the secret left out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub id: CredentialId,
    pub service_name: String,
    pub client_id: String,
    /// Whether a token record is stored for this credential
    pub has_token: bool,
    pub created_at: DateTime<Utc>,
}

/// Tokens obtained by a completed authorization flow.
///
/// One record per credential; a newer successful flow replaces it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub credential_id: CredentialId,

    /// OAuth access token
    pub access_token: String,

    /// OAuth refresh token, if the provider issued one
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    pub expires_at: Option<DateTime<Utc>>,

    /// When the exchange completed
    pub obtained_at: DateTime<Utc>,

    pub token_type: Option<String>,

    /// Space-separated scopes granted by the provider
    pub scope: Option<String>,
}

impl TokenRecord {
    /// Whether the access token has passed its expiry (records without one never expire).
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("credential_id", &self.credential_id)
            .field("access_token", &REDACTED)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| REDACTED))
            .field("expires_at", &self.expires_at)
            .field("obtained_at", &self.obtained_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(expires_at: Option<DateTime<Utc>>) -> TokenRecord {
        TokenRecord {
            credential_id: 1,
            access_token: "tok1".to_string(),
            refresh_token: Some("ref1".to_string()),
            expires_at,
            obtained_at: Utc::now(),
            token_type: Some("Bearer".to_string()),
            scope: None,
        }
    }

    #[test]
    fn test_debug_redacts_client_secret() {
        let credential = ServiceCredential {
            id: 1,
            service_name: "github".to_string(),
            client_id: "cid123".to_string(),
            client_secret: "secret456".to_string(),
            created_at: Utc::now(),
        };

        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("cid123"));
        assert!(!rendered.contains("secret456"));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", token(None));
        assert!(!rendered.contains("tok1"));
        assert!(!rendered.contains("ref1"));
        assert!(rendered.contains("Bearer"));
    }

    #[test]
    fn test_token_expiry() {
        assert!(!token(None).is_expired());
        assert!(!token(Some(Utc::now() + Duration::hours(1))).is_expired());
        assert!(token(Some(Utc::now() - Duration::seconds(1))).is_expired());
    }
}
