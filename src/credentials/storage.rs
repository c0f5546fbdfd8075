//! SQLite-backed credential and token storage.
//!
//! Client secrets and tokens are sealed with [`SecretBox`] before they reach
//! the database; everything else is stored in the clear.

use super::{CredentialId, CredentialSummary, SecretBox, ServiceCredential, TokenRecord};
use crate::error::{CredvaultError, Result};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE service_credentials (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     service_name TEXT NOT NULL,
///     client_id TEXT NOT NULL,
///     client_secret TEXT NOT NULL,        -- Encrypted
///     client_secret_nonce TEXT NOT NULL,
///     created_at TEXT NOT NULL            -- RFC 3339
/// );
///
/// CREATE TABLE oauth_tokens (
///     credential_id INTEGER PRIMARY KEY
///         REFERENCES service_credentials(id) ON DELETE CASCADE,
///     access_token TEXT NOT NULL,         -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     refresh_token TEXT,                 -- Encrypted (optional)
///     refresh_token_nonce TEXT,
///     expires_at TEXT,
///     obtained_at TEXT NOT NULL,
///     token_type TEXT,
///     scope TEXT,
///     updated_at TEXT NOT NULL
/// );
/// ```
///
/// # Thread Safety
/// The connection sits behind a single mutex, so every read and write is
/// serialized. A token write for one credential can never interleave with a
/// read of the same credential's token.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    secret_box: SecretBox,
}

impl CredentialStore {
    /// Creates or opens a store.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite file (`":memory:"` for an ephemeral store)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let secret_box =
            SecretBox::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS service_credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_name TEXT NOT NULL,
                client_id TEXT NOT NULL,
                client_secret TEXT NOT NULL,
                client_secret_nonce TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS oauth_tokens (
                credential_id INTEGER PRIMARY KEY
                    REFERENCES service_credentials(id) ON DELETE CASCADE,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                expires_at TEXT,
                obtained_at TEXT NOT NULL,
                token_type TEXT,
                scope TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create credential schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            secret_box,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CredvaultError::Storage(anyhow!("credential store lock poisoned")))
    }

    /// Registers a new credential and returns its id.
    ///
    /// The record is committed before this returns. Fails with
    /// [`CredvaultError::Validation`] if any field is empty or whitespace.
    pub fn register(
        &self,
        service_name: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<CredentialId> {
        for (field, value) in [
            ("service_name", service_name),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ] {
            if value.trim().is_empty() {
                return Err(CredvaultError::Validation(format!("{} must not be empty", field)));
            }
        }

        let sealed = self
            .secret_box
            .seal(client_secret)
            .context("Failed to encrypt client secret")?;
        let now = Utc::now().to_rfc3339();

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO service_credentials (
                service_name, client_id, client_secret, client_secret_nonce, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![service_name, client_id, sealed.ciphertext, sealed.nonce, now],
        )
        .context("Failed to insert credential")?;
        let id = conn.last_insert_rowid();

        info!(credential_id = id, service = %service_name, "Registered service credential");
        Ok(id)
    }

    /// Returns every credential, secrets included, ordered by id.
    ///
    /// Internal use only; listings that leave the process go through
    /// [`CredentialStore::list_summaries`].
    pub fn list(&self) -> Result<Vec<ServiceCredential>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, service_name, client_id, client_secret, client_secret_nonce, created_at
                    FROM service_credentials
                    ORDER BY id
                    "#,
                )
                .context("Failed to prepare query")?;

            let rows = stmt
                .query_map([], |row| {
                    Ok(CredentialRow {
                        id: row.get(0)?,
                        service_name: row.get(1)?,
                        client_id: row.get(2)?,
                        client_secret: row.get(3)?,
                        client_secret_nonce: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })
                .context("Failed to execute query")?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("Failed to read results")?;
            rows
        };

        rows.into_iter()
            .map(|row| self.decode_credential(row))
            .collect()
    }

    /// Redacted listing for the UI, ordered by id.
    pub fn list_summaries(&self) -> Result<Vec<CredentialSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT c.id, c.service_name, c.client_id, c.created_at,
                       t.credential_id IS NOT NULL
                FROM service_credentials c
                LEFT JOIN oauth_tokens t ON t.credential_id = c.id
                ORDER BY c.id
                "#,
            )
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, CredentialId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })
            .context("Failed to execute query")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter()
            .map(|(id, service_name, client_id, created_at, has_token)| {
                Ok(CredentialSummary {
                    id,
                    service_name,
                    client_id,
                    has_token,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    /// Looks up one credential. Fails with [`CredvaultError::NotFound`] if absent.
    pub fn get(&self, credential_id: CredentialId) -> Result<ServiceCredential> {
        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT id, service_name, client_id, client_secret, client_secret_nonce, created_at
                FROM service_credentials
                WHERE id = ?1
                "#,
                params![credential_id],
                |row| {
                    Ok(CredentialRow {
                        id: row.get(0)?,
                        service_name: row.get(1)?,
                        client_id: row.get(2)?,
                        client_secret: row.get(3)?,
                        client_secret_nonce: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query credential")?
            .ok_or(CredvaultError::NotFound(credential_id))?;

        self.decode_credential(row)
    }

    /// Deletes a credential and its token record.
    ///
    /// Returns `false` if no such credential existed.
    pub fn delete(&self, credential_id: CredentialId) -> Result<bool> {
        let rows_affected = self
            .conn()?
            .execute(
                "DELETE FROM service_credentials WHERE id = ?1",
                params![credential_id],
            )
            .context("Failed to delete credential")?;

        if rows_affected > 0 {
            info!(credential_id, "Deleted service credential");
        }
        Ok(rows_affected > 0)
    }

    /// Stores the token record for a credential, replacing any previous one.
    ///
    /// The existence check and the upsert run in one transaction, so readers
    /// see either the old record or the new one. Fails with
    /// [`CredvaultError::NotFound`] if the credential does not exist.
    pub fn save_token(&self, credential_id: CredentialId, token: &TokenRecord) -> Result<()> {
        let access = self
            .secret_box
            .seal(&token.access_token)
            .context("Failed to encrypt access token")?;
        let refresh = token
            .refresh_token
            .as_deref()
            .map(|t| self.secret_box.seal(t))
            .transpose()
            .context("Failed to encrypt refresh token")?;
        let (refresh_ciphertext, refresh_nonce) = match refresh {
            Some(sealed) => (Some(sealed.ciphertext), Some(sealed.nonce)),
            None => (None, None),
        };
        let expires_at = token.expires_at.map(|dt| dt.to_rfc3339());
        let obtained_at = token.obtained_at.to_rfc3339();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM service_credentials WHERE id = ?1",
                params![credential_id],
                |_| Ok(()),
            )
            .optional()
            .context("Failed to check credential")?
            .is_some();
        if !exists {
            return Err(CredvaultError::NotFound(credential_id));
        }

        tx.execute(
            r#"
            INSERT INTO oauth_tokens (
                credential_id,
                access_token, access_token_nonce,
                refresh_token, refresh_token_nonce,
                expires_at, obtained_at, token_type, scope, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(credential_id) DO UPDATE SET
                access_token = excluded.access_token,
                access_token_nonce = excluded.access_token_nonce,
                refresh_token = excluded.refresh_token,
                refresh_token_nonce = excluded.refresh_token_nonce,
                expires_at = excluded.expires_at,
                obtained_at = excluded.obtained_at,
                token_type = excluded.token_type,
                scope = excluded.scope,
                updated_at = excluded.updated_at
            "#,
            params![
                credential_id,
                access.ciphertext,
                access.nonce,
                refresh_ciphertext,
                refresh_nonce,
                expires_at,
                obtained_at,
                token.token_type,
                token.scope,
                now,
            ],
        )
        .context("Failed to store token")?;

        tx.commit().context("Failed to commit token")?;

        debug!(
            credential_id,
            has_refresh_token = token.refresh_token.is_some(),
            "Stored token record"
        );
        Ok(())
    }

    /// Returns the token record for a credential, if one has been stored.
    pub fn get_token(&self, credential_id: CredentialId) -> Result<Option<TokenRecord>> {
        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce,
                       expires_at, obtained_at, token_type, scope
                FROM oauth_tokens
                WHERE credential_id = ?1
                "#,
                params![credential_id],
                |row| {
                    Ok(TokenRow {
                        access_token: row.get(0)?,
                        access_token_nonce: row.get(1)?,
                        refresh_token: row.get(2)?,
                        refresh_token_nonce: row.get(3)?,
                        expires_at: row.get(4)?,
                        obtained_at: row.get(5)?,
                        token_type: row.get(6)?,
                        scope: row.get(7)?,
                    })
                },
            )
            .optional()
            .context("Failed to query token")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let access_token = self
            .secret_box
            .open(&row.access_token, &row.access_token_nonce)
            .context("Failed to decrypt access token")?;
        let refresh_token = self
            .secret_box
            .open_optional(row.refresh_token, row.refresh_token_nonce)
            .context("Failed to decrypt refresh token")?;

        Ok(Some(TokenRecord {
            credential_id,
            access_token,
            refresh_token,
            expires_at: row.expires_at.as_deref().map(parse_timestamp).transpose()?,
            obtained_at: parse_timestamp(&row.obtained_at)?,
            token_type: row.token_type,
            scope: row.scope,
        }))
    }

    fn decode_credential(&self, row: CredentialRow) -> Result<ServiceCredential> {
        let client_secret = self
            .secret_box
            .open(&row.client_secret, &row.client_secret_nonce)
            .with_context(|| format!("Failed to decrypt client secret for credential {}", row.id))?;

        Ok(ServiceCredential {
            id: row.id,
            service_name: row.service_name,
            client_id: row.client_id,
            client_secret,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

struct CredentialRow {
    id: CredentialId,
    service_name: String,
    client_id: String,
    client_secret: String,
    client_secret_nonce: String,
    created_at: String,
}

struct TokenRow {
    access_token: String,
    access_token_nonce: String,
    refresh_token: Option<String>,
    refresh_token_nonce: Option<String>,
    expires_at: Option<String>,
    obtained_at: String,
    token_type: Option<String>,
    scope: Option<String>,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Failed to parse timestamp '{}'", value))?;
    Ok(parsed.with_timezone(&Utc))
}
