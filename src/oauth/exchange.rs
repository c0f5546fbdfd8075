//! OAuth token exchange logic.
//!
//! Exchanges an authorization code for tokens at the provider's token
//! endpoint (RFC 6749 §4.1.3).

use crate::credentials::{ServiceCredential, TokenRecord};
use crate::error::{CredvaultError, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::time::Duration as StdDuration;
use tracing::{debug, trace, warn};

/// Performs the code-for-token exchange.
///
/// The seam exists so flows can be driven against a stub in tests.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Exchange `code` for tokens owned by `credential`.
    ///
    /// # Errors
    /// * [`CredvaultError::ExchangeRejected`] - the provider declined
    /// * [`CredvaultError::Network`] - transport failure
    ///
    /// Returned errors never contain the credential's client secret.
    async fn exchange(
        &self,
        token_url: &str,
        credential: &ServiceCredential,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenRecord>;
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth error response body
#[derive(Deserialize, Debug)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// [`TokenExchanger`] over HTTP.
///
/// Transport failures are retried once after `retry_backoff`; provider
/// rejections are not retried.
#[derive(Clone)]
pub struct HttpTokenExchanger {
    client: reqwest::Client,
    retry_backoff: StdDuration,
}

impl HttpTokenExchanger {
    pub fn new(request_timeout: StdDuration, retry_backoff: StdDuration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CredvaultError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            retry_backoff,
        })
    }

    async fn attempt(
        &self,
        token_url: &str,
        form: &[(&str, &str)],
    ) -> Result<(reqwest::StatusCode, String)> {
        let response = self
            .client
            .post(token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| CredvaultError::Network(describe_transport_error(&e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CredvaultError::Network(describe_transport_error(&e)))?;
        Ok((status, body))
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(
        &self,
        token_url: &str,
        credential: &ServiceCredential,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenRecord> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.as_str()),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        debug!(
            credential_id = credential.id,
            token_url = %token_url,
            "Exchanging authorization code for token"
        );

        let (status, body) = match self.attempt(token_url, &form).await {
            Err(first) if first.is_retryable() => {
                warn!(
                    credential_id = credential.id,
                    error = %first,
                    backoff_ms = self.retry_backoff.as_millis() as u64,
                    "Token exchange transport failure, retrying once"
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(token_url, &form).await
            }
            other => other,
        }
        .map_err(|e| e.scrub(&credential.client_secret))?;

        if !status.is_success() {
            trace!(
                status = %status,
                body = %body.replace(credential.client_secret.as_str(), "[redacted]"),
                "Token endpoint error response"
            );
        }

        let record = parse_token_response(credential, status, &body)
            .map_err(|e| e.scrub(&credential.client_secret))?;

        debug!(
            credential_id = credential.id,
            has_refresh_token = record.refresh_token.is_some(),
            expires_at = ?record.expires_at,
            "Token exchange successful"
        );
        Ok(record)
    }
}

/// Turn a token endpoint response into a [`TokenRecord`].
///
/// Some providers (GitHub) answer 200 with an `error` body, so the body is
/// checked for an error before it is read as tokens.
fn parse_token_response(
    credential: &ServiceCredential,
    status: reqwest::StatusCode,
    body: &str,
) -> Result<TokenRecord> {
    if let Ok(err) = serde_json::from_str::<ErrorResponse>(body) {
        let message = match err.error_description {
            Some(description) => format!("{} ({})", err.error, description),
            None => err.error,
        };
        return Err(CredvaultError::ExchangeRejected(format!(
            "status {}: {}",
            status.as_u16(),
            message
        )));
    }

    if !status.is_success() {
        return Err(CredvaultError::ExchangeRejected(format!(
            "token endpoint returned status {}",
            status
        )));
    }

    let token_response: TokenResponse = serde_json::from_str(body).map_err(|_| {
        CredvaultError::ExchangeRejected("malformed token response".to_string())
    })?;

    let obtained_at = Utc::now();
    // Out-of-range lifetimes are treated as unknown
    let expires_at = token_response
        .expires_in
        .filter(|seconds| *seconds >= 0)
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| obtained_at.checked_add_signed(lifetime));

    Ok(TokenRecord {
        credential_id: credential.id,
        access_token: token_response.access_token,
        refresh_token: token_response.refresh_token,
        expires_at,
        obtained_at,
        token_type: token_response.token_type,
        scope: token_response.scope,
    })
}

/// Describe a reqwest error without its URL (which may carry query secrets)
fn describe_transport_error(error: &reqwest::Error) -> String {
    let kind = if error.is_timeout() {
        "timed out"
    } else if error.is_connect() {
        "connection failed"
    } else if error.is_body() || error.is_decode() {
        "failed to read response"
    } else {
        "request failed"
    };
    format!("token endpoint {}", kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn credential() -> ServiceCredential {
        ServiceCredential {
            id: 7,
            service_name: "github".to_string(),
            client_id: "cid123".to_string(),
            client_secret: "secret456".to_string(),
            created_at: Utc::now(),
        }
    }

    fn exchanger() -> HttpTokenExchanger {
        HttpTokenExchanger::new(StdDuration::from_secs(5), StdDuration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "gho_1234567890",
            "refresh_token": "ghr_0987654321",
            "expires_in": 3600,
            "token_type": "Bearer",
            "scope": "repo"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "gho_1234567890");
        assert_eq!(response.refresh_token, Some("ghr_0987654321".to_string()));
        assert_eq!(response.expires_in, Some(3600));
        assert_eq!(response.token_type, Some("Bearer".to_string()));
        assert_eq!(response.scope, Some("repo".to_string()));
    }

    #[test]
    fn test_token_response_minimal() {
        let record = parse_token_response(
            &credential(),
            reqwest::StatusCode::OK,
            r#"{"access_token": "token_12345"}"#,
        )
        .unwrap();

        assert_eq!(record.credential_id, 7);
        assert_eq!(record.access_token, "token_12345");
        assert!(record.refresh_token.is_none());
        assert!(record.expires_at.is_none());
    }

    #[test]
    fn test_out_of_range_expires_in_is_ignored() {
        for expires_in in ["9223372036854775807", "-60"] {
            let body = format!(r#"{{"access_token":"tok","expires_in":{}}}"#, expires_in);
            let record = parse_token_response(&credential(), reqwest::StatusCode::OK, &body).unwrap();

            assert_eq!(record.access_token, "tok");
            assert!(record.expires_at.is_none());
        }
    }

    #[test]
    fn test_error_body_with_success_status_is_rejected() {
        let result = parse_token_response(
            &credential(),
            reqwest::StatusCode::OK,
            r#"{"error":"bad_verification_code","error_description":"The code passed is incorrect or expired."}"#,
        );

        match result {
            Err(CredvaultError::ExchangeRejected(msg)) => {
                assert!(msg.contains("bad_verification_code"));
            }
            other => panic!("expected ExchangeRejected, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_access_token_is_rejected() {
        let result = parse_token_response(
            &credential(),
            reqwest::StatusCode::OK,
            r#"{"token_type":"Bearer"}"#,
        );
        assert!(matches!(result, Err(CredvaultError::ExchangeRejected(_))));
    }

    #[tokio::test]
    async fn test_exchange_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_header("accept", "application/json")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "authcode1".into()),
                Matcher::UrlEncoded("client_id".into(), "cid123".into()),
                Matcher::UrlEncoded("client_secret".into(), "secret456".into()),
                Matcher::UrlEncoded("redirect_uri".into(), "http://127.0.0.1:1/callback".into()),
                Matcher::UrlEncoded("code_verifier".into(), "verifier".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok1","refresh_token":"ref1","expires_in":3600}"#)
            .create_async()
            .await;

        let before = Utc::now();
        let record = exchanger()
            .exchange(
                &format!("{}/token", server.url()),
                &credential(),
                "authcode1",
                "http://127.0.0.1:1/callback",
                Some("verifier"),
            )
            .await
            .unwrap();

        assert_eq!(record.access_token, "tok1");
        assert_eq!(record.refresh_token.as_deref(), Some("ref1"));
        let expires_at = record.expires_at.unwrap();
        assert!(expires_at >= before + Duration::seconds(3600));
        assert!(expires_at <= Utc::now() + Duration::seconds(3600));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_rejected_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"client secret456 rejected"}"#)
            .expect(1)
            .create_async()
            .await;

        let result = exchanger()
            .exchange(
                &format!("{}/token", server.url()),
                &credential(),
                "authcode1",
                "http://127.0.0.1:1/callback",
                None,
            )
            .await;

        match result {
            Err(CredvaultError::ExchangeRejected(msg)) => {
                assert!(msg.contains("invalid_grant"));
                assert!(!msg.contains("secret456"));
            }
            other => panic!("expected ExchangeRejected, got {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_json_failure_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(503)
            .with_body("<html>down</html>")
            .create_async()
            .await;

        let result = exchanger()
            .exchange(
                &format!("{}/token", server.url()),
                &credential(),
                "authcode1",
                "http://127.0.0.1:1/callback",
                None,
            )
            .await;

        match result {
            Err(CredvaultError::ExchangeRejected(msg)) => assert!(!msg.contains("<html>")),
            other => panic!("expected ExchangeRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_network_error_after_one_retry() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let started = std::time::Instant::now();
        let result = HttpTokenExchanger::new(StdDuration::from_secs(2), StdDuration::from_millis(200))
            .unwrap()
            .exchange(
                &format!("http://127.0.0.1:{}/token", port),
                &credential(),
                "authcode1",
                "http://127.0.0.1:1/callback",
                None,
            )
            .await;

        match result {
            Err(err @ CredvaultError::Network(_)) => {
                assert!(err.is_retryable());
                assert!(!err.to_string().contains("secret456"));
            }
            other => panic!("expected Network, got {:?}", other),
        }
        // The backoff ran exactly once before the second attempt
        assert!(started.elapsed() >= StdDuration::from_millis(200));
    }
}
