//! OAuth provider configurations.
//!
//! Maps a credential's service name to the provider endpoints used for its
//! authorization flow. A few well-known providers are built in; config can
//! add more or override them.

use crate::config::ProviderSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OAuth provider configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Requested OAuth scopes
    pub scopes: Vec<String>,

    /// Send a PKCE S256 challenge with the authorization request
    pub pkce: bool,

    /// Extra query parameters appended to the authorization URL
    #[serde(default)]
    pub extra_params: Vec<(String, String)>,
}

/// Parameters of one authorization request
pub struct AuthorizationRequest<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub state: &'a str,
    pub code_challenge: Option<&'a str>,
}

impl ProviderConfig {
    /// Build the authorization URL the user opens in the browser
    pub fn build_auth_url(&self, request: &AuthorizationRequest<'_>) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}{}response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.auth_url,
            if self.auth_url.contains('?') { '&' } else { '?' },
            urlencoding::encode(request.client_id),
            urlencoding::encode(request.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(request.state)
        );

        if let Some(challenge) = request.code_challenge {
            url.push_str("&code_challenge=");
            url.push_str(&urlencoding::encode(challenge));
            url.push_str("&code_challenge_method=S256");
        }

        for (key, value) in &self.extra_params {
            url.push('&');
            url.push_str(&urlencoding::encode(key));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }

        url
    }
}

impl From<&ProviderSettings> for ProviderConfig {
    fn from(settings: &ProviderSettings) -> Self {
        Self {
            auth_url: settings.auth_url.clone(),
            token_url: settings.token_url.clone(),
            scopes: settings.scopes.clone(),
            pkce: settings.pkce,
            extra_params: Vec::new(),
        }
    }
}

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

fn google(scopes: &[&str]) -> ProviderConfig {
    ProviderConfig {
        auth_url: GOOGLE_AUTH_URL.to_string(),
        token_url: GOOGLE_TOKEN_URL.to_string(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        pkce: true,
        // Google only issues a refresh token for offline access
        extra_params: vec![
            ("access_type".to_string(), "offline".to_string()),
            ("prompt".to_string(), "consent".to_string()),
        ],
    }
}

/// Get a built-in provider configuration by (lower-case) service name
pub fn builtin_provider(service_name: &str) -> Option<ProviderConfig> {
    let config = match service_name {
        "google" => google(&["openid", "email", "profile"]),
        "youtube" => google(&[
            "https://www.googleapis.com/auth/youtube.readonly",
            "https://www.googleapis.com/auth/userinfo.profile",
        ]),
        "github" => ProviderConfig {
            auth_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            scopes: vec!["repo".to_string(), "read:user".to_string()],
            pkce: true,
            extra_params: Vec::new(),
        },
        "linkedin" => ProviderConfig {
            auth_url: "https://www.linkedin.com/oauth/v2/authorization".to_string(),
            token_url: "https://www.linkedin.com/oauth/v2/accessToken".to_string(),
            scopes: vec!["openid".to_string(), "profile".to_string(), "email".to_string()],
            pkce: false,
            extra_params: Vec::new(),
        },
        _ => return None,
    };
    Some(config)
}

/// Provider lookup by service name (case-insensitive).
///
/// Configured providers shadow built-in ones of the same name.
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    configured: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `[providers.*]` config tables
    pub fn from_settings<'a>(
        settings: impl IntoIterator<Item = (&'a String, &'a ProviderSettings)>,
    ) -> Self {
        let mut registry = Self::new();
        for (name, provider) in settings {
            registry.insert(name, ProviderConfig::from(provider));
        }
        registry
    }

    pub fn insert(&mut self, service_name: &str, config: ProviderConfig) {
        self.configured.insert(normalize(service_name), config);
    }

    pub fn get(&self, service_name: &str) -> Option<ProviderConfig> {
        let key = normalize(service_name);
        self.configured
            .get(&key)
            .cloned()
            .or_else(|| builtin_provider(&key))
    }
}

fn normalize(service_name: &str) -> String {
    service_name.trim().to_lowercase()
}
