//! Authorization flow orchestration.
//!
//! One flow per `start_flow` call:
//!
//! ```text
//! Building ─→ AwaitingRedirect ─→ Exchanging ─→ Completed
//!    │              │    │             │
//!    └──────────────┴────┼─────────────┴──→ Failed(reason)
//!                        └──→ Expired
//! ```
//!
//! `start_flow` returns the authorization URL as soon as the redirect
//! listener is up; the wait for the browser, the code exchange and the token
//! commit run on a spawned task. Outcomes are observable through
//! [`FlowManager::flow_status`] and the [`FlowEvent`] broadcast.
//!
//! At most one flow per credential is pending. Starting another supersedes
//! the old one: its task is aborted and its listener released before the new
//! listener binds. Each credential has its own slot lock; supersession and
//! token commit both run under it, so a superseded flow never writes a token.
//! Flows for different credentials never wait on each other.

use super::exchange::TokenExchanger;
use super::listener::{ListenerConfig, ListenerHandle, PendingRedirect, RedirectListener, RedirectOutcome};
use super::pkce::{constant_time_eq, generate_pkce_pair, random_token};
use super::provider::{AuthorizationRequest, ProviderConfig, ProviderRegistry};
use crate::config::OAuthConfig;
use crate::credentials::{CredentialId, CredentialStore, ServiceCredential, TokenRecord};
use crate::error::{CredvaultError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;


pub type FlowId = String;

/// Capacity of the flow event channel
const EVENT_CAPACITY: usize = 64;

/// Why a flow failed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowFailure {
    /// Redirect state did not match; the code was discarded
    StateMismatch,
    /// Provider redirected with `?error=`
    ProviderDenied {
        error: String,
        description: Option<String>,
    },
    ExchangeRejected { message: String },
    Network { message: String },
    /// A newer flow for the same credential replaced this one
    Superseded,
    /// Cancelled without a replacement (credential deleted)
    Cancelled,
    /// Redirect listener failed to start or stopped before a redirect arrived
    Listener { message: String },
    Storage { message: String },
    /// Redirect handling panicked
    Internal { message: String },
}

impl FlowFailure {
    fn from_exchange_error(err: &CredvaultError) -> Self {
        match err {
            CredvaultError::ExchangeRejected(message) => FlowFailure::ExchangeRejected {
                message: message.clone(),
            },
            CredvaultError::Network(message) => FlowFailure::Network {
                message: message.clone(),
            },
            other => FlowFailure::ExchangeRejected {
                message: other.to_string(),
            },
        }
    }
}

/// Flow state machine position
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlowStatus {
    Building,
    AwaitingRedirect,
    Exchanging,
    Completed,
    Expired,
    Failed { reason: FlowFailure },
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Expired | FlowStatus::Failed { .. }
        )
    }

    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    fn failed(reason: FlowFailure) -> Self {
        FlowStatus::Failed { reason }
    }
}

/// Inspectable view of a flow; holds no secrets
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub flow_id: FlowId,
    pub credential_id: CredentialId,
    pub status: FlowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Published when a flow reaches a terminal status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub flow_id: FlowId,
    pub credential_id: CredentialId,
    pub status: FlowStatus,
}

/// Returned by [`FlowManager::start_flow`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedFlow {
    pub flow_id: FlowId,
    pub authorization_url: String,
}

/// Timing and listener settings for flows
#[derive(Clone, Debug)]
pub struct FlowSettings {
    /// How long a flow waits for the redirect before it expires
    pub flow_timeout: Duration,
    /// How long terminal snapshots are kept
    pub retention: Duration,
    pub listener: ListenerConfig,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from(&OAuthConfig::default())
    }
}

impl From<&OAuthConfig> for FlowSettings {
    fn from(config: &OAuthConfig) -> Self {
        Self {
            flow_timeout: config.flow_timeout(),
            retention: config.flow_retention(),
            listener: ListenerConfig {
                host: config.callback_host.clone(),
                callback_path: config.callback_path.clone(),
            },
        }
    }
}

/// One authorization attempt. Owned by the flow's task; never persisted.
struct AuthorizationFlow {
    flow_id: FlowId,
    credential: ServiceCredential,
    provider: ProviderConfig,
    state: String,
    code_verifier: Option<String>,
    redirect_uri: String,
}

/// Bookkeeping for the pending flow of one credential
struct ActiveFlow {
    flow_id: FlowId,
    listener: ListenerHandle,
    task: JoinHandle<()>,
}

/// A credential's pending flow, if any, behind that credential's own lock
type FlowSlot = Arc<Mutex<Option<ActiveFlow>>>;

/// Orchestrates authorization flows for all credentials
#[derive(Clone)]
pub struct FlowManager {
    store: Arc<CredentialStore>,
    providers: Arc<ProviderRegistry>,
    exchanger: Arc<dyn TokenExchanger>,
    settings: FlowSettings,
    /// credential_id -> slot holding its single pending flow
    active: Arc<DashMap<CredentialId, FlowSlot>>,
    /// flow_id -> snapshot, kept until cleanup after a terminal status
    flows: Arc<DashMap<FlowId, FlowSnapshot>>,
    events: broadcast::Sender<FlowEvent>,
}

impl FlowManager {
    pub fn new(
        store: Arc<CredentialStore>,
        providers: ProviderRegistry,
        exchanger: Arc<dyn TokenExchanger>,
        settings: FlowSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            providers: Arc::new(providers),
            exchanger,
            settings,
            active: Arc::new(DashMap::new()),
            flows: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Start an authorization flow for a credential.
    ///
    /// Returns once the redirect listener is bound; the rest of the flow runs
    /// in the background. Supersedes any pending flow for the same credential.
    ///
    /// # Errors
    /// * [`CredvaultError::NotFound`] - unknown credential
    /// * [`CredvaultError::ProviderNotConfigured`] - no provider for its service name
    /// * [`CredvaultError::Listener`] - the redirect listener could not bind
    pub async fn start_flow(&self, credential_id: CredentialId) -> Result<StartedFlow> {
        let credential = self.store.get(credential_id)?;
        let provider = self
            .providers
            .get(&credential.service_name)
            .ok_or_else(|| CredvaultError::ProviderNotConfigured(credential.service_name.clone()))?;

        let slot = self.slot(credential_id);
        let mut current = slot.lock().await;
        if let Some(previous) = current.take() {
            self.tear_down(credential_id, previous, FlowFailure::Superseded)
                .await;
        }

        let flow_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.flows.insert(
            flow_id.clone(),
            FlowSnapshot {
                flow_id: flow_id.clone(),
                credential_id,
                status: FlowStatus::Building,
                created_at: now,
                updated_at: now,
            },
        );

        let state = random_token(32);
        let pkce = provider.pkce.then(generate_pkce_pair);

        let listener =
            match RedirectListener::start(&self.settings.listener, self.settings.flow_timeout).await
            {
                Ok(listener) => listener,
                Err(e) => {
                    error!(flow_id = %flow_id, credential_id, error = %e, "Failed to start redirect listener");
                    self.record_terminal(
                        &flow_id,
                        credential_id,
                        FlowStatus::failed(FlowFailure::Listener {
                            message: e.to_string(),
                        }),
                    );
                    return Err(e);
                }
            };

        let redirect_uri = listener.redirect_uri().to_string();
        let authorization_url = provider.build_auth_url(&AuthorizationRequest {
            client_id: &credential.client_id,
            redirect_uri: &redirect_uri,
            state: &state,
            code_challenge: pkce.as_ref().map(|p| p.code_challenge.as_str()),
        });

        let flow = AuthorizationFlow {
            flow_id: flow_id.clone(),
            credential,
            provider,
            state,
            code_verifier: pkce.map(|p| p.code_verifier),
            redirect_uri,
        };

        let (pending, listener) = listener.into_parts();
        self.update_status(&flow_id, FlowStatus::AwaitingRedirect);
        let task = tokio::spawn(self.clone().run_flow(Arc::new(flow), pending));
        *current = Some(ActiveFlow {
            flow_id: flow_id.clone(),
            listener,
            task,
        });

        info!(
            flow_id = %flow_id,
            credential_id,
            "Authorization flow awaiting redirect"
        );

        Ok(StartedFlow {
            flow_id,
            authorization_url,
        })
    }

    /// Snapshot of a flow, if it is still retained
    pub fn flow_status(&self, flow_id: &str) -> Option<FlowSnapshot> {
        self.flows.get(flow_id).map(|entry| entry.value().clone())
    }

    /// Most recently started retained flow for a credential
    pub fn latest_flow_for(&self, credential_id: CredentialId) -> Option<FlowSnapshot> {
        self.flows
            .iter()
            .filter(|entry| entry.credential_id == credential_id)
            .max_by_key(|entry| entry.created_at)
            .map(|entry| entry.value().clone())
    }

    /// Receive an event for every flow that reaches a terminal status
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Cancel a credential's pending flow and release its listener.
    ///
    /// Returns whether a flow was pending. The flow ends `Failed(Cancelled)`.
    pub async fn cancel_for(&self, credential_id: CredentialId) -> bool {
        let Some(slot) = self.active.get(&credential_id).map(|s| s.value().clone()) else {
            return false;
        };

        let mut current = slot.lock().await;
        match current.take() {
            Some(active) => {
                self.tear_down(credential_id, active, FlowFailure::Cancelled)
                    .await;
                true
            }
            None => false,
        }
    }

    /// Number of credentials with a pending flow
    pub async fn active_count(&self) -> usize {
        let slots: Vec<FlowSlot> = self.active.iter().map(|s| s.value().clone()).collect();

        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Number of retained flow snapshots (for debugging/monitoring)
    pub fn count(&self) -> usize {
        self.flows.len()
    }

    /// Drop terminal snapshots older than the retention window
    pub fn cleanup_expired(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.settings.retention)
                .unwrap_or_else(|_| chrono::Duration::zero());

        self.flows
            .retain(|_, snapshot| snapshot.status.is_pending() || snapshot.updated_at > cutoff);
    }

    async fn run_flow(self, flow: Arc<AuthorizationFlow>, pending: PendingRedirect) {
        let credential_id = flow.credential.id;

        // Child task: a panic while handling the redirect still ends the flow.
        // Aborting this task drops the set, which aborts the child.
        let mut work = JoinSet::new();
        work.spawn(self.clone().await_redirect(flow.clone(), pending));
        let Some(joined) = work.join_next().await else {
            return;
        };
        let result = joined.unwrap_or_else(|e| {
            error!(
                flow_id = %flow.flow_id,
                credential_id,
                panicked = e.is_panic(),
                "Authorization flow task failed"
            );
            Err(FlowStatus::failed(FlowFailure::Internal {
                message: "redirect handling failed unexpectedly".to_string(),
            }))
        });

        let slot = self.slot(credential_id);
        let mut current = slot.lock().await;
        let is_current = current
            .as_ref()
            .is_some_and(|active| active.flow_id == flow.flow_id);
        if !is_current {
            debug!(flow_id = %flow.flow_id, "Flow no longer current, dropping result");
            return;
        }

        let status = match result {
            Ok(token) => match self.store.save_token(credential_id, &token) {
                Ok(()) => FlowStatus::Completed,
                Err(e) => {
                    let e = e.scrub(&flow.credential.client_secret);
                    error!(flow_id = %flow.flow_id, credential_id, error = %e, "Failed to store token");
                    FlowStatus::failed(FlowFailure::Storage {
                        message: e.to_string(),
                    })
                }
            },
            Err(status) => status,
        };

        *current = None;
        self.record_terminal(&flow.flow_id, credential_id, status);
    }

    /// Wait for the redirect and, for a valid code, exchange it.
    ///
    /// `Err` carries the terminal status the flow ends in.
    async fn await_redirect(
        self,
        flow: Arc<AuthorizationFlow>,
        pending: PendingRedirect,
    ) -> std::result::Result<TokenRecord, FlowStatus> {
        let credential_id = flow.credential.id;

        match pending.outcome().await {
            // A torn-down flow can land here too; run_flow then drops the
            // result since the flow is no longer current
            RedirectOutcome::Cancelled => {
                warn!(
                    flow_id = %flow.flow_id,
                    credential_id,
                    "Redirect listener stopped before a redirect arrived"
                );
                Err(FlowStatus::failed(FlowFailure::Listener {
                    message: "redirect listener stopped unexpectedly".to_string(),
                }))
            }
            RedirectOutcome::TimedOut => {
                info!(flow_id = %flow.flow_id, credential_id, "Authorization flow expired");
                Err(FlowStatus::Expired)
            }
            RedirectOutcome::ReceivedError { error, description } => {
                warn!(
                    flow_id = %flow.flow_id,
                    credential_id,
                    error = %error,
                    "Provider denied authorization"
                );
                Err(FlowStatus::failed(FlowFailure::ProviderDenied { error, description }))
            }
            RedirectOutcome::Received { code, state } => {
                self.exchange(&flow, &code, &state).await
            }
        }
    }

    /// Verify the redirect state and exchange the code.
    ///
    /// `Err` carries the terminal status the flow ends in.
    async fn exchange(
        &self,
        flow: &AuthorizationFlow,
        code: &str,
        state: &str,
    ) -> std::result::Result<TokenRecord, FlowStatus> {
        if !constant_time_eq(state.as_bytes(), flow.state.as_bytes()) {
            warn!(
                flow_id = %flow.flow_id,
                credential_id = flow.credential.id,
                "Redirect state mismatch, discarding authorization code"
            );
            return Err(FlowStatus::failed(FlowFailure::StateMismatch));
        }

        self.update_status(&flow.flow_id, FlowStatus::Exchanging);

        self.exchanger
            .exchange(
                &flow.provider.token_url,
                &flow.credential,
                code,
                &flow.redirect_uri,
                flow.code_verifier.as_deref(),
            )
            .await
            .map_err(|e| {
                let e = e.scrub(&flow.credential.client_secret);
                warn!(
                    flow_id = %flow.flow_id,
                    credential_id = flow.credential.id,
                    error = %e,
                    "Token exchange failed"
                );
                FlowStatus::failed(FlowFailure::from_exchange_error(&e))
            })
    }

    fn slot(&self, credential_id: CredentialId) -> FlowSlot {
        self.active.entry(credential_id).or_default().value().clone()
    }

    /// Stop a pending flow. Caller holds the credential's slot lock.
    async fn tear_down(&self, credential_id: CredentialId, previous: ActiveFlow, reason: FlowFailure) {
        previous.task.abort();
        previous.listener.cancel().await;

        info!(
            flow_id = %previous.flow_id,
            credential_id,
            reason = ?reason,
            "Stopped pending authorization flow"
        );
        self.record_terminal(&previous.flow_id, credential_id, FlowStatus::failed(reason));
    }

    fn update_status(&self, flow_id: &str, status: FlowStatus) {
        if let Some(mut snapshot) = self.flows.get_mut(flow_id) {
            snapshot.status = status;
            snapshot.updated_at = Utc::now();
        }
    }

    fn record_terminal(&self, flow_id: &str, credential_id: CredentialId, status: FlowStatus) {
        self.update_status(flow_id, status.clone());

        match &status {
            FlowStatus::Completed => {
                info!(flow_id = %flow_id, credential_id, "Authorization flow completed")
            }
            other => debug!(flow_id = %flow_id, credential_id, status = ?other, "Authorization flow ended"),
        }

        // No subscribers is fine
        let _ = self.events.send(FlowEvent {
            flow_id: flow_id.to_string(),
            credential_id,
            status,
        });
    }
}

/// Background task to periodically drop old terminal flow snapshots
pub async fn run_flow_cleanup(manager: FlowManager, interval: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        debug!("Flow cleanup complete, {} flows retained", manager.count());
    }
}
