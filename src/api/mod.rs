//! Command surface consumed by the UI layer.
//!
//! [`CredentialApi`] is the in-process command boundary; [`http`] exposes the
//! same commands as JSON over HTTP for UIs that run out of process.
//!
//! Listings never carry client secrets. [`CredentialApi::reveal_client_secret`]
//! is the one path that returns one, and every call to it is logged.

pub mod http;

use crate::credentials::{CredentialId, CredentialStore, CredentialSummary};
use crate::error::{CredvaultError, Result};
use crate::oauth::{FlowEvent, FlowManager, FlowSnapshot, StartedFlow};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub use http::{create_api_router, ApiAppState};

#[derive(Clone)]
pub struct CredentialApi {
    store: Arc<CredentialStore>,
    flows: FlowManager,
}

impl CredentialApi {
    pub fn new(flows: FlowManager) -> Self {
        Self {
            store: flows.store().clone(),
            flows,
        }
    }

    /// Register a credential.
    ///
    /// Fails with [`CredvaultError::Validation`] if any field is empty.
    pub fn add_service_credential(
        &self,
        service_name: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<CredentialId> {
        self.store
            .register(service_name, client_id, client_secret)
            .map_err(|e| e.scrub(client_secret))
    }

    /// All registered credentials, secrets left out
    pub fn get_service_credentials(&self) -> Result<Vec<CredentialSummary>> {
        self.store.list_summaries()
    }

    /// Plaintext client secret of one credential. Audited.
    pub fn reveal_client_secret(&self, credential_id: CredentialId) -> Result<String> {
        let credential = self.store.get(credential_id)?;
        warn!(
            credential_id,
            service_name = %credential.service_name,
            "Client secret revealed"
        );
        Ok(credential.client_secret)
    }

    /// Delete a credential and its token, cancelling any pending flow for it
    pub async fn delete_service_credential(&self, credential_id: CredentialId) -> Result<()> {
        let cancelled_flow = self.flows.cancel_for(credential_id).await;
        if !self.store.delete(credential_id)? {
            return Err(CredvaultError::NotFound(credential_id));
        }
        info!(credential_id, cancelled_flow, "Service credential deleted");
        Ok(())
    }

    /// Start an authorization flow and return the URL to open in the browser.
    ///
    /// Completion is reported through [`Self::subscribe_flow_events`].
    pub async fn start_oauth_flow(&self, credential_id: CredentialId) -> Result<String> {
        Ok(self.begin_oauth_flow(credential_id).await?.authorization_url)
    }

    /// Like [`Self::start_oauth_flow`], also returning the flow id
    pub async fn begin_oauth_flow(&self, credential_id: CredentialId) -> Result<StartedFlow> {
        self.flows.start_flow(credential_id).await
    }

    pub fn get_flow_status(&self, flow_id: &str) -> Option<FlowSnapshot> {
        self.flows.flow_status(flow_id)
    }

    pub fn latest_flow_for(&self, credential_id: CredentialId) -> Option<FlowSnapshot> {
        self.flows.latest_flow_for(credential_id)
    }

    pub fn subscribe_flow_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.flows.subscribe()
    }
}
