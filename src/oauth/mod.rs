//! OAuth 2.0 authorization-code flows for registered credentials.
//!
//! - `provider`: provider endpoints and authorization URL construction
//! - `pkce`: PKCE (RFC 7636) and random state generation
//! - `listener`: one-shot loopback listener that captures the redirect
//! - `exchange`: code-for-token exchange at the token endpoint
//! - `flow`: orchestration, supersession and flow status tracking

pub mod exchange;
pub mod flow;
pub mod listener;
pub mod pkce;
pub mod provider;

pub use exchange::{HttpTokenExchanger, TokenExchanger};
pub use flow::{
    run_flow_cleanup, FlowEvent, FlowFailure, FlowId, FlowManager, FlowSettings, FlowSnapshot,
    FlowStatus, StartedFlow,
};
pub use listener::{ListenerConfig, RedirectListener, RedirectOutcome};
pub use provider::{ProviderConfig, ProviderRegistry};
