// Error taxonomy
pub mod error;

// Configuration loading
pub mod config;

// Encrypted credential and token storage
pub mod credentials;

// Authorization-code flows
pub mod oauth;

// Command API (in-process and HTTP)
pub mod api;

pub use error::{CredvaultError, Result};
