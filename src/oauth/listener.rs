//! One-shot local receiver for the authorization-server redirect.
//!
//! Each flow gets its own listener on an ephemeral loopback port. The first
//! callback carrying `code` or `error` resolves the listener; later requests
//! are acknowledged and ignored. The socket is released on every exit path
//! (redirect, timeout, cancellation, handle drop) before the outcome is
//! handed to the waiting flow.

use crate::error::{CredvaultError, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long open connections may linger after shutdown before the server task is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const SUCCESS_HTML: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Authorization complete</title></head>\
<body><h1>Authorization complete</h1><p>You may close this window and return to the application.</p></body></html>";
const ERROR_HTML: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Authorization failed</title></head>\
<body><h1>Authorization failed</h1><p>You may close this window and retry from the application.</p></body></html>";
const DUPLICATE_HTML: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Already received</title></head>\
<body><p>This authorization response was already received. You may close this window.</p></body></html>";

/// How a listener resolved
#[derive(Clone, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// Authorization server redirected with a code
    Received { code: String, state: String },
    /// Authorization server redirected with `?error=`
    ReceivedError {
        error: String,
        description: Option<String>,
    },
    /// No redirect arrived within the timeout
    TimedOut,
    /// The listener was cancelled (flow superseded or handle dropped)
    Cancelled,
}

impl fmt::Debug for RedirectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectOutcome::Received { .. } => f.write_str("Received { .. }"),
            RedirectOutcome::ReceivedError { error, description } => f
                .debug_struct("ReceivedError")
                .field("error", error)
                .field("description", description)
                .finish(),
            RedirectOutcome::TimedOut => f.write_str("TimedOut"),
            RedirectOutcome::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Where the listener binds and which path it serves
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub host: String,
    pub callback_path: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            callback_path: "/callback".to_string(),
        }
    }
}

/// Redirect query parameters
#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Holds the sender for the single outcome this listener will accept
struct CallbackSlot {
    sender: Mutex<Option<oneshot::Sender<RedirectOutcome>>>,
}

impl CallbackSlot {
    fn take(&self) -> Option<oneshot::Sender<RedirectOutcome>> {
        match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Resolves to the listener's outcome once its socket has been released
pub struct PendingRedirect {
    result_rx: oneshot::Receiver<RedirectOutcome>,
}

impl PendingRedirect {
    pub async fn outcome(self) -> RedirectOutcome {
        self.result_rx.await.unwrap_or(RedirectOutcome::Cancelled)
    }
}

#[cfg(test)]
impl PendingRedirect {
    /// A pending redirect whose listener is already gone
    pub(crate) fn detached() -> Self {
        let (_, result_rx) = oneshot::channel();
        Self { result_rx }
    }
}

/// Cancels a listener. Dropping the handle cancels too.
pub struct ListenerHandle {
    port: u16,
    cancel_tx: Option<oneshot::Sender<()>>,
    released_rx: Option<oneshot::Receiver<()>>,
}

impl ListenerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the listener and wait until its port is released.
    ///
    /// Returns immediately if the listener has already resolved.
    pub async fn cancel(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        if let Some(rx) = self.released_rx.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A bound, running redirect listener
pub struct RedirectListener {
    redirect_uri: String,
    pending: PendingRedirect,
    handle: ListenerHandle,
}

impl RedirectListener {
    /// Bind an ephemeral port and start serving the callback path.
    ///
    /// The listener resolves [`RedirectOutcome::TimedOut`] if nothing arrives
    /// within `timeout`.
    pub async fn start(config: &ListenerConfig, timeout: Duration) -> Result<Self> {
        let path = if config.callback_path.starts_with('/') {
            config.callback_path.clone()
        } else {
            format!("/{}", config.callback_path)
        };

        let listener = TcpListener::bind((config.host.as_str(), 0))
            .await
            .map_err(|e| {
                CredvaultError::Listener(format!("failed to bind {}:0: {}", config.host, e))
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| CredvaultError::Listener(format!("local_addr failed: {}", e)))?
            .port();

        let host = if config.host.contains(':') {
            format!("[{}]", config.host)
        } else {
            config.host.clone()
        };
        let redirect_uri = format!("http://{}:{}{}", host, port, path);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let (released_tx, released_rx) = oneshot::channel::<()>();
        let (result_tx, result_rx) = oneshot::channel();

        let app = callback_router(&path, outcome_tx);
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(port, "Redirect listener started");

        tokio::spawn(async move {
            let outcome = tokio::select! {
                received = outcome_rx => received.unwrap_or(RedirectOutcome::Cancelled),
                _ = tokio::time::sleep(timeout) => RedirectOutcome::TimedOut,
                _ = cancel_rx => RedirectOutcome::Cancelled,
            };

            let _ = shutdown_tx.send(());
            release(server).await;
            debug!(port, outcome = ?outcome, "Redirect listener released");

            let _ = released_tx.send(());
            let _ = result_tx.send(outcome);
        });

        Ok(Self {
            redirect_uri,
            pending: PendingRedirect { result_rx },
            handle: ListenerHandle {
                port,
                cancel_tx: Some(cancel_tx),
                released_rx: Some(released_rx),
            },
        })
    }

    /// Callback URI to embed in the authorization URL
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn port(&self) -> u16 {
        self.handle.port
    }

    /// Split into the awaitable outcome and the cancellation handle.
    ///
    /// The handle must be kept alive for as long as the outcome is wanted.
    pub fn into_parts(self) -> (PendingRedirect, ListenerHandle) {
        (self.pending, self.handle)
    }

    /// Wait for the outcome while keeping the listener alive
    pub async fn wait(self) -> RedirectOutcome {
        let (pending, handle) = self.into_parts();
        let outcome = pending.outcome().await;
        drop(handle);
        outcome
    }
}

/// Wait for the server task to finish, aborting it if connections linger
async fn release(mut server: JoinHandle<std::io::Result<()>>) {
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "Redirect listener stopped with error"),
        Ok(Err(e)) => warn!(error = %e, "Redirect listener task failed"),
        Err(_) => {
            warn!("Redirect listener connections lingered past shutdown, aborting");
            server.abort();
            let _ = server.await;
        }
    }
}

fn callback_router(path: &str, sender: oneshot::Sender<RedirectOutcome>) -> Router {
    let slot = Arc::new(CallbackSlot {
        sender: Mutex::new(Some(sender)),
    });
    Router::new()
        .route(path, get(handle_callback))
        .with_state(slot)
}

async fn handle_callback(
    State(slot): State<Arc<CallbackSlot>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let outcome = match (query.code, query.error) {
        (_, Some(error)) => RedirectOutcome::ReceivedError {
            error,
            description: query.error_description,
        },
        (Some(code), None) => RedirectOutcome::Received {
            code,
            state: query.state.unwrap_or_default(),
        },
        (None, None) => {
            debug!("Callback without code or error ignored");
            return (StatusCode::BAD_REQUEST, Html(ERROR_HTML)).into_response();
        }
    };

    let Some(sender) = slot.take() else {
        debug!("Duplicate redirect ignored");
        return (StatusCode::OK, Html(DUPLICATE_HTML)).into_response();
    };

    let is_error = matches!(outcome, RedirectOutcome::ReceivedError { .. });
    let _ = sender.send(outcome);

    if is_error {
        (StatusCode::BAD_REQUEST, Html(ERROR_HTML)).into_response()
    } else {
        (StatusCode::OK, Html(SUCCESS_HTML)).into_response()
    }
}
