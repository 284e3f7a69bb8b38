//! Loopback listener for the OAuth redirect.
//!
//! One listener per in-flight authorization, bound to `127.0.0.1` on the
//! first free port at or above [`CALLBACK_BASE_PORT`]. It serves a single
//! path and accepts exactly one relevant request: a code+state pair or an
//! `error` redirect. Requests missing both leave it running.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::OAuthError;

/// First port tried for the callback listener.
pub const CALLBACK_BASE_PORT: u16 = 33418;

/// Number of consecutive ports tried.
pub const CALLBACK_PORT_ATTEMPTS: u16 = 100;

/// Path the authorization server redirects to.
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// Redirect URI for a listener on `port`.
pub fn redirect_uri(port: u16) -> String {
    format!("http://127.0.0.1:{port}{CALLBACK_PATH}")
}

/// What the browser brought back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Code { code: String, state: String },
    Error { error: String, description: Option<String> },
}

/// Bind the first free loopback port in `base..base + attempts`.
pub async fn bind_callback_port(base: u16, attempts: u16) -> Result<(TcpListener, u16), OAuthError> {
    let last = base.saturating_add(attempts.saturating_sub(1));
    for port in base..=last {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                return Ok((listener, port));
            }
            Err(e) => tracing::trace!(port, error = %e, "callback port unavailable"),
        }
    }
    Err(OAuthError::NoCallbackPort { first: base, last })
}

// ─── Listener ────────────────────────────────────────────────────────────────

struct ListenerState {
    outcome: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl ListenerState {
    /// Hand over the outcome and stop accepting. `false` if already used.
    fn deliver(&self, outcome: CallbackOutcome) -> bool {
        let sender = self
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(sender) = sender else {
            return false;
        };
        let _ = sender.send(outcome);

        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        true
    }
}

/// A running callback server. Dropping or closing it frees the port.
#[derive(Debug)]
pub struct CallbackListener {
    port: u16,
    task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Serve the callback path on an already-bound listener. The outcome of
    /// the first relevant request is sent on `outcome_tx`.
    pub fn serve(listener: TcpListener, port: u16, outcome_tx: oneshot::Sender<CallbackOutcome>) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = Arc::new(ListenerState {
            outcome: Mutex::new(Some(outcome_tx)),
            shutdown: Mutex::new(Some(shutdown_tx)),
        });

        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(state);

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            match served {
                Ok(()) => tracing::debug!(port, "callback listener stopped"),
                Err(e) => tracing::warn!(port, error = %e, "callback listener failed"),
            }
        });

        tracing::debug!(port, "callback listener started");
        Self {
            port,
            task: Some(task),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop immediately. Any undelivered outcome channel is dropped.
    pub fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Let an already-triggered graceful shutdown run to completion so the
    /// final page reaches the browser.
    pub fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_callback(
    State(state): State<Arc<ListenerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>) {
    let param = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();

    if let Some(error) = param("error") {
        let description = param("error_description");
        let detail = description.clone().unwrap_or_else(|| error.clone());
        if !state.deliver(CallbackOutcome::Error { error, description }) {
            return already_handled();
        }
        return (
            StatusCode::OK,
            page("Authorization failed", &format!("The server reported: {}", escape_html(&detail))),
        );
    }

    let (Some(code), Some(oauth_state)) = (param("code"), param("state")) else {
        return (
            StatusCode::BAD_REQUEST,
            page("Invalid callback", "The request is missing the code or state parameter."),
        );
    };

    if !state.deliver(CallbackOutcome::Code {
        code,
        state: oauth_state,
    }) {
        return already_handled();
    }

    (
        StatusCode::OK,
        page(
            "Authorization received",
            "The application is finishing sign-in and will report the result. You can close this tab.",
        ),
    )
}

fn already_handled() -> (StatusCode, Html<String>) {
    (
        StatusCode::GONE,
        page("Already handled", "This authorization request was already completed."),
    )
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body style=\"font-family:sans-serif;text-align:center;margin-top:4em\">\
         <h1>{title}</h1><p>{body}</p></body></html>"
    ))
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start() -> (CallbackListener, u16, oneshot::Receiver<CallbackOutcome>) {
        // Tests use a range away from the production base to avoid collisions.
        let (listener, port) = bind_callback_port(41800, 100).await.unwrap();
        let (tx, rx) = oneshot::channel();
        (CallbackListener::serve(listener, port, tx), port, rx)
    }

    #[test]
    fn test_redirect_uri_shape() {
        assert_eq!(redirect_uri(33418), "http://127.0.0.1:33418/oauth/callback");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>&\"</b>"), "&lt;b&gt;&amp;&quot;&lt;/b&gt;");
    }

    #[tokio::test]
    async fn test_scan_skips_taken_port() {
        let (first, first_port) = bind_callback_port(41950, 10).await.unwrap();
        let (_second, second_port) = bind_callback_port(first_port, 10).await.unwrap();
        assert!(second_port > first_port);
        drop(first);
    }

    #[tokio::test]
    async fn test_code_and_state_delivered_once() {
        let (_listener, port, rx) = start().await;
        let url = format!("{}?code=abc&state=xyz", redirect_uri(port));

        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.text().await.unwrap().contains("close this tab"));

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::Code {
                code: "abc".into(),
                state: "xyz".into()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_params_do_not_consume() {
        let (_listener, port, rx) = start().await;

        let resp = reqwest::get(format!("{}?code=abc", redirect_uri(port)))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = reqwest::get(format!("{}?error=access_denied", redirect_uri(port)))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.text().await.unwrap().contains("Authorization failed"));

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, CallbackOutcome::Error { ref error, .. } if error == "access_denied"));
    }

    #[tokio::test]
    async fn test_other_paths_not_served() {
        let (_listener, port, _rx) = start().await;
        let resp = reqwest::get(format!("http://127.0.0.1:{port}/favicon.ico"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
