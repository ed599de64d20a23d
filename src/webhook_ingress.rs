//! HTTP webhook/OAuth ingress (§4.7). Axum router/handler shape grounded on
//! `other_examples/agentsphere-platform`'s `src/api/sessions.rs` (Router +
//! `State<Arc<...>>` + `Json<...>` extractors), an enrichment crate the
//! teacher itself does not depend on but the rest of the pack widely uses.

use crate::config::CoreConfig;
use crate::error::WebhookError;
use crate::model::WebhookEvent;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use lru::LruCache;
use sha2::Sha256;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout, Duration, Instant};
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Dispatch sink the ingress forwards parsed events to. `SessionManager`
/// implements this; kept as a trait so the HTTP layer never imports the
/// manager module directly.
#[async_trait::async_trait]
pub trait EventDispatch: Send + Sync {
    async fn handle_event(&self, event: WebhookEvent) -> anyhow::Result<()>;

    /// Records that an inbound delivery was suppressed as a duplicate, so
    /// `StatusReport.webhook_dedup_hits` reflects dedup activity observed
    /// here rather than only inside the dispatch target.
    fn note_dedup_hit(&self) {}
}

pub struct OAuthCredentials {
    pub access_token: String,
    pub workspace_id: String,
    pub workspace_name: String,
}

struct PendingOAuth {
    expires_at: Instant,
    responder: oneshot::Sender<OAuthCredentials>,
}

struct CsrfState {
    expires_at: Instant,
}

pub struct WebhookIngress {
    config: Arc<CoreConfig>,
    dispatch: Arc<dyn EventDispatch>,
    dedup: Mutex<LruCache<String, Instant>>,
    pending_oauth: Mutex<std::collections::HashMap<String, PendingOAuth>>,
    csrf_states: Mutex<std::collections::HashMap<String, CsrfState>>,
}

impl WebhookIngress {
    pub fn new(config: Arc<CoreConfig>, dispatch: Arc<dyn EventDispatch>) -> Arc<Self> {
        let capacity = NonZeroUsize::new(config.webhook_dedup_capacity.max(1)).unwrap();
        Arc::new(Self {
            config,
            dispatch,
            dedup: Mutex::new(LruCache::new(capacity)),
            pending_oauth: Mutex::new(std::collections::HashMap::new()),
            csrf_states: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/webhook/:tracker", post(handle_webhook))
            .route("/callback", get(handle_oauth_callback))
            .route("/oauth/authorize", get(handle_oauth_authorize))
            .route("/approval", get(handle_approval))
            .with_state(self.clone())
    }

    /// Verifies `X-Signature: sha256=<hex>` against `body` using the
    /// configured secret, constant-time (§4.7, §8 HMAC round-trip law).
    fn verify_signature(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), WebhookError> {
        let header = headers
            .get("X-Signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(WebhookError::InvalidSignature)?;
        let hex_sig = header.strip_prefix("sha256=").ok_or(WebhookError::InvalidSignature)?;
        let expected = hex::decode(hex_sig).map_err(|_| WebhookError::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(self.config.webhook_secret.as_bytes())
            .map_err(|_| WebhookError::InvalidSignature)?;
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| WebhookError::InvalidSignature)
    }

    async fn is_duplicate(&self, event_id: &str) -> bool {
        let mut dedup = self.dedup.lock().await;
        if let Some(seen_at) = dedup.get(event_id) {
            if seen_at.elapsed() < self.config.webhook_dedup_window {
                return true;
            }
        }
        false
    }

    async fn mark_processed(&self, event_id: &str) {
        let mut dedup = self.dedup.lock().await;
        dedup.put(event_id.to_string(), Instant::now());
    }

    pub async fn register_csrf_state(&self) -> String {
        let state = uuid::Uuid::new_v4().to_string();
        let mut states = self.csrf_states.lock().await;
        states.insert(
            state.clone(),
            CsrfState {
                expires_at: Instant::now() + self.config.oauth_state_timeout,
            },
        );
        state
    }

    pub async fn await_oauth_callback(&self, state: String) -> anyhow::Result<OAuthCredentials> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_oauth.lock().await;
            pending.insert(
                state,
                PendingOAuth {
                    expires_at: Instant::now() + self.config.oauth_pending_timeout,
                    responder: tx,
                },
            );
        }
        timeout(self.config.oauth_pending_timeout, rx)
            .await
            .map_err(|_| anyhow::anyhow!("oauth callback timed out"))?
            .map_err(|_| anyhow::anyhow!("oauth callback sender dropped"))
    }
}

async fn handle_webhook(
    axum::extract::Path(tracker): axum::extract::Path<String>,
    State(ingress): State<Arc<WebhookIngress>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Err(e) = ingress.verify_signature(&headers, &body) {
        warn!(tracker, error = %e, "webhook signature verification failed");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(tracker, error = %e, "malformed webhook body");
            return (StatusCode::BAD_REQUEST, "malformed body").into_response();
        }
    };

    let event_id = match parsed.get("id").and_then(|v| v.as_str()) {
        Some(id) => id.to_string(),
        None => return (StatusCode::BAD_REQUEST, "missing id").into_response(),
    };

    if ingress.is_duplicate(&event_id).await {
        info!(event_id, "deduped webhook");
        ingress.dispatch.note_dedup_hit();
        return (StatusCode::OK, "deduped").into_response();
    }

    let event: WebhookEvent = match serde_json::from_value(parsed.get("payload").cloned().unwrap_or_default()) {
        Ok(e) => e,
        Err(e) => {
            warn!(event_id, error = %e, "malformed webhook payload");
            return (StatusCode::BAD_REQUEST, "malformed payload").into_response();
        }
    };

    let dispatched = timeout(ingress.config.webhook_ack_timeout, ingress.dispatch.handle_event(event)).await;

    match dispatched {
        Ok(Ok(())) => {
            ingress.mark_processed(&event_id).await;
            StatusCode::OK.into_response()
        }
        Ok(Err(e)) => {
            warn!(event_id, error = %e, "dispatch failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(_) => {
            warn!(event_id, "dispatch exceeded ack timeout");
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

#[derive(serde::Deserialize)]
struct OAuthCallbackParams {
    code: String,
    state: String,
}

async fn handle_oauth_callback(
    State(ingress): State<Arc<WebhookIngress>>,
    Query(params): Query<OAuthCallbackParams>,
) -> Response {
    let mut states = ingress.csrf_states.lock().await;
    let valid = states
        .remove(&params.state)
        .map(|s| s.expires_at > Instant::now())
        .unwrap_or(false);
    drop(states);

    if !valid {
        return (StatusCode::BAD_REQUEST, "invalid or expired state").into_response();
    }

    let mut pending = ingress.pending_oauth.lock().await;
    let Some(waiter) = pending.remove(&params.state) else {
        return (StatusCode::BAD_REQUEST, "no pending callback for state").into_response();
    };
    if waiter.expires_at <= Instant::now() {
        return (StatusCode::GONE, "pending callback expired").into_response();
    }

    // Exchange `params.code` for credentials happens in the concrete
    // `IssueTracker` implementation; this ingress only correlates state to
    // a waiting caller.
    let _ = waiter.responder.send(OAuthCredentials {
        access_token: params.code,
        workspace_id: String::new(),
        workspace_name: String::new(),
    });

    (StatusCode::OK, "ok").into_response()
}

async fn handle_oauth_authorize(State(ingress): State<Arc<WebhookIngress>>) -> Response {
    let state = ingress.register_csrf_state().await;
    Json(serde_json::json!({ "state": state })).into_response()
}

async fn handle_approval() -> Response {
    StatusCode::NOT_IMPLEMENTED.into_response()
}
