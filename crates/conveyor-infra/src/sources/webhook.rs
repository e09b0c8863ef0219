//! Webhook event source: a small axum listener that turns matching POST
//! requests into events.
//!
//! When a shared secret is configured, requests must carry
//! `X-Conveyor-Signature: sha256=<hex>` — an HMAC-SHA256 over the raw
//! body, verified in constant time before any event is emitted.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use conveyor_core::event::{EventSource, SourceError};
use conveyor_types::event::{Event, EventPayload};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type HmacSha256 = Hmac<Sha256>;

/// Signature header checked when a secret is configured.
pub const SIGNATURE_HEADER: &str = "x-conveyor-signature";

const DEFAULT_BIND: &str = "127.0.0.1:8787";

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Verify `sha256=<hex>` (or bare hex) HMAC-SHA256 over `body`.
/// Constant-time via the hmac crate's `verify_slice`.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let hex = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Some(expected) = hex_decode(hex) else { return false };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else { return false };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Compute the `sha256=<hex>` signature for a body (used by tests and by
/// callers wiring up senders).
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256={hex}")
}

// ---------------------------------------------------------------------------
// WebhookSource
// ---------------------------------------------------------------------------

struct WebhookShared {
    source_id: String,
    path: String,
    secret: Option<String>,
    tx: mpsc::Sender<Event>,
}

/// Emits a `Webhook` event per authenticated POST to the configured path.
pub struct WebhookSource {
    source_id: String,
    path: String,
    bind: String,
    secret: Option<String>,
}

impl WebhookSource {
    pub fn new(source_id: &str, path: &str, bind: Option<&str>, secret: Option<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            path: path.to_string(),
            bind: bind.unwrap_or(DEFAULT_BIND).to_string(),
            secret,
        }
    }
}

async fn handle_webhook(
    State(shared): State<Arc<WebhookShared>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if uri.path() != shared.path {
        return StatusCode::NOT_FOUND;
    }

    if let Some(secret) = &shared.secret {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret.as_bytes(), &body, provided) {
            tracing::warn!(
                source_id = shared.source_id.as_str(),
                "webhook signature verification failed"
            );
            return StatusCode::UNAUTHORIZED;
        }
    }

    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();
    let parsed = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);

    let event = Event::now(
        &shared.source_id,
        EventPayload::Webhook { path: shared.path.clone(), headers: header_map, body: parsed },
    );
    if shared.tx.send(event).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}

impl EventSource for WebhookSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn run(
        self,
        tx: mpsc::Sender<Event>,
        stop: CancellationToken,
    ) -> Result<(), SourceError> {
        let shared = Arc::new(WebhookShared {
            source_id: self.source_id.clone(),
            path: self.path.clone(),
            secret: self.secret.clone(),
            tx,
        });

        let app = Router::new()
            .route(&self.path, post(handle_webhook))
            .with_state(shared);

        let listener = tokio::net::TcpListener::bind(&self.bind).await.map_err(|e| {
            SourceError::StartFailed {
                source_id: self.source_id.clone(),
                reason: format!("bind {}: {e}", self.bind),
            }
        })?;

        tracing::info!(
            source_id = self.source_id.as_str(),
            bind = self.bind.as_str(),
            path = self.path.as_str(),
            "webhook listener started"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .map_err(|e| SourceError::Stopped {
                source_id: self.source_id.clone(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_roundtrip() {
        let secret = b"shhh";
        let body = br#"{"branch":"main"}"#;
        let signature = sign_body(secret, body);
        assert!(signature.starts_with("sha256="));
        assert!(verify_signature(secret, body, &signature));
        // Bare hex (no prefix) also verifies.
        assert!(verify_signature(secret, body, signature.strip_prefix("sha256=").unwrap()));
    }

    #[test]
    fn test_signature_rejects_tampering() {
        let secret = b"shhh";
        let signature = sign_body(secret, b"original");
        assert!(!verify_signature(secret, b"tampered", &signature));
        assert!(!verify_signature(b"wrong-secret", b"original", &signature));
        assert!(!verify_signature(secret, b"original", "sha256=zznothex"));
        assert!(!verify_signature(secret, b"original", ""));
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex_decode("0aff"), Some(vec![0x0a, 0xff]));
        assert_eq!(hex_decode("0af"), None);
        assert_eq!(hex_decode("zz"), None);
    }

    #[tokio::test]
    async fn test_end_to_end_post_emits_event() {
        let source = WebhookSource::new(
            "hooks",
            "/hooks/test",
            Some("127.0.0.1:0"),
            None,
        );
        // Bind on an ephemeral port by hand so the test knows the address.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let stop = CancellationToken::new();

        let shared = Arc::new(WebhookShared {
            source_id: source.source_id.clone(),
            path: source.path.clone(),
            secret: None,
            tx,
        });
        let app = Router::new()
            .route("/hooks/test", post(handle_webhook))
            .with_state(shared);
        let stop_serve = stop.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop_serve.cancelled().await })
                .await
                .unwrap();
        });

        // Plain TCP client keeps the dev-dependencies surface small.
        let body = r#"{"branch":"main"}"#;
        let request = format!(
            "POST /hooks/test HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes()).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("webhook event")
            .unwrap();
        match event.payload {
            EventPayload::Webhook { path, body, .. } => {
                assert_eq!(path, "/hooks/test");
                assert_eq!(body["branch"], "main");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        stop.cancel();
        server.await.unwrap();
    }
}
