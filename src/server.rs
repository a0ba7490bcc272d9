//! Axum HTTP surface for the SIWA service.
//!
//! `POST /nonce`, `POST /verify`, `GET /session`, `GET /health`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode, header},
    routing::{get, post},
};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::receipt::ReceiptPayload;
use crate::response::SiwaResponse;
use crate::service::{NonceRequest, NonceResponse, SiwaService, VerifyRequest};

/// Alternate header for clients that cannot set `Authorization`.
pub const RECEIPT_HEADER: &str = "x-siwa-receipt";

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    domain: String,
    verification: &'static str,
    nonces: &'static str,
}

pub fn router(service: Arc<SiwaService>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/nonce", post(nonce_handler))
        .route("/verify", post(verify_handler))
        .route("/session", get(session_handler))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(service)
}

/// A server running on a spawned task.
pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningServer {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            tracing::warn!("SIWA server task ended abnormally: {}", e);
        }
    }
}

/// Bind `addr` and serve on a background task. Returns the bound address,
/// which differs from `addr` when port 0 was requested.
pub async fn start_server(
    addr: SocketAddr,
    service: Arc<SiwaService>,
) -> Result<RunningServer, Error> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Server(format!("Failed to bind to {}: {}", addr, e)))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| Error::Server(format!("Failed to get local addr: {}", e)))?;

    let app = router(service);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("SIWA server shutting down");
            })
            .await
        {
            tracing::error!("SIWA server error: {}", e);
        }
    });

    tracing::info!("SIWA server listening on http://{}", bound_addr);
    Ok(RunningServer {
        addr: bound_addr,
        shutdown_tx,
        handle,
    })
}

async fn health_handler(State(service): State<Arc<SiwaService>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        domain: service.domain().to_string(),
        verification: service.mode().as_str(),
        nonces: service.nonce_kind(),
    })
}

async fn nonce_handler(
    State(service): State<Arc<SiwaService>>,
    Json(req): Json<NonceRequest>,
) -> Result<Json<NonceResponse>, (StatusCode, String)> {
    service.request_nonce(req).await.map(Json).map_err(|e| {
        let status = status_from(e.http_status());
        if status.is_server_error() {
            tracing::warn!("Nonce issuance failed: {}", e);
        }
        (status, e.to_string())
    })
}

async fn verify_handler(
    State(service): State<Arc<SiwaService>>,
    Json(req): Json<VerifyRequest>,
) -> Result<(StatusCode, Json<SiwaResponse>), (StatusCode, String)> {
    let response = service.verify(req).await.map_err(|e| {
        tracing::error!("Verification could not complete: {}", e);
        (status_from(e.http_status()), e.to_string())
    })?;
    Ok((status_from(response.http_status()), Json(response)))
}

async fn session_handler(
    State(service): State<Arc<SiwaService>>,
    headers: HeaderMap,
) -> Result<Json<ReceiptPayload>, (StatusCode, String)> {
    let receipt = receipt_from_headers(&headers).ok_or((
        StatusCode::UNAUTHORIZED,
        "missing receipt: send 'Authorization: Bearer <receipt>' or 'X-SIWA-Receipt'".to_string(),
    ))?;
    service
        .validate_receipt(&receipt)
        .map(Json)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))
}

fn receipt_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let explicit = headers
        .get(RECEIPT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    bearer.or(explicit).map(str::to_string)
}

fn status_from(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
