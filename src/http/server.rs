//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::middleware::{throttle, Throttle};
use crate::error::{Result, WardenError};
use crate::ratelimit::Signature;

/// State of the admin endpoints.
#[derive(Clone)]
struct AdminState {
    throttle: Arc<Throttle>,
    token: Arc<str>,
}

/// Build the service router.
///
/// Every route except the admin reset endpoint passes through the throttle.
/// The admin endpoint is only mounted when `admin_token` is set, and requires
/// it as a bearer token.
pub fn router(throttle_state: Arc<Throttle>, admin_token: Option<&str>) -> Router {
    let service = Router::new()
        .route("/", any(echo))
        .route("/{*path}", any(echo))
        .layer(axum::middleware::from_fn_with_state(
            throttle_state.clone(),
            throttle,
        ));

    match admin_token.filter(|token| !token.is_empty()) {
        Some(token) => {
            let admin = Router::new()
                .route("/admin/throttle/{signature}", delete(clear_signature))
                .with_state(AdminState {
                    throttle: throttle_state,
                    token: Arc::from(token),
                });
            service.merge(admin)
        }
        None => service,
    }
}

/// Throttled handler answering with what it was asked.
async fn echo(request: Request) -> Json<serde_json::Value> {
    Json(json!({
        "status": 1,
        "method": request.method().as_str(),
        "path": request.uri().path(),
    }))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Administrative reset of one signature's counter and timer.
async fn clear_signature(
    State(admin): State<AdminState>,
    headers: HeaderMap,
    Path(signature): Path<String>,
) -> Response {
    if bearer(&headers) != Some(&*admin.token) {
        warn!("Rejected admin request without a valid token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": 0, "msg": "unauthorized" })),
        )
            .into_response();
    }

    let signature = Signature::from_raw(signature);
    match admin.throttle.limiter().clear(&signature).await {
        Ok(()) => {
            info!(signature = %signature, "Cleared rate limit window");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            warn!(signature = %signature, error = %err, "Failed to clear rate limit window");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": 0, "msg": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// HTTP server for the throttled service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The throttle shared by every request
    throttle: Arc<Throttle>,
    /// Bearer token for the admin endpoint; none disables it
    admin_token: Option<String>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, throttle: Arc<Throttle>) -> Self {
        Self {
            addr,
            throttle,
            admin_token: None,
        }
    }

    /// Enable the admin endpoint behind `token`.
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token;
        self
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            admin = self.admin_token.is_some(),
            "Starting HTTP server with graceful shutdown"
        );

        let app = router(self.throttle, self.admin_token.as_deref());
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            WardenError::Io(e)
        })
    }
}

/// Resolve once the process is asked to stop: Ctrl+C anywhere, SIGTERM on Unix.
///
/// A signal source that cannot be installed is logged and never fires.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = received, "Shutdown requested, draining connections");
}
