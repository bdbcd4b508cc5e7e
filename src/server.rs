// Server module - HTTP surface of the exporter
//
// Serves the landing page and the telemetry path. Scrapes only gather the
// Prometheus registry; they never wait on the Azion API.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const EXPORTER_DESCRIPTION: &str = "Azion Exporter";

/// State shared by the HTTP handlers
#[derive(Clone)]
pub struct ServerState {
    registry: Registry,
    telemetry_path: Arc<str>,
}

/// Builds the router for `/` and the telemetry path.
pub fn router(registry: Registry, telemetry_path: &str) -> Router {
    let state = ServerState {
        registry,
        telemetry_path: Arc::from(telemetry_path),
    };

    Router::new()
        .route("/", get(landing_page))
        .route(telemetry_path, get(metrics_handler))
        .with_state(state)
}

/// Binds `address` and serves until `cancel` fires.
pub async fn serve(
    address: SocketAddr,
    registry: Registry,
    telemetry_path: &str,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("Listening on {} (telemetry path: {})", address, telemetry_path);

    axum::serve(listener, router(registry, telemetry_path))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn landing_page(State(state): State<ServerState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>{title}</title></head>\n\
         <body>\n\
         <h1>{title}</h1>\n\
         <p>Metrics are available on the path: <a href=\"{path}\">{path}</a></p>\n\
         </body>\n\
         </html>\n",
        title = EXPORTER_DESCRIPTION,
        path = state.telemetry_path,
    ))
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    let encoder = TextEncoder::new();
    let families = state.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}
