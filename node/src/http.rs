use std::sync::Arc;
use std::thread::{self, JoinHandle};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hydra_mesh::wire::JobRequest;
use serde_json::json;
use tracing::{debug, warn};

use crate::kernel::{InjectRequest, Kernel};

/// Running HTTP listener: a dedicated thread owning a current-thread
/// tokio runtime, so the rest of the node stays on plain threads.
pub struct HttpServer {
    port: u16,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HttpServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Bind the propagation surface. The listener is bound synchronously so
/// a taken port fails the node instead of a background thread.
pub fn serve(kernel: Arc<Kernel>, port: u16) -> anyhow::Result<HttpServer> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();
    let app = router(kernel);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = thread::Builder::new()
        .name("http-server".to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("building the HTTP runtime cannot fail");
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener)
                    .expect("converting a bound listener cannot fail");
                let server = axum::serve(listener, app).with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                });
                if let Err(err) = server.await {
                    warn!(error = %err, "HTTP server exited abnormally");
                }
            });
        })
        .expect("spawning the HTTP thread cannot fail");

    Ok(HttpServer {
        port,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// The propagation surface. Responses feed new peers joining the
/// cluster, so `/stream` and `/capability/{id}` carry full genomes
/// while `/capabilities` is the placeholder catalog view.
pub fn router(kernel: Arc<Kernel>) -> Router {
    Router::new()
        .route("/", get(own_source))
        .route("/capabilities", get(capabilities))
        .route("/stream", get(stream_manifests))
        .route("/capability/:id", get(capability))
        .route("/cluster", get(cluster))
        .route("/health", get(health))
        .route("/inject", post(inject))
        .route("/submit", post(submit))
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .with_state(kernel)
}

/// Best-effort quine: the bytes of the running binary, empty when the
/// executable cannot be read back.
async fn own_source() -> Response {
    let bytes = std::env::current_exe()
        .and_then(std::fs::read)
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain")],
        String::from_utf8_lossy(&bytes).into_owned(),
    )
        .into_response()
}

async fn capabilities(State(kernel): State<Arc<Kernel>>) -> Json<Vec<serde_json::Value>> {
    Json(
        kernel
            .registry()
            .all()
            .iter()
            .map(|manifest| manifest.catalog_entry())
            .collect(),
    )
}

async fn stream_manifests(State(kernel): State<Arc<Kernel>>) -> Response {
    let mut body = String::new();
    for manifest in kernel.registry().export() {
        body.push_str(&manifest.to_string());
        body.push('\n');
    }
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from(body),
    )
        .into_response()
}

async fn capability(
    State(kernel): State<Arc<Kernel>>,
    Path(id): Path<String>,
) -> Response {
    match kernel.registry().get(&id) {
        Some(manifest) => Json(manifest).into_response(),
        None => (StatusCode::NOT_FOUND, "capability not found").into_response(),
    }
}

async fn cluster(State(kernel): State<Arc<Kernel>>) -> Json<serde_json::Value> {
    Json(kernel.cluster_status())
}

async fn health(State(kernel): State<Arc<Kernel>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(kernel.hardware()).expect("hardware serializes"))
}

/// Bodies are parsed by hand so every malformed request answers 400
/// with the parse error's text.
async fn inject(State(kernel): State<Arc<Kernel>>, body: String) -> Response {
    let request: InjectRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    match kernel.inject(request) {
        Ok((id, hash)) => Json(json!({ "id": id, "hash": hash })).into_response(),
        Err(err) => {
            debug!(error = %err, "inject rejected");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    }
}

async fn submit(State(kernel): State<Arc<Kernel>>, body: String) -> Response {
    let request: JobRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let job_id = kernel.submit_job(&request.job_type, request.spec, request.id);
    Json(json!({ "job_id": job_id })).into_response()
}
