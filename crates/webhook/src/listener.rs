//! Callback endpoint for custom providers.
//!
//! Routes:
//! - `POST /v1/callbacks` accepts a [`ProviderResponse`]
//! - `GET /v1/callbacks/:request_id` shows the bookkeeping for a request
//! - `GET /health`
//!
//! The server runs on a dedicated thread with its own tokio runtime so the
//! engine stays synchronous.

use crate::error::{Error, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use orchestrator::{CallbackGateway, ProviderResponse, Resolution};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Starts the callback HTTP server.
pub struct CallbackListener;

impl CallbackListener {
    /// Bind `addr` and serve callbacks into `gateway` until the handle drops.
    ///
    /// Blocks until the socket is bound, so the returned handle knows the
    /// actual address (useful with port 0).
    pub fn start(addr: SocketAddr, gateway: Arc<CallbackGateway>) -> Result<ListenerHandle> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<SocketAddr>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("strata-callbacks".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Runtime(e)));
                        return;
                    }
                };
                runtime.block_on(serve(addr, gateway, ready_tx, shutdown_rx));
            })
            .map_err(Error::Runtime)?;

        match ready_rx.recv() {
            Ok(Ok(bound)) => {
                log::info!("callback listener on http://{bound}");
                Ok(ListenerHandle {
                    addr: bound,
                    shutdown: Some(shutdown_tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Stopped)
            }
        }
    }
}

async fn serve(
    addr: SocketAddr,
    gateway: Arc<CallbackGateway>,
    ready: mpsc::Sender<Result<SocketAddr>>,
    shutdown: oneshot::Receiver<()>,
) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(source) => {
            let _ = ready.send(Err(Error::Bind { addr, source }));
            return;
        }
    };
    let bound = match listener.local_addr() {
        Ok(bound) => bound,
        Err(source) => {
            let _ = ready.send(Err(Error::Bind { addr, source }));
            return;
        }
    };
    let _ = ready.send(Ok(bound));

    let result = axum::serve(listener, router(gateway))
        .with_graceful_shutdown(async move {
            let _ = shutdown.await;
        })
        .await;
    if let Err(e) = result {
        log::error!("callback listener failed: {e}");
    }
    log::debug!("callback listener on {bound} stopped");
}

fn router(gateway: Arc<CallbackGateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/callbacks", post(receive))
        .route("/v1/callbacks/:request_id", get(lookup))
        .with_state(gateway)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn receive(
    State(gateway): State<Arc<CallbackGateway>>,
    Json(response): Json<ProviderResponse>,
) -> (StatusCode, Json<Value>) {
    match gateway.resolve(&response, Utc::now()) {
        Resolution::Accepted => (
            StatusCode::ACCEPTED,
            Json(json!({ "requestId": response.request_id, "accepted": true })),
        ),
        Resolution::Discarded(reason) => (
            StatusCode::CONFLICT,
            Json(json!({
                "requestId": response.request_id,
                "accepted": false,
                "reason": reason.to_string(),
            })),
        ),
    }
}

async fn lookup(
    State(gateway): State<Arc<CallbackGateway>>,
    Path(request_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match gateway.get(&request_id) {
        Some(callback) => (
            StatusCode::OK,
            Json(serde_json::to_value(callback).unwrap_or(Value::Null)),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "requestId": request_id, "error": "unknown request id" })),
        ),
    }
}

/// A running callback listener. Dropping it stops the server.
pub struct ListenerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Address the server is bound to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL custom providers should post their responses to
    pub fn response_url(&self) -> String {
        format!("http://{}/v1/callbacks", self.addr)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("callback listener thread panicked");
            }
        }
    }
}
