//! Public frontend of the emulator: accepts Lambda `Invoke` requests,
//! admits them into the bounded queue, and writes whatever terminal
//! response arrives on the invocation's reply carrier.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::post;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crie_common::{Config, IntakeQueue, Invocation, OfferError, Response};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("server bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    cfg: Arc<Config>,
    queue: IntakeQueue,
}

pub fn create_app(cfg: Arc<Config>, queue: IntakeQueue) -> Router {
    let route = format!("/2015-03-31/functions/{}/invocations", cfg.lambda_name);
    Router::new()
        .route(&route, post(invoke))
        .with_state(AppState { cfg, queue })
}

/// Binds the frontend and serves until the shutdown token fires; the
/// graceful phase afterwards is bounded by the configured server shutdown
/// timeout.
pub async fn serve(
    cfg: Arc<Config>,
    queue: IntakeQueue,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let addr = cfg.server_address.bind_addr();
    let listener = TcpListener::bind(addr.as_str())
        .await
        .map_err(|e| GatewayError::Bind {
            addr: addr.clone(),
            source: e,
        })?;
    info!(%addr, lambda = %cfg.lambda_name, "server listening");

    use std::future::IntoFuture;
    let graceful = axum::serve(listener, create_app(Arc::clone(&cfg), queue))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    tokio::select! {
        result = graceful => result.map_err(GatewayError::Serve),
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(cfg.server_shutdown_timeout).await;
        } => {
            warn!("server graceful shutdown timed out, closing remaining connections");
            Ok(())
        }
    }
}

/// The single public route. The frontend is the sole author of the
/// client-facing response; every path below writes exactly one.
async fn invoke(State(state): State<AppState>, request: Request) -> HttpResponse {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "cannot read invocation body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (inv, reply) = Invocation::new(body, parts.headers);
    let id = inv.id;
    let is_event = inv.is_event();

    if let Err(refused) = state.queue.offer(inv, state.cfg.wait_for_queue_capacity).await {
        return match refused {
            OfferError::Full(_) => {
                warn!(invocation = %id, "invocation queue is full");
                into_http(Response::message(
                    StatusCode::TOO_MANY_REQUESTS,
                    format!("invocation queue is full: {id}"),
                ))
            }
            OfferError::Closed(_) => {
                warn!(invocation = %id, "invocation rejected, queue is closed");
                into_http(Response::message(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server shutdown",
                ))
            }
        };
    }

    if is_event {
        // The client is gone after the 202, but the reply carrier still
        // has to be drained so the worker handoff completes normally.
        tokio::spawn(async move {
            match reply.await {
                Ok(response) => {
                    debug!(invocation = %id, status = %response.status, "event invocation finished")
                }
                Err(_) => warn!(invocation = %id, "event invocation reply closed unexpectedly"),
            }
        });
        return StatusCode::ACCEPTED.into_response();
    }

    let deadline = state.cfg.lambda_runtime_deadline;
    let mut reply = reply;
    tokio::select! {
        result = &mut reply => match result {
            Ok(response) => {
                if let Some(error) = &response.error {
                    warn!(invocation = %id, error = %error, "invocation failed");
                }
                into_http(response)
            }
            Err(_) => {
                error!(invocation = %id, "reply carrier closed without a response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        _ = tokio::time::sleep(deadline) => {
            // A producer may still be about to write; drain detached
            // rather than closing the carrier from this side.
            tokio::spawn(async move {
                if let Ok(response) = reply.await {
                    debug!(invocation = %id, status = %response.status, "late reply drained");
                }
            });
            warn!(invocation = %id, deadline = ?deadline, "lambda timeout");
            into_http(Response::message(
                StatusCode::BAD_GATEWAY,
                format!("lambda timeout after {}", humantime::format_duration(deadline)),
            ))
        }
    }
}

/// Writes a terminal [`Response`] back to the client, replacing any
/// existing header values key by key before adding the new ones.
fn into_http(response: Response) -> HttpResponse {
    let mut http = HttpResponse::new(Body::from(response.body));
    *http.status_mut() = response.status;
    let headers = http.headers_mut();
    for key in response.headers.keys() {
        headers.remove(key);
    }
    for (key, value) in response.headers.iter() {
        headers.append(key.clone(), value.clone());
    }
    http
}
