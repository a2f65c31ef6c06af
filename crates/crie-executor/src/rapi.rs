//! Per-worker Lambda Runtime API endpoint.
//!
//! Each worker slot gets a private HTTP server implementing the Runtime
//! API contract the child binary speaks: it long-polls
//! `GET /2018-06-01/runtime/invocation/next` and posts the outcome back to
//! `/response` or `/error`. The server couples exactly one in-flight
//! invocation to one long-poll through two capacity-1 signal channels.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crie_common::{Config, Invocation, ListenAddress, Response};

use crate::{ExecutorError, Result};

pub const LAMBDA_RUNTIME_AWS_REQUEST_ID: &str = "lambda-runtime-aws-request-id";
pub const LAMBDA_RUNTIME_DEADLINE_MS: &str = "lambda-runtime-deadline-ms";
pub const LAMBDA_RUNTIME_INVOKED_FUNCTION_ARN: &str = "lambda-runtime-invoked-function-arn";
pub const LAMBDA_RUNTIME_TRACE_ID: &str = "lambda-runtime-trace-id";
pub const LAMBDA_RUNTIME_CLIENT_CONTEXT: &str = "lambda-runtime-client-context";
pub const LAMBDA_RUNTIME_COGNITO_IDENTITY: &str = "lambda-runtime-cognito-identity";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RapiState {
    Stopped,
    Initializing,
    Idle,
    Busy,
}

struct Inner {
    state: RapiState,
    inv: Option<Invocation>,
    next_tx: Option<mpsc::Sender<()>>,
    done_tx: Option<mpsc::Sender<()>>,
    cancel: Option<CancellationToken>,
    serve_handle: Option<JoinHandle<()>>,
    last_start: Option<Instant>,
    last_next: Option<Instant>,
}

pub struct RapiServer {
    id: String,
    cfg: Arc<Config>,
    addr: ListenAddress,
    inner: Mutex<Inner>,
    // Receivers need exclusive access; the long-poll handler holds the
    // next receiver for the duration of the poll, the dispatcher-side
    // `next` call holds the done receiver until the invocation terminates.
    next_rx: AsyncMutex<Option<mpsc::Receiver<()>>>,
    done_rx: AsyncMutex<Option<mpsc::Receiver<()>>>,
}

impl RapiServer {
    pub fn new(id: impl Into<String>, cfg: Arc<Config>, addr: ListenAddress) -> Self {
        Self {
            id: id.into(),
            cfg,
            addr,
            inner: Mutex::new(Inner {
                state: RapiState::Stopped,
                inv: None,
                next_tx: None,
                done_tx: None,
                cancel: None,
                serve_handle: None,
                last_start: None,
                last_next: None,
            }),
            next_rx: AsyncMutex::new(None),
            done_rx: AsyncMutex::new(None),
        }
    }

    pub fn addr(&self) -> &ListenAddress {
        &self.addr
    }

    /// Idempotent: only a stopped server binds its listener and moves to
    /// `Initializing`. Signal channels are recreated on every start.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.lock()?.state != RapiState::Stopped {
            return Ok(());
        }

        let listener = TcpListener::bind(self.addr.bind_addr())
            .await
            .map_err(|e| ExecutorError::Bind {
                addr: self.addr.bind_addr(),
                source: e,
            })?;

        let (next_tx, next_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.clone().cancelled_owned());

        {
            let mut inner = self.lock()?;
            if inner.state != RapiState::Stopped {
                return Ok(());
            }
            inner.state = RapiState::Initializing;
            inner.next_tx = Some(next_tx);
            inner.done_tx = Some(done_tx);
            inner.cancel = Some(cancel);
            inner.last_start = Some(Instant::now());
        }
        *self.next_rx.lock().await = Some(next_rx);
        *self.done_rx.lock().await = Some(done_rx);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(worker = %this.id, error = %e, "runtime api server stopped with error");
                this.fail();
            }
        });
        self.lock()?.serve_handle = Some(handle);

        info!(worker = %self.id, addr = %self.addr, "runtime api server started");
        Ok(())
    }

    /// Hands one invocation to the child and blocks until the child posts
    /// its response or error, or the server shuts down. Every error path
    /// still terminates the invocation: either here, or in [`RapiServer::stop`]
    /// which answers whatever is still bound.
    pub async fn next(&self, inv: Invocation) -> Result<()> {
        let (tx, cancel) = {
            let mut inner = self.lock()?;
            match (inner.next_tx.clone(), inner.cancel.clone()) {
                (Some(tx), Some(cancel)) => {
                    inner.inv = Some(inv);
                    (tx, cancel)
                }
                _ => {
                    drop(inner);
                    inv.respond(
                        Response::message(StatusCode::INTERNAL_SERVER_ERROR, "server shutdown")
                            .with_error("runtime api server is not running"),
                    );
                    return Err(ExecutorError::RapiStopped);
                }
            }
        };

        if tx.send(()).await.is_err() {
            // Stopped while binding; stop() answers the bound invocation.
            return Err(ExecutorError::Shutdown);
        }

        let mut done_rx = self.done_rx.lock().await;
        let done = tokio::select! {
            _ = cancel.cancelled() => None,
            done = recv_opt(done_rx.as_mut()) => done,
        };
        match done {
            Some(()) => Ok(()),
            None => Err(ExecutorError::Shutdown),
        }
    }

    /// Cancels the server context, bounds the graceful shutdown by
    /// `timeout`, and terminates any invocation still bound with the 500
    /// shutdown reply.
    pub async fn stop(&self, timeout: Duration) {
        let (cancel, handle) = {
            let mut inner = match self.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            if inner.state == RapiState::Stopped {
                return;
            }
            inner.next_tx = None;
            inner.done_tx = None;
            (inner.cancel.take(), inner.serve_handle.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!(worker = %self.id, "runtime api graceful shutdown timed out");
                handle.abort();
            }
        }

        if let Ok(mut inner) = self.lock() {
            if let Some(inv) = inner.inv.take() {
                warn!(
                    worker = %self.id,
                    invocation = %inv.id,
                    "pending invocation at shutdown, sending error"
                );
                inv.respond(
                    Response::message(StatusCode::INTERNAL_SERVER_ERROR, "server shutdown")
                        .with_error("server shutdown"),
                );
            }
            inner.state = RapiState::Stopped;
            inner.last_next = None;
        }
        *self.next_rx.lock().await = None;
        *self.done_rx.lock().await = None;

        info!(worker = %self.id, "runtime api server stopped");
    }

    /// Listener crash path: terminate whatever is bound and mark stopped
    /// so the next `start` can rebind.
    fn fail(&self) {
        let Ok(mut inner) = self.lock() else { return };
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        if let Some(inv) = inner.inv.take() {
            inv.respond(
                Response::message(StatusCode::INTERNAL_SERVER_ERROR, "unknown error")
                    .with_error("runtime api listener failed"),
            );
        }
        inner.next_tx = None;
        inner.done_tx = None;
        inner.serve_handle = None;
        inner.state = RapiState::Stopped;
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/2018-06-01/runtime/invocation/next", get(serve_next))
            .route("/2018-06-01/runtime/init/error", post(serve_init_error))
            .route(
                "/2018-06-01/runtime/invocation/:request_id/response",
                post(serve_response),
            )
            .route(
                "/2018-06-01/runtime/invocation/:request_id/error",
                post(serve_error),
            )
            .with_state(Arc::clone(self))
    }

    /// Response headers for `GET next`: the client's headers verbatim,
    /// then the reserved runtime headers overwritten (remove-then-insert
    /// so multi-value keys cannot duplicate).
    fn next_headers(&self, inv: &Invocation) -> HeaderMap {
        let mut headers = inv.headers.clone();

        headers.remove(LAMBDA_RUNTIME_AWS_REQUEST_ID);
        if let Ok(value) = HeaderValue::try_from(inv.id.to_string()) {
            headers.insert(LAMBDA_RUNTIME_AWS_REQUEST_ID, value);
        }

        headers.remove(LAMBDA_RUNTIME_DEADLINE_MS);
        if let Ok(value) = HeaderValue::try_from(self.deadline_ms().to_string()) {
            headers.insert(LAMBDA_RUNTIME_DEADLINE_MS, value);
        }

        headers.remove(LAMBDA_RUNTIME_INVOKED_FUNCTION_ARN);
        match HeaderValue::try_from(self.cfg.invoked_function_arn.as_str()) {
            Ok(value) => {
                headers.insert(LAMBDA_RUNTIME_INVOKED_FUNCTION_ARN, value);
            }
            Err(_) => warn!(worker = %self.id, "configured function arn is not a valid header value"),
        }

        // Reserved, currently always unset.
        headers.remove(LAMBDA_RUNTIME_TRACE_ID);
        headers.remove(LAMBDA_RUNTIME_CLIENT_CONTEXT);
        headers.remove(LAMBDA_RUNTIME_COGNITO_IDENTITY);

        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        headers
    }

    fn deadline_ms(&self) -> u128 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        (now + self.cfg.lambda_runtime_deadline).as_millis()
    }

    /// Terminal POST from the child: emit the reply, unblock the
    /// dispatcher-side `next` caller, and go idle again.
    fn finish(&self, request_id: &str, response: Response) -> HttpResponse {
        let (inv, done_tx, elapsed) = {
            let mut inner = match self.lock() {
                Ok(inner) => inner,
                Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            };
            let inv = inner.inv.take();
            let done_tx = inner.done_tx.clone();
            let elapsed = inner.last_next.map(|t| t.elapsed());
            inner.state = RapiState::Idle;
            (inv, done_tx, elapsed)
        };

        let Some(inv) = inv else {
            warn!(worker = %self.id, request_id, "terminal post without a bound invocation");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };
        if inv.id.to_string() != request_id {
            warn!(
                worker = %self.id,
                invocation = %inv.id,
                request_id,
                "terminal post for a different request id"
            );
        }

        if response.error.is_some() {
            info!(worker = %self.id, invocation = %inv.id, elapsed = ?elapsed, "invocation failed");
        } else {
            info!(worker = %self.id, invocation = %inv.id, elapsed = ?elapsed, "invocation completed");
        }
        inv.respond(response);

        if let Some(done_tx) = done_tx {
            let _ = done_tx.try_send(());
        }
        StatusCode::ACCEPTED.into_response()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ExecutorError::Internal("runtime api server lock poisoned".to_string()))
    }
}

async fn recv_opt(rx: Option<&mut mpsc::Receiver<()>>) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

fn message_response(status: StatusCode, message: &str) -> HttpResponse {
    let body = serde_json::json!({ "message": message }).to_string();
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Long-poll for the next invocation. The first arrival flips
/// `Initializing` to `Idle` and records how long initialization took.
async fn serve_next(State(server): State<Arc<RapiServer>>) -> HttpResponse {
    let cancel = {
        let mut inner = match server.lock() {
            Ok(inner) => inner,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
        if inner.state == RapiState::Initializing {
            if let Some(started) = inner.last_start {
                info!(worker = %server.id, took = ?started.elapsed(), "initialization finished");
            }
            inner.state = RapiState::Idle;
        }
        match inner.cancel.clone() {
            Some(cancel) => cancel,
            None => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    };

    let signal = {
        let mut next_rx = server.next_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            signal = recv_opt(next_rx.as_mut()) => signal,
        }
    };

    match signal {
        None => message_response(StatusCode::NOT_FOUND, "no more invocations"),
        Some(()) => {
            let (headers, body, id) = {
                let mut inner = match server.lock() {
                    Ok(inner) => inner,
                    Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                };
                let Some(inv) = inner.inv.as_ref() else {
                    error!(worker = %server.id, "next signal without a bound invocation");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                };
                let headers = server.next_headers(inv);
                let body = inv.body.clone();
                let id = inv.id;
                inner.state = RapiState::Busy;
                inner.last_next = Some(Instant::now());
                (headers, body, id)
            };

            info!(worker = %server.id, invocation = %id, "sent next request");
            let mut response = HttpResponse::new(Body::from(body));
            *response.headers_mut() = headers;
            response
        }
    }
}

async fn serve_response(
    State(server): State<Arc<RapiServer>>,
    Path(request_id): Path<String>,
    body: Bytes,
) -> HttpResponse {
    server.finish(&request_id, Response::new(StatusCode::OK, body))
}

async fn serve_error(
    State(server): State<Arc<RapiServer>>,
    Path(request_id): Path<String>,
    body: Bytes,
) -> HttpResponse {
    let error = String::from_utf8_lossy(&body).to_string();
    server.finish(
        &request_id,
        Response::new(StatusCode::BAD_GATEWAY, body).with_error(error),
    )
}

async fn serve_init_error(State(server): State<Arc<RapiServer>>, body: Bytes) -> HttpResponse {
    error!(
        worker = %server.id,
        payload = %String::from_utf8_lossy(&body),
        "initialization error"
    );
    StatusCode::ACCEPTED.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(base_port: u16) -> Arc<Config> {
        let argv: Vec<String> = vec!["crie".into(), "sleep".into(), "30".into()];
        let env: HashMap<String, String> = [
            ("CRIE_SERVER_ADDRESS".to_string(), format!(":{base_port}")),
            ("CRIE_LAMBDA_RUNTIME_DEADLINE".to_string(), "5s".to_string()),
        ]
        .into_iter()
        .collect();
        Arc::new(Config::from_parts(&argv, &env).unwrap())
    }

    fn server_on(base_port: u16) -> Arc<RapiServer> {
        let cfg = config(base_port);
        let addr = cfg.server_address.worker_address(0);
        Arc::new(RapiServer::new("pid-1", cfg, addr))
    }

    fn base_url(server: &RapiServer) -> String {
        format!("http://{}", server.addr().bind_addr())
    }

    fn invocation(body: &'static [u8]) -> (Invocation, tokio::sync::oneshot::Receiver<Response>) {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom-header", HeaderValue::from_static("forwarded"));
        Invocation::new(Bytes::from_static(body), headers)
    }

    #[tokio::test]
    async fn next_response_cycle_completes_the_invocation() {
        let server = server_on(19910);
        server.start().await.unwrap();

        let (inv, reply_rx) = invocation(b"{\"x\":1}");
        let id = inv.id;
        let next_server = Arc::clone(&server);
        let next_task = tokio::spawn(async move { next_server.next(inv).await });

        let client = reqwest::Client::new();
        let url = base_url(&server);

        let before_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let next = client
            .get(format!("{url}/2018-06-01/runtime/invocation/next"))
            .send()
            .await
            .unwrap();
        assert_eq!(next.status(), reqwest::StatusCode::OK);
        assert_eq!(
            next.headers()
                .get(LAMBDA_RUNTIME_AWS_REQUEST_ID)
                .unwrap()
                .to_str()
                .unwrap(),
            id.to_string()
        );
        assert_eq!(
            next.headers().get("x-custom-header").unwrap(),
            "forwarded"
        );
        assert_eq!(
            next.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let deadline_ms: u128 = next
            .headers()
            .get(LAMBDA_RUNTIME_DEADLINE_MS)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(deadline_ms >= before_ms + 5_000);
        assert!(next.headers().get(LAMBDA_RUNTIME_TRACE_ID).is_none());
        assert_eq!(next.bytes().await.unwrap().as_ref(), b"{\"x\":1}");

        let accepted = client
            .post(format!("{url}/2018-06-01/runtime/invocation/{id}/response"))
            .body("{\"ok\":true}")
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);

        next_task.await.unwrap().unwrap();
        let reply = reply_rx.await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(&reply.body[..], b"{\"ok\":true}");
        assert!(reply.error.is_none());

        server.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn child_error_post_becomes_a_bad_gateway_reply() {
        let server = server_on(19920);
        server.start().await.unwrap();

        let (inv, reply_rx) = invocation(b"{}");
        let id = inv.id;
        let next_server = Arc::clone(&server);
        let next_task = tokio::spawn(async move { next_server.next(inv).await });

        let client = reqwest::Client::new();
        let url = base_url(&server);
        client
            .get(format!("{url}/2018-06-01/runtime/invocation/next"))
            .send()
            .await
            .unwrap();

        let accepted = client
            .post(format!("{url}/2018-06-01/runtime/invocation/{id}/error"))
            .body("{\"errorMessage\":\"boom\"}")
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);

        next_task.await.unwrap().unwrap();
        let reply = reply_rx.await.unwrap();
        assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
        assert_eq!(&reply.body[..], b"{\"errorMessage\":\"boom\"}");
        assert_eq!(reply.error.as_deref(), Some("{\"errorMessage\":\"boom\"}"));

        server.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn stop_answers_a_pending_invocation_with_shutdown() {
        let server = server_on(19930);
        server.start().await.unwrap();

        let (inv, reply_rx) = invocation(b"{}");
        let next_server = Arc::clone(&server);
        let next_task = tokio::spawn(async move { next_server.next(inv).await });
        // Give next() a moment to bind the invocation.
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop(Duration::from_secs(2)).await;

        assert!(next_task.await.unwrap().is_err());
        let reply = reply_rx.await.unwrap();
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        let value: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(value["message"], "server shutdown");
    }

    #[tokio::test]
    async fn init_error_is_acknowledged() {
        let server = server_on(19940);
        server.start().await.unwrap();

        let client = reqwest::Client::new();
        let url = base_url(&server);
        let accepted = client
            .post(format!("{url}/2018-06-01/runtime/init/error"))
            .body("{\"errorMessage\":\"bad init\"}")
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);

        server.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let server = server_on(19950);
        server.start().await.unwrap();
        server.start().await.unwrap();
        server.stop(Duration::from_secs(2)).await;
    }
}
