//! End-to-end test harness: boots a complete emulator in-process (frontend,
//! queue, dispatcher, worker pool with real child processes) and plays the
//! child runtime over HTTP against the per-worker Runtime API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crie_common::{queue, Config};
use crie_executor::{build_workers, Dispatcher};
use crie_gateway::GatewayError;

pub type HarnessResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub struct Emulator {
    pub cfg: Arc<Config>,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), GatewayError>>,
    dispatcher: JoinHandle<()>,
}

/// Boots an emulator on `base_port` with the given `CRIE_*` overrides. The
/// configured command is an inert `sleep`; tests speak the Runtime API
/// themselves via [`spawn_echo_runtime`] or [`spawn_failing_runtime`].
pub async fn spawn_emulator(base_port: u16, overrides: &[(&str, &str)]) -> HarnessResult<Emulator> {
    let argv: Vec<String> = vec!["crie".into(), "sleep".into(), "3600".into()];
    let mut env: HashMap<String, String> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    env.insert("CRIE_SERVER_ADDRESS".to_string(), format!(":{base_port}"));

    let cfg = Arc::new(Config::from_parts(&argv, &env)?);
    let shutdown = CancellationToken::new();

    let (intake, queued) = queue::bounded(cfg.queue_size);
    let workers = build_workers(&cfg).await?;
    let dispatcher = tokio::spawn(
        Dispatcher::new(Arc::clone(&cfg), workers).run(queued, shutdown.clone()),
    );
    let server = tokio::spawn(crie_gateway::serve(
        Arc::clone(&cfg),
        intake,
        shutdown.clone(),
    ));

    wait_for_listener(base_port).await?;

    Ok(Emulator {
        cfg,
        shutdown,
        server,
        dispatcher,
    })
}

async fn wait_for_listener(port: u16) -> HarnessResult<()> {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            Ok(_) => return Ok(()),
            Err(e) if Instant::now() >= deadline => {
                return Err(format!("server on port {port} never came up: {e}").into())
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

impl Emulator {
    pub fn invoke_url(&self) -> String {
        format!(
            "http://127.0.0.1:{}/2015-03-31/functions/{}/invocations",
            self.cfg.server_address.port(),
            self.cfg.lambda_name
        )
    }

    pub fn rapi_url(&self, slot: usize) -> String {
        format!("http://{}", self.cfg.server_address.worker_address(slot).bind_addr())
    }

    /// Fires the root cancellation, as the terminator would on SIGTERM.
    pub fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Shuts down and waits for both long-lived tasks to unwind.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.server).await;
        let _ = tokio::time::timeout(Duration::from_secs(10), self.dispatcher).await;
    }
}

/// Plays a well-behaved child: long-polls for work, waits `delay`, then
/// echoes the invocation body back as the response. Each served poll bumps
/// `polls`.
pub fn spawn_echo_runtime(
    rapi_url: String,
    polls: Arc<AtomicU32>,
    delay: Duration,
) -> JoinHandle<()> {
    spawn_runtime(rapi_url, polls, move |_request_id| RuntimeReply {
        path: "response",
        delay,
        body: None,
    })
}

/// Plays a failing child: every invocation is answered on the error route
/// with `error_body`.
pub fn spawn_failing_runtime(
    rapi_url: String,
    polls: Arc<AtomicU32>,
    error_body: &'static str,
) -> JoinHandle<()> {
    spawn_runtime(rapi_url, polls, move |_request_id| RuntimeReply {
        path: "error",
        delay: Duration::ZERO,
        body: Some(error_body),
    })
}

struct RuntimeReply {
    path: &'static str,
    delay: Duration,
    body: Option<&'static str>,
}

fn spawn_runtime<F>(rapi_url: String, polls: Arc<AtomicU32>, reply: F) -> JoinHandle<()>
where
    F: Fn(&str) -> RuntimeReply + Send + 'static,
{
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let next_url = format!("{rapi_url}/2018-06-01/runtime/invocation/next");
        loop {
            let next = match client.get(&next_url).send().await {
                Ok(next) => next,
                Err(_) => break,
            };
            if next.status() != reqwest::StatusCode::OK {
                break;
            }
            let request_id = match next
                .headers()
                .get("lambda-runtime-aws-request-id")
                .and_then(|v| v.to_str().ok())
            {
                Some(id) => id.to_string(),
                None => break,
            };
            let invocation_body = next.bytes().await.unwrap_or_default();
            polls.fetch_add(1, Ordering::SeqCst);

            let reply = reply(&request_id);
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            let url = format!(
                "{rapi_url}/2018-06-01/runtime/invocation/{request_id}/{}",
                reply.path
            );
            let body = match reply.body {
                Some(body) => reqwest::Body::from(body),
                None => reqwest::Body::from(invocation_body),
            };
            if let Err(e) = client.post(&url).body(body).send().await {
                debug!(error = %e, "posting runtime reply failed");
                break;
            }
        }
    })
}
