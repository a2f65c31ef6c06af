//! A managed worker pairs one subprocess with its private Runtime API
//! server and serializes invocations through a single status mutex.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::StatusCode;
use tracing::{error, info, warn};

use crie_common::{Config, Invocation, Response};

use crate::process::WorkerProcess;
use crate::rapi::RapiServer;
use crate::Result;

/// Slot interface the dispatcher binds invocations through. `try_handle`
/// must not block: it either reserves the slot and returns immediately, or
/// hands the invocation back.
#[async_trait]
pub trait WorkerSlot: Send + Sync {
    fn id(&self) -> &str;

    /// Atomically reserves `Idle -> Processing` and takes ownership of the
    /// invocation; a busy slot returns it unchanged.
    fn try_handle(&self, inv: Invocation) -> std::result::Result<(), Invocation>;

    async fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Idle,
    Processing,
}

pub struct ManagedWorker {
    id: String,
    cfg: Arc<Config>,
    status: Arc<Mutex<WorkerStatus>>,
    rapi: Arc<RapiServer>,
    process: Arc<WorkerProcess>,
}

impl ManagedWorker {
    pub fn new(id: impl Into<String>, cfg: Arc<Config>, slot: usize) -> Self {
        let id = id.into();
        let addr = cfg.server_address.worker_address(slot);
        let rapi = Arc::new(RapiServer::new(id.clone(), Arc::clone(&cfg), addr.clone()));
        let process = Arc::new(WorkerProcess::new(id.clone(), &cfg, &addr));
        Self {
            id,
            cfg,
            status: Arc::new(Mutex::new(WorkerStatus::Idle)),
            rapi,
            process,
        }
    }

    /// Idempotently brings up both halves of the pair.
    pub async fn start(&self) -> Result<()> {
        self.rapi.start().await?;
        self.process.start()
    }

    async fn wait_for_idle(&self, deadline: Instant) {
        loop {
            let idle = self
                .status
                .lock()
                .map(|status| *status == WorkerStatus::Idle)
                .unwrap_or(true);
            if idle {
                return;
            }
            if Instant::now() >= deadline {
                warn!(worker = %self.id, "worker still busy at shutdown");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl WorkerSlot for ManagedWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn try_handle(&self, inv: Invocation) -> std::result::Result<(), Invocation> {
        {
            let Ok(mut status) = self.status.lock() else {
                return Err(inv);
            };
            if *status == WorkerStatus::Processing {
                return Err(inv);
            }
            *status = WorkerStatus::Processing;
        }

        let id = self.id.clone();
        let status = Arc::clone(&self.status);
        let rapi = Arc::clone(&self.rapi);
        let process = Arc::clone(&self.process);
        tokio::spawn(async move {
            let outcome = match activate(&rapi, &process).await {
                Ok(()) => rapi.next(inv).await,
                Err(e) => {
                    error!(worker = %id, invocation = %inv.id, error = %e, "worker startup failed");
                    inv.respond(
                        Response::message(StatusCode::INTERNAL_SERVER_ERROR, "worker start failed")
                            .with_error(e.to_string()),
                    );
                    Err(e)
                }
            };
            if let Err(e) = outcome {
                warn!(worker = %id, error = %e, "invocation handling returned error");
            }
            if let Ok(mut status) = status.lock() {
                *status = WorkerStatus::Idle;
            }
        });
        Ok(())
    }

    /// Lets in-flight work finish within the Runtime API shutdown budget,
    /// then tears down the subprocess and the Runtime API server. The
    /// whole teardown shares one deadline.
    async fn stop(&self) {
        let deadline = Instant::now() + self.cfg.rapi_server_shutdown_timeout;
        self.wait_for_idle(deadline).await;
        self.process.stop();
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.rapi.stop(remaining).await;
        info!(worker = %self.id, "worker stopped");
    }
}

async fn activate(rapi: &Arc<RapiServer>, process: &Arc<WorkerProcess>) -> Result<()> {
    rapi.start().await?;
    process.start()
}
