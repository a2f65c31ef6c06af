//! The dispatcher consumes admitted invocations and binds each to an idle
//! worker, scanning slots in index order (a deliberate warmth bias toward
//! lower-index workers) with a bounded retry budget.

use std::sync::Arc;

use axum::http::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crie_common::{Config, Invocation, Response};

use crate::worker::{ManagedWorker, WorkerSlot};
use crate::Result;

/// Builds the worker pool: `max_concurrency` slots named `pid-1..`, the
/// first `initial_concurrency` of them started immediately.
pub async fn build_workers(cfg: &Arc<Config>) -> Result<Vec<Arc<dyn WorkerSlot>>> {
    let mut workers: Vec<Arc<dyn WorkerSlot>> = Vec::with_capacity(cfg.max_concurrency as usize);
    for slot in 0..cfg.max_concurrency as usize {
        let worker = ManagedWorker::new(format!("pid-{}", slot + 1), Arc::clone(cfg), slot);
        if slot < cfg.initial_concurrency as usize {
            worker.start().await?;
        }
        workers.push(Arc::new(worker));
    }
    Ok(workers)
}

pub struct Dispatcher {
    cfg: Arc<Config>,
    workers: Vec<Arc<dyn WorkerSlot>>,
}

impl Dispatcher {
    pub fn new(cfg: Arc<Config>, workers: Vec<Arc<dyn WorkerSlot>>) -> Self {
        Self { cfg, workers }
    }

    /// Runs until the queue closes or the root cancellation fires. On the
    /// way out, every invocation still in the queue gets the shutdown
    /// reply, then every worker is stopped.
    pub async fn run(self, mut queue: mpsc::Receiver<Invocation>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                inv = queue.recv() => match inv {
                    None => break,
                    Some(inv) => {
                        info!(invocation = %inv.id, "request");
                        self.handle(inv, &shutdown).await;
                    }
                }
            }
        }

        // The queue stays open until the frontend finishes shutting down;
        // everything that was admitted still gets a terminal response.
        while let Some(inv) = queue.recv().await {
            inv.respond(shutdown_response());
        }

        for worker in &self.workers {
            worker.stop().await;
        }
        info!("dispatcher stopped");
    }

    async fn handle(&self, inv: Invocation, shutdown: &CancellationToken) {
        let mut inv = inv;
        for attempt in 0..self.cfg.max_handle_attempts {
            if attempt > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.delay_between_handle_attempts) => {}
                    _ = shutdown.cancelled() => {
                        inv.respond(shutdown_response());
                        return;
                    }
                }
            }
            for worker in &self.workers {
                if shutdown.is_cancelled() {
                    inv.respond(shutdown_response());
                    return;
                }
                match worker.try_handle(inv) {
                    Ok(()) => return,
                    Err(refused) => inv = refused,
                }
            }
        }

        warn!(
            invocation = %inv.id,
            attempts = self.cfg.max_handle_attempts,
            "no idle worker found"
        );
        let id = inv.id;
        inv.respond(Response::message(
            StatusCode::GATEWAY_TIMEOUT,
            format!("could not find suitable backend for invocation: {id}"),
        ));
    }
}

fn shutdown_response() -> Response {
    Response::message(StatusCode::INTERNAL_SERVER_ERROR, "server shutdown")
        .with_error("server shutdown")
}
