use std::sync::Arc;

use color_eyre::eyre;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crie_common::Config;

mod signals;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Arc::new(Config::detect()?);

    if cfg.delegate_mode() {
        delegate(cfg).await
    } else {
        emulate(cfg).await
    }
}

/// Root of the cancellation tree: the first termination signal cancels
/// the returned token, everything long-lived subscribes to it.
fn spawn_terminator() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signals::wait_for_shutdown_signal().await {
            error!(error = %e, "installing signal handlers failed");
        }
        info!("shutdown signal received");
        token.cancel();
    });
    shutdown
}

/// Nested under another runtime: run the command once, forward signals,
/// exit with the child's code.
async fn delegate(cfg: Arc<Config>) -> eyre::Result<()> {
    info!("AWS_LAMBDA_RUNTIME_API is already set, running in delegate mode");
    let shutdown = spawn_terminator();
    let code = crie_executor::delegate(&cfg, shutdown).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn emulate(cfg: Arc<Config>) -> eyre::Result<()> {
    let shutdown = spawn_terminator();

    let (queue, queued) = crie_common::queue::bounded(cfg.queue_size);
    let workers = crie_executor::build_workers(&cfg).await?;
    let dispatcher = crie_executor::Dispatcher::new(Arc::clone(&cfg), workers);
    let dispatcher_task = tokio::spawn(dispatcher.run(queued, shutdown.clone()));

    let served = crie_gateway::serve(Arc::clone(&cfg), queue, shutdown.clone()).await;
    if served.is_err() {
        // The frontend is gone; make sure the dispatcher unwinds too.
        shutdown.cancel();
    }

    // Every queue handle is dropped once serve returns, so the dispatcher
    // drains the remaining invocations and stops the workers.
    if let Err(e) = dispatcher_task.await {
        error!(error = %e, "dispatcher task failed");
    }

    served?;
    Ok(())
}
