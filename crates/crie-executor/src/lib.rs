//! Worker-side core of the emulator: subprocess lifecycle, per-worker
//! Runtime API servers, the managed worker pair, and the dispatcher that
//! binds admitted invocations to idle workers.

use thiserror::Error;

pub mod backoff;
pub mod dispatcher;
pub mod process;
pub mod rapi;
pub mod worker;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("process spawn failed: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("runtime api bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime api server is not running")]
    RapiStopped,

    #[error("runtime api server shut down while an invocation was in flight")]
    Shutdown,

    #[error("internal executor error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

pub use backoff::RespawnBackoff;
pub use dispatcher::{build_workers, Dispatcher};
pub use process::{delegate, WorkerProcess};
pub use rapi::RapiServer;
pub use worker::{ManagedWorker, WorkerSlot};
