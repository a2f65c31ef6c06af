// Shared types for the emulator: the invocation record with its reply
// rendezvous, the bounded intake queue, and configuration.

pub use bytes::Bytes;
pub use http;
pub use uuid;

pub mod config;
pub mod invocation;
pub mod queue;

pub use config::{Config, ConfigError, ListenAddress};
pub use invocation::{Invocation, Response};
pub use queue::{IntakeQueue, OfferError};
