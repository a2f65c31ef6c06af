use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::invocation::Invocation;

/// Creates the bounded intake queue between the frontend and the
/// dispatcher. The receiver side is consumed by the dispatcher; the queue
/// closes once every `IntakeQueue` clone has been dropped.
pub fn bounded(capacity: usize) -> (IntakeQueue, mpsc::Receiver<Invocation>) {
    let (tx, rx) = mpsc::channel(capacity);
    (IntakeQueue { tx }, rx)
}

/// Producer half of the intake queue. This is the single multi-producer
/// channel in the emulator; admission control lives in [`IntakeQueue::offer`].
#[derive(Clone)]
pub struct IntakeQueue {
    tx: mpsc::Sender<Invocation>,
}

/// A refused offer hands the invocation back so the caller can author the
/// client-facing response.
#[derive(Debug)]
pub enum OfferError {
    /// Queue stayed full for the whole admission window.
    Full(Invocation),
    /// Queue already closed (dispatcher gone, shutdown in progress).
    Closed(Invocation),
}

impl IntakeQueue {
    /// Offers an invocation, waiting at most `wait` for queue capacity.
    pub async fn offer(&self, inv: Invocation, wait: Duration) -> Result<(), OfferError> {
        match self.tx.send_timeout(inv, wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(inv)) => Err(OfferError::Full(inv)),
            Err(SendTimeoutError::Closed(inv)) => Err(OfferError::Closed(inv)),
        }
    }
}
