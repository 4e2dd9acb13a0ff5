//! Notification hand-off.
//!
//! The core does not own a delivery channel; it hands `NotificationRecord`s to
//! a `NotificationDispatcher` and keeps undelivered records pending for
//! resend. The crate ships a bounded-queue dispatcher: the consuming side (a
//! chat front end, typically) drains the channel out-of-band, and a full
//! queue fails the dispatch instead of blocking a check cycle.

use async_trait::async_trait;

use crate::store::NotificationRecord;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("notification queue is full")]
    QueueFull,
    #[error("notification channel is closed")]
    Closed,
}

/// Delivery seam between the core and the out-of-band channel.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn deliver(&self, record: &NotificationRecord) -> Result<(), DispatchError>;
}

/// Dispatcher backed by a bounded channel.
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: async_channel::Sender<NotificationRecord>,
}

impl QueueDispatcher {
    /// Create the dispatcher and the receiving end the front end drains.
    pub fn new(capacity: usize) -> (Self, async_channel::Receiver<NotificationRecord>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationDispatcher for QueueDispatcher {
    async fn deliver(&self, record: &NotificationRecord) -> Result<(), DispatchError> {
        // try_send, not send: a stalled consumer must fail the dispatch so the
        // record stays pending, rather than stall the check cycle
        self.tx.try_send(record.clone()).map_err(|e| match e {
            async_channel::TrySendError::Full(_) => DispatchError::QueueFull,
            async_channel::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}
