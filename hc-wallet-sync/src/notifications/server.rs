//! Subscriber fan-out.
//!
//! Tip changes and transaction notifications are broadcast: every subscriber
//! receives every event, and a subscriber that falls more than the buffer
//! capacity behind loses the oldest events and is told how many it missed.
//! Rescan progress uses a bounded queue per rescan so the rescan waits for
//! its consumer instead of dropping progress.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::WalletConfig;
use crate::types::{MainTipChanged, RescanProgress, TxNotification};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("subscriber lagged, {0} notifications dropped")]
    Lagged(u64),

    #[error("notification server closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
        }
    }

    pub fn subscribe(&self) -> EventReceiver<T> {
        EventReceiver::new(self.sender.subscribe())
    }

    /// Sends to every current subscriber. Having none is not an error.
    pub fn emit(&self, events: &[T]) {
        for event in events {
            let _ = self.sender.send(event.clone());
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug)]
pub struct EventReceiver<T: Clone> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> EventReceiver<T> {
    pub fn new(receiver: broadcast::Receiver<T>) -> Self {
        Self {
            receiver,
        }
    }

    /// Next event. After a [`NotificationError::Lagged`] the receiver resumes
    /// with the oldest event still buffered.
    pub async fn recv(&mut self) -> Result<T, NotificationError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(NotificationError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(NotificationError::Closed),
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// Delivers committed wallet changes to subscribers.
#[derive(Debug, Clone)]
pub struct NotificationServer {
    tips: EventBus<MainTipChanged>,
    transactions: EventBus<TxNotification>,
    progress_buffer: usize,
}

impl NotificationServer {
    pub fn new(config: &WalletConfig) -> Self {
        Self {
            tips: EventBus::new(config.tip_notification_buffer),
            transactions: EventBus::new(config.tx_notification_buffer),
            progress_buffer: config.rescan_progress_buffer,
        }
    }

    pub fn subscribe_tip_changes(&self) -> EventReceiver<MainTipChanged> {
        self.tips.subscribe()
    }

    pub fn subscribe_transactions(&self) -> EventReceiver<TxNotification> {
        self.transactions.subscribe()
    }

    pub(crate) fn notify_tip_changed(&self, change: MainTipChanged) {
        tracing::debug!(
            "Main tip changed to height {} ({} attached, {} detached)",
            change.new_height,
            change.attached_blocks.len(),
            change.detached_blocks.len()
        );
        self.tips.emit(&[change]);
    }

    pub(crate) fn notify_transactions(&self, notifications: &[TxNotification]) {
        self.transactions.emit(notifications);
    }

    /// A bounded channel for one rescan's progress.
    pub(crate) fn rescan_progress_channel(
        &self,
    ) -> (mpsc::Sender<RescanProgress>, mpsc::Receiver<RescanProgress>) {
        mpsc::channel(self.progress_buffer)
    }
}
