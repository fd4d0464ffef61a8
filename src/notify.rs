use std::io;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ConfirmationNotice;

const CHANNEL_CAPACITY: usize = 256;

/// Destination for confirmation notices. Delivery is best-effort: the engine logs
/// a failed delivery and moves on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        recipients: [Ulid; 2],
        notice: &ConfirmationNotice,
    ) -> io::Result<()>;
}

/// Broadcast hub for confirmation notices, one channel per account.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<ConfirmationNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for an account. Creates the channel if needed.
    pub fn subscribe(&self, account_id: Ulid) -> broadcast::Receiver<ConfirmationNotice> {
        let sender = self
            .channels
            .entry(account_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, account_id: Ulid, notice: &ConfirmationNotice) {
        if let Some(sender) = self.channels.get(&account_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[async_trait]
impl NotificationSink for NotifyHub {
    async fn deliver(
        &self,
        recipients: [Ulid; 2],
        notice: &ConfirmationNotice,
    ) -> io::Result<()> {
        for account_id in recipients {
            self.send(account_id, notice);
        }
        Ok(())
    }
}
