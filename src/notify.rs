use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ReservationStatus;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Submitted,
    Edited,
    StatusChanged,
    Canceled,
}

/// What the requester is told after a lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub reservation_id: Ulid,
    pub status: ReservationStatus,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to encode notice: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

/// Delivery collaborator. The engine calls it after a mutation is durable and
/// only logs a failure.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: Ulid, notice: &Notice) -> Result<(), NotifyError>;
}

/// In-process fan-out of JSON notices per user.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<String>>,
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

    /// Subscribe to a user's notices. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<String> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop a user's channel once nobody listens any more.
    pub fn prune(&self, user_id: &Ulid) {
        self.channels
            .remove_if(user_id, |_, sender| sender.receiver_count() == 0);
    }
}

impl Notifier for NotifyHub {
    /// No-op if nobody is listening. A channel whose receivers are all gone
    /// is dropped on the first notice that finds it empty.
    fn notify(&self, user_id: Ulid, notice: &Notice) -> Result<(), NotifyError> {
        let Some(sender) = self.channels.get(&user_id).map(|s| s.value().clone()) else {
            return Ok(());
        };
        let payload = serde_json::to_string(notice)?;
        if sender.send(payload).is_err() {
            self.prune(&user_id);
        }
        Ok(())
    }
}
