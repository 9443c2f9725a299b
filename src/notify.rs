//! Outbound user notifications. Fire-and-forget: messages are queued on a
//! bounded channel and drained by a worker that persists each one as an
//! outbox blob for the downstream messenger to deliver (at-least-once,
//! consumers must tolerate duplicates).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::blob::BlobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    TrainingComplete,
    GenerationComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub user_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: NotificationMessage) -> Result<()>;
}

/// Channel-backed notifier; pairs with [`spawn_outbox_worker`].
pub struct QueueNotifier {
    tx: mpsc::Sender<NotificationMessage>,
}

impl QueueNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NotificationMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for QueueNotifier {
    async fn send(&self, message: NotificationMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow!("Notification queue is closed"))
    }
}

pub fn spawn_outbox_worker(
    blobs: Arc<dyn BlobStore>,
    mut rx: mpsc::Receiver<NotificationMessage>,
) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let path = format!(
                "outbox/{}-{}.json",
                Utc::now().timestamp_millis(),
                &Uuid::new_v4().simple().to_string()[..8]
            );
            match serde_json::to_vec_pretty(&message) {
                Ok(bytes) => {
                    if let Err(err) = blobs.put(&path, &bytes).await {
                        error!("Failed to persist outbox message {path}: {err:#}");
                    } else {
                        info!(user_id = %message.user_id, kind = ?message.message_type, %path, "notification queued for delivery");
                    }
                }
                Err(err) => error!("Failed to encode outbox message: {err}"),
            }
        }
    });
}
