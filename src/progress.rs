//! In-process progress fan-out.
//!
//! Workers publish status snapshots; streaming endpoints subscribe per
//! document. Broadcast channels give each subscriber a bounded buffer
//! where a lagging consumer loses oldest events instead of blocking the
//! publisher. Nothing here survives a restart; the database remains the
//! source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::models::StatusSnapshot;

/// Per-subscriber event buffer.
const SUBSCRIBER_BUFFER: usize = 64;

/// Publish/subscribe surface for document progress events.
#[derive(Clone)]
pub struct ProgressBus {
    channels: Arc<RwLock<HashMap<i64, broadcast::Sender<StatusSnapshot>>>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish a snapshot to any subscribers of this document.
    pub async fn publish(&self, snapshot: StatusSnapshot) {
        let document_id = snapshot.document_id;
        let terminal = snapshot.status.is_terminal();

        let mut channels = self.channels.write().await;
        let remove = match channels.get(&document_id) {
            Some(sender) => {
                // Send fails only when every receiver is gone.
                let orphaned = sender.send(snapshot).is_err() && sender.receiver_count() == 0;
                terminal || orphaned
            }
            None => false,
        };
        if remove {
            channels.remove(&document_id);
        }
    }

    /// Subscribe to events for one document.
    ///
    /// Callers replay the current snapshot from the repository first;
    /// this receiver only carries events published after subscription.
    pub async fn subscribe(&self, document_id: i64) -> broadcast::Receiver<StatusSnapshot> {
        let mut channels = self.channels.write().await;
        channels
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .subscribe()
    }

    /// Number of documents with live subscriptions (diagnostics).
    pub async fn active_channels(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
