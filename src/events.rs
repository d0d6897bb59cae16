//! Notifications emitted after a synchronization commits.
//!
//! Consumers (search indexing, favicon refresh) receive [`SyncEvent`]s over a
//! bounded channel. Sending never waits: when the channel is full or closed
//! the event is dropped with a warning, so a slow consumer cannot stall
//! synchronization.

use tokio::sync::mpsc;

use crate::storage::{Article, Feed};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ArticlesCreated(Vec<Article>),
    ArticlesUpdated(Vec<Article>),
    ArticlesDeleted(Vec<Article>),
    FaviconRefreshRequested(Feed),
}

impl SyncEvent {
    fn kind(&self) -> &'static str {
        match self {
            SyncEvent::ArticlesCreated(_) => "articles_created",
            SyncEvent::ArticlesUpdated(_) => "articles_updated",
            SyncEvent::ArticlesDeleted(_) => "articles_deleted",
            SyncEvent::FaviconRefreshRequested(_) => "favicon_refresh_requested",
        }
    }
}

/// Sending half of the notification channel. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::Sender<SyncEvent>>,
}

impl Notifier {
    /// Create a notifier and the receiver its events arrive on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn notify(&self, event: SyncEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        let kind = event.kind();
        if let Err(e) = tx.try_send(event) {
            tracing::warn!(event = kind, error = %e, "Dropping sync notification");
        }
    }

    /// Emit an article event unless the batch is empty.
    pub fn notify_articles(&self, make: fn(Vec<Article>) -> SyncEvent, articles: Vec<Article>) {
        if !articles.is_empty() {
            self.notify(make(articles));
        }
    }
}
