use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use super::orchestrator::{error_chain, Synchronizer};
use crate::config::Config;
use crate::storage::{DatabaseError, Feed, NewFeedSynchronization};

/// Result of one pass over all subscribed feeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// False when nothing was written to the synchronization history.
    pub recorded: bool,
}

/// Periodically synchronizes every feed that has an active subscriber.
#[derive(Clone)]
pub struct Scheduler {
    synchronizer: Synchronizer,
    interval: Duration,
    concurrency: usize,
    retention: i64,
}

impl Scheduler {
    pub fn new(
        synchronizer: Synchronizer,
        interval: Duration,
        concurrency: usize,
        retention: i64,
    ) -> Self {
        Self {
            synchronizer,
            interval,
            concurrency: concurrency.max(1),
            retention,
        }
    }

    pub fn from_config(synchronizer: Synchronizer, config: &Config) -> Self {
        Self::new(
            synchronizer,
            config.sync_interval(),
            config.sync_concurrency,
            config.sync_history_retention,
        )
    }

    /// Run passes until `shutdown` turns true or its sender is dropped.
    ///
    /// The first pass starts immediately; each next one starts `interval`
    /// after the previous one finished. A pass that fails or panics is logged
    /// and does not stop the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let scheduler = self.clone();
            let pass = tokio::spawn(async move { scheduler.run_pass().await });
            match pass.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Synchronization pass failed"),
                Err(e) if e.is_panic() => {
                    tracing::error!(error = %e, "Synchronization pass panicked")
                }
                Err(e) => tracing::warn!(error = %e, "Synchronization pass cancelled"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                // Also resolves (with an error) once the sender is dropped
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Synchronize every feed with an active subscriber and record the
    /// outcomes.
    ///
    /// When every attempted feed fails the network is assumed down and
    /// nothing is recorded.
    pub async fn run_pass(&self) -> Result<PassSummary, DatabaseError> {
        let started = Instant::now();
        let feeds = self
            .synchronizer
            .database()
            .feeds_with_active_subscriptions()
            .await?;

        let records: Vec<NewFeedSynchronization> = stream::iter(feeds)
            .map(|feed| self.sync_one(feed))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let succeeded = records.iter().filter(|r| r.success).count();
        let mut summary = PassSummary {
            attempted: records.len(),
            succeeded,
            failed: records.len() - succeeded,
            recorded: false,
        };

        if summary.attempted > 0 && summary.succeeded == 0 {
            tracing::warn!(
                failed = summary.failed,
                "Every feed failed to synchronize, assuming the network is down"
            );
            return Ok(summary);
        }

        self.synchronizer
            .database()
            .record_synchronizations(&records, self.retention)
            .await?;
        summary.recorded = summary.attempted > 0;

        tracing::info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Synchronization pass complete"
        );
        Ok(summary)
    }

    async fn sync_one(&self, feed: Feed) -> NewFeedSynchronization {
        let started = Instant::now();
        let result = self.synchronizer.synchronize(&feed.rss_url).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let message = match &result {
            Ok(_) => None,
            Err(e) => {
                let chain = error_chain(e);
                if e.is_network_absence() {
                    tracing::info!(feed = %feed.rss_url, error = %chain, "Feed unreachable");
                } else {
                    tracing::warn!(feed = %feed.rss_url, error = %chain, "Feed synchronization failed");
                }
                Some(chain)
            }
        };

        NewFeedSynchronization {
            feed_id: feed.id,
            success: result.is_ok(),
            message,
            duration_ms,
            created_at: Utc::now().timestamp(),
        }
    }
}
