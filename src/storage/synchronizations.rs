use std::collections::BTreeSet;

use super::schema::Database;
use super::types::{DatabaseError, FeedSynchronization, NewFeedSynchronization};

impl Database {
    // ========================================================================
    // Synchronization History
    // ========================================================================

    /// Write the outcomes of a pass and prune each touched feed's history to
    /// the newest `retention` records, in a single transaction.
    pub async fn record_synchronizations(
        &self,
        records: &[NewFeedSynchronization],
        retention: i64,
    ) -> Result<(), DatabaseError> {
        if records.is_empty() {
            return Ok(());
        }

        let _writes = self.lock_writes().await;
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                "INSERT INTO feed_synchronizations (feed_id, success, message, duration_ms, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(record.feed_id)
            .bind(record.success)
            .bind(&record.message)
            .bind(record.duration_ms)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
        }

        let feed_ids: BTreeSet<i64> = records.iter().map(|r| r.feed_id).collect();
        for feed_id in feed_ids {
            sqlx::query(
                r#"
                    DELETE FROM feed_synchronizations
                    WHERE feed_id = ? AND id NOT IN (
                        SELECT id FROM feed_synchronizations
                        WHERE feed_id = ?
                        ORDER BY created_at DESC, id DESC
                        LIMIT ?
                    )
                "#,
            )
            .bind(feed_id)
            .bind(feed_id)
            .bind(retention.max(0))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Synchronization history of a feed, newest first.
    pub async fn synchronizations_for_feed(
        &self,
        feed_id: i64,
    ) -> Result<Vec<FeedSynchronization>, DatabaseError> {
        let records = sqlx::query_as(
            "SELECT * FROM feed_synchronizations WHERE feed_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
