use sqlx::{Sqlite, Transaction};
use tokio::sync::OwnedMutexGuard;

use super::schema::Database;
use super::types::DatabaseError;

/// Write transaction covering the synchronization of a single feed.
///
/// Every removal, insert, update and counter change of one feed goes through
/// the same `SyncTransaction`, so a failure part-way leaves the feed as it
/// was. Dropping it without [`commit`](Self::commit) rolls back.
pub struct SyncTransaction {
    pub(crate) tx: Transaction<'static, Sqlite>,
    // Declared after `tx` so it is released once the transaction has ended
    _writes: OwnedMutexGuard<()>,
}

impl Database {
    /// Begin the transaction for one feed synchronization.
    ///
    /// Waits while another write transaction of this database is open.
    pub async fn begin_sync(&self) -> Result<SyncTransaction, DatabaseError> {
        let writes = self.lock_writes().await;
        let tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        Ok(SyncTransaction {
            tx,
            _writes: writes,
        })
    }
}

impl SyncTransaction {
    pub async fn commit(self) -> Result<(), DatabaseError> {
        self.tx.commit().await.map_err(DatabaseError::from_sqlx)
    }
}
