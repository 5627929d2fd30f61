use std::fmt;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::trace;

use super::{LockLease, LockService};
use crate::error::{CoordError, Result};

/// Transaction-scoped Postgres advisory locks.
///
/// Each lease holds an open transaction for as long as the lock is held; the
/// lock goes away when that transaction rolls back, or when the connection
/// drops.
#[derive(Debug, Clone)]
pub struct PgAdvisoryLocks {
    pool: PgPool,
}

impl PgAdvisoryLocks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockService for PgAdvisoryLocks {
    async fn try_acquire(&self, mutex_id: i64) -> Result<Option<Box<dyn LockLease>>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoordError::from_sqlx("begin mutex transaction", e))?;

        let acquired = try_advisory_lock(&mut tx, mutex_id).await?;
        if !acquired {
            tx.rollback()
                .await
                .map_err(|e| CoordError::from_sqlx("rollback mutex attempt", e))?;
            return Ok(None);
        }

        trace!(mutex_id, "advisory lock taken");
        Ok(Some(Box::new(PgAdvisoryLease { mutex_id, tx })))
    }
}

/// A held advisory lock and the transaction that owns it.
pub struct PgAdvisoryLease {
    mutex_id: i64,
    tx: Transaction<'static, Postgres>,
}

impl fmt::Debug for PgAdvisoryLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgAdvisoryLease")
            .field("mutex_id", &self.mutex_id)
            .finish()
    }
}

#[async_trait]
impl LockLease for PgAdvisoryLease {
    fn mutex_id(&self) -> i64 {
        self.mutex_id
    }

    /// Re-taking a lock this transaction already holds succeeds at once; the
    /// round trip also keeps the transaction from idling out.
    async fn renew(&mut self) -> Result<bool> {
        try_advisory_lock(&mut self.tx, self.mutex_id).await
    }

    async fn release(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| CoordError::from_sqlx("release advisory lock", e))
    }
}

async fn try_advisory_lock(
    tx: &mut Transaction<'static, Postgres>,
    mutex_id: i64,
) -> Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock($1)")
        .bind(mutex_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| CoordError::from_sqlx("pg_try_advisory_xact_lock", e))
}
