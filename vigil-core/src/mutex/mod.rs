//! Cluster-wide mutual exclusion for critical sections.
//!
//! A [`SynchronizedExecutor`] polls a [`LockService`] until it obtains a
//! lease on the mutex id, runs the handler, and renews the lease in the
//! background while the handler runs. Losing the lease cancels the handler's
//! scope; it never turns into an error from `execute`.

mod postgres;

pub use postgres::{PgAdvisoryLease, PgAdvisoryLocks};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::MutexConfig;
use crate::error::{CoordError, Result};

/// Source of exclusive leases keyed by a caller-chosen integer.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Take the lock without waiting. `None` means another holder has it.
    async fn try_acquire(&self, mutex_id: i64) -> Result<Option<Box<dyn LockLease>>>;
}

/// A held lock. Dropping a lease without calling `release` must also give
/// the lock up.
#[async_trait]
pub trait LockLease: Send {
    fn mutex_id(&self) -> i64;

    /// Re-assert the lock. `Ok(false)` means it is no longer held.
    async fn renew(&mut self) -> Result<bool>;

    async fn release(self: Box<Self>) -> Result<()>;
}

/// Runs handlers while holding a named lock.
#[derive(Clone)]
pub struct SynchronizedExecutor {
    locks: Arc<dyn LockService>,
    check_in_interval: Duration,
}

impl fmt::Debug for SynchronizedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedExecutor")
            .field("check_in_interval", &self.check_in_interval)
            .finish()
    }
}

impl SynchronizedExecutor {
    pub fn new(locks: Arc<dyn LockService>, config: MutexConfig) -> Self {
        Self {
            locks,
            check_in_interval: config.check_in_interval(),
        }
    }

    /// Run `handler` while holding `mutex_id`.
    ///
    /// Waits, polling every check-in interval, until the lock is free; returns
    /// `Cancelled` if `scope` ends first. The handler receives a scope that
    /// is cancelled when `scope` ends or the lock is lost, and its result is
    /// returned once the lock is released.
    pub async fn execute<F, Fut, T>(
        &self,
        scope: &CancellationToken,
        mutex_id: i64,
        handler: F,
    ) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.acquire(scope, mutex_id).await?;
        debug!(mutex_id, "mutex acquired");

        let handler_scope = scope.child_token();
        let handler_done = CancellationToken::new();
        let renewer = tokio::spawn(hold_lease(
            lease,
            self.check_in_interval,
            handler_scope.clone(),
            handler_done.clone(),
        ));

        let result = {
            let _scope_guard = handler_scope.clone().drop_guard();
            let _done_guard = handler_done.drop_guard();
            handler(handler_scope.clone()).await
        };

        match renewer.await {
            Ok(Some(lease)) => {
                if let Err(err) = lease.release().await {
                    warn!(mutex_id, error = %err, "failed to release mutex");
                } else {
                    debug!(mutex_id, "mutex released");
                }
            }
            Ok(None) => {
                debug!(mutex_id, "mutex dropped with a renewal in flight");
            }
            Err(err) => {
                warn!(mutex_id, error = %err, "mutex renewal task failed");
            }
        }

        result
    }

    async fn acquire(
        &self,
        scope: &CancellationToken,
        mutex_id: i64,
    ) -> Result<Box<dyn LockLease>> {
        loop {
            if scope.is_cancelled() {
                return Err(CoordError::Cancelled(format!(
                    "waiting for mutex {mutex_id}"
                )));
            }
            if let Some(lease) = self.locks.try_acquire(mutex_id).await? {
                return Ok(lease);
            }
            trace!(mutex_id, "mutex held elsewhere; waiting");

            tokio::select! {
                _ = scope.cancelled() => {
                    return Err(CoordError::Cancelled(format!(
                        "waiting for mutex {mutex_id}"
                    )));
                }
                _ = tokio::time::sleep(self.check_in_interval) => {}
            }
        }
    }
}

/// Renew `lease` every `every` until the handler returns (`handler_done`). A
/// failed renewal cancels `handler_scope`. A renewal still in flight when the
/// handler returns is abandoned and the lease dropped, so the caller never
/// waits on a stalled connection; `None` is returned in that case.
async fn hold_lease(
    mut lease: Box<dyn LockLease>,
    every: Duration,
    handler_scope: CancellationToken,
    handler_done: CancellationToken,
) -> Option<Box<dyn LockLease>> {
    let mutex_id = lease.mutex_id();
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = handler_done.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let renewed = tokio::select! {
            _ = handler_done.cancelled() => return None,
            renewed = lease.renew() => renewed,
        };
        match renewed {
            Ok(true) => trace!(mutex_id, "mutex renewed"),
            Ok(false) => {
                warn!(mutex_id, "mutex lost; cancelling handler");
                handler_scope.cancel();
                break;
            }
            Err(err) => {
                warn!(mutex_id, error = %err, "mutex renewal failed; cancelling handler");
                handler_scope.cancel();
                break;
            }
        }
    }
    Some(lease)
}

/// Lock table for a single process.
#[derive(Debug, Default)]
pub struct InProcLocks {
    table: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl InProcLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for InProcLocks {
    async fn try_acquire(&self, mutex_id: i64) -> Result<Option<Box<dyn LockLease>>> {
        let slot = {
            let mut table = self.table.lock().await;
            Arc::clone(table.entry(mutex_id).or_default())
        };
        Ok(slot.try_lock_owned().ok().map(|guard| {
            Box::new(InProcLease {
                mutex_id,
                _guard: guard,
            }) as Box<dyn LockLease>
        }))
    }
}

struct InProcLease {
    mutex_id: i64,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl LockLease for InProcLease {
    fn mutex_id(&self) -> i64 {
        self.mutex_id
    }

    async fn renew(&mut self) -> Result<bool> {
        Ok(true)
    }

    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    fn executor(locks: Arc<dyn LockService>, interval_ms: u64) -> SynchronizedExecutor {
        SynchronizedExecutor::new(
            locks,
            MutexConfig {
                check_in_interval_ms: interval_ms,
            },
        )
    }

    #[tokio::test]
    async fn same_mutex_never_overlaps() {
        let exec = executor(Arc::new(InProcLocks::new()), 10);
        let inside = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));
        let scope = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let exec = exec.clone();
            let inside = Arc::clone(&inside);
            let runs = Arc::clone(&runs);
            let scope = scope.clone();
            handles.push(tokio::spawn(async move {
                exec.execute(&scope, 42, |_token| async move {
                    assert!(!inside.swap(true, Ordering::SeqCst), "handlers overlapped");
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    inside.store(false, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn different_mutexes_run_concurrently() {
        let exec = executor(Arc::new(InProcLocks::new()), 10);
        let barrier = Arc::new(Barrier::new(2));
        let scope = CancellationToken::new();

        let run = |mutex_id: i64| {
            let exec = exec.clone();
            let barrier = Arc::clone(&barrier);
            let scope = scope.clone();
            async move {
                exec.execute(&scope, mutex_id, |_token| async move {
                    barrier.wait().await;
                    Ok(mutex_id)
                })
                .await
            }
        };

        let both = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(run(1), run(2))
        })
        .await
        .expect("handlers on different ids must overlap");
        assert_eq!(both.0.unwrap(), 1);
        assert_eq!(both.1.unwrap(), 2);
    }

    #[tokio::test]
    async fn handler_result_is_returned() {
        let exec = executor(Arc::new(InProcLocks::new()), 10);
        let scope = CancellationToken::new();
        let err = exec
            .execute(&scope, 7, |_token| async {
                Err::<(), _>(CoordError::NotValid("bad check".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NotValid(_)));

        // The lock was released despite the handler error.
        let value = exec.execute(&scope, 7, |_token| async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn cancelled_while_waiting_skips_handler() {
        let locks = Arc::new(InProcLocks::new());
        let _held = locks.try_acquire(9).await.unwrap().expect("lock is free");
        let exec = executor(locks.clone(), 10);

        let scope = CancellationToken::new();
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let result = exec
            .execute(&scope, 9, |_token| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CoordError::Cancelled(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    struct LosingLocks;

    struct LosingLease;

    #[async_trait]
    impl LockService for LosingLocks {
        async fn try_acquire(&self, _mutex_id: i64) -> Result<Option<Box<dyn LockLease>>> {
            Ok(Some(Box::new(LosingLease)))
        }
    }

    #[async_trait]
    impl LockLease for LosingLease {
        fn mutex_id(&self) -> i64 {
            3
        }

        async fn renew(&mut self) -> Result<bool> {
            Err(CoordError::Internal("connection reset".into()))
        }

        async fn release(self: Box<Self>) -> Result<()> {
            Err(CoordError::Internal("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn lost_lock_cancels_handler_without_error() {
        let exec = executor(Arc::new(LosingLocks), 20);
        let scope = CancellationToken::new();
        let started = Instant::now();

        let outcome = exec
            .execute(&scope, 3, |token| async move {
                tokio::time::timeout(Duration::from_secs(2), token.cancelled())
                    .await
                    .map_err(|_| CoordError::Internal("handler never cancelled".into()))
            })
            .await;

        assert!(outcome.is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!scope.is_cancelled());
    }

    struct StallingLocks {
        dropped: Arc<AtomicBool>,
    }

    struct StallingLease {
        dropped: Arc<AtomicBool>,
    }

    impl Drop for StallingLease {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LockService for StallingLocks {
        async fn try_acquire(&self, _mutex_id: i64) -> Result<Option<Box<dyn LockLease>>> {
            Ok(Some(Box::new(StallingLease {
                dropped: Arc::clone(&self.dropped),
            })))
        }
    }

    #[async_trait]
    impl LockLease for StallingLease {
        fn mutex_id(&self) -> i64 {
            4
        }

        async fn renew(&mut self) -> Result<bool> {
            Ok(std::future::pending::<bool>().await)
        }

        async fn release(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_renewal_does_not_hold_up_execute() {
        let dropped = Arc::new(AtomicBool::new(false));
        let exec = executor(
            Arc::new(StallingLocks {
                dropped: Arc::clone(&dropped),
            }),
            10,
        );
        let scope = CancellationToken::new();

        let value = tokio::time::timeout(
            Duration::from_secs(2),
            exec.execute(&scope, 4, |_token| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(11)
            }),
        )
        .await
        .expect("execute returns once the handler does")
        .unwrap();

        assert_eq!(value, 11);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
