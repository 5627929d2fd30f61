use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;
use vigil_core::CoordError;
use vigil_core::config::MutexConfig;
use vigil_core::mutex::{LockService, PgAdvisoryLocks, SynchronizedExecutor};

fn executor(pool: &PgPool) -> SynchronizedExecutor {
    SynchronizedExecutor::new(
        Arc::new(PgAdvisoryLocks::new(pool.clone())),
        MutexConfig {
            check_in_interval_ms: 25,
        },
    )
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn advisory_lock_excludes_other_transactions(pool: PgPool) -> Result<()> {
    let locks = PgAdvisoryLocks::new(pool.clone());
    let mut lease = locks.try_acquire(1001).await?.expect("free lock");
    assert!(locks.try_acquire(1001).await?.is_none());
    assert!(lease.renew().await?);

    let other = locks.try_acquire(1002).await?.expect("different id is free");
    other.release().await?;

    lease.release().await?;
    let again = locks.try_acquire(1001).await?.expect("released lock is free");
    again.release().await?;
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn same_mutex_serializes_executors(pool: PgPool) -> Result<()> {
    let inside = Arc::new(AtomicBool::new(false));
    let scope = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let exec = executor(&pool);
        let inside = Arc::clone(&inside);
        let scope = scope.clone();
        handles.push(tokio::spawn(async move {
            exec.execute(&scope, 2002, |_token| async move {
                assert!(!inside.swap(true, Ordering::SeqCst), "critical sections overlapped");
                tokio::time::sleep(Duration::from_millis(100)).await;
                inside.store(false, Ordering::SeqCst);
                Ok(())
            })
            .await
        }));
    }

    for handle in handles {
        handle.await??;
    }
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn different_mutexes_overlap(pool: PgPool) -> Result<()> {
    let barrier = Arc::new(Barrier::new(2));
    let scope = CancellationToken::new();

    let run = |mutex_id: i64| {
        let exec = executor(&pool);
        let barrier = Arc::clone(&barrier);
        let scope = scope.clone();
        async move {
            exec.execute(&scope, mutex_id, |_token| async move {
                barrier.wait().await;
                Ok(())
            })
            .await
        }
    };

    let (a, b) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(run(3001), run(3002))
    })
    .await?;
    a?;
    b?;
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn waiting_executor_gives_up_when_scope_ends(pool: PgPool) -> Result<()> {
    let locks = PgAdvisoryLocks::new(pool.clone());
    let held = locks.try_acquire(4004).await?.expect("free lock");

    let scope = CancellationToken::new();
    let canceller = scope.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let result = executor(&pool)
        .execute(&scope, 4004, |_token| async { Ok(()) })
        .await;
    assert!(matches!(result, Err(CoordError::Cancelled(_))));

    held.release().await?;
    Ok(())
}
