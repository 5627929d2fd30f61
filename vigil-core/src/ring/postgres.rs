use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::schedule::{Ticker, jittered_guard};
use super::{
    RemovalMode, RingEvent, RingSubscription, RotationRing, Schedule,
    advance_cursor, rotation_window,
};
use crate::bus::{Notification, NotificationBus, notify, path_join};
use crate::config::RingConfig;
use crate::error::{CoordError, Result};

/// Ring whose membership and cursors live in Postgres.
#[derive(Clone)]
pub struct PostgresRing {
    pool: PgPool,
    bus: Arc<NotificationBus>,
    namespace: String,
    name: String,
    config: RingConfig,
    tasks: TaskTracker,
}

impl fmt::Debug for PostgresRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresRing")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("config", &self.config)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

enum Advance {
    Advanced(String),
    NotDue,
    Empty,
}

impl PostgresRing {
    pub fn new(
        pool: PgPool,
        bus: Arc<NotificationBus>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        config: RingConfig,
    ) -> Self {
        Self {
            pool,
            bus,
            namespace: namespace.into(),
            name: name.into(),
            config,
            tasks: TaskTracker::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for every subscription task to finish. Subscriptions end when
    /// their scopes are cancelled; no new subscriptions are accepted after
    /// this is called.
    pub async fn close(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn ensure_ring(&self, conn: &mut PgConnection) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO rings (namespace, name)
            VALUES ($1, $2)
            ON CONFLICT (namespace, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(&self.namespace)
        .bind(&self.name)
        .fetch_one(conn)
        .await
        .map_err(|e| CoordError::from_sqlx("register ring", e))
    }
}

/// Stored TTL in milliseconds, zero meaning no expiry. Nonzero TTLs below a
/// millisecond round up so they still expire.
fn ttl_millis(ttl: Option<Duration>) -> Result<i64> {
    let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) else {
        return Ok(0);
    };
    i64::try_from(ttl.as_millis().max(1)).map_err(|_| {
        CoordError::NotValid(format!("ring membership ttl {ttl:?} is too long"))
    })
}

#[async_trait]
impl RotationRing for PostgresRing {
    async fn add(&self, item: &str, ttl: Option<Duration>) -> Result<()> {
        let ttl_ms = ttl_millis(ttl)?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            CoordError::from_sqlx("begin ring add", e)
        })?;
        let ring_id = self.ensure_ring(&mut tx).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ring_members (ring_id, entity_id, expires_at)
            SELECT $1,
                   entities.id,
                   CASE WHEN $4::bigint > 0
                        THEN now() + $4::bigint * INTERVAL '1 millisecond'
                   END
            FROM entities
            WHERE entities.namespace = $2 AND entities.name = $3
            ON CONFLICT (ring_id, entity_id)
            DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(ring_id)
        .bind(&self.namespace)
        .bind(item)
        .bind(ttl_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoordError::from_sqlx("add ring member", e))?
        .rows_affected();

        if inserted == 0 {
            return Err(CoordError::NotFound(format!(
                "entity {}/{item}",
                self.namespace
            )));
        }

        tx.commit()
            .await
            .map_err(|e| CoordError::from_sqlx("commit ring add", e))?;
        trace!(ring = %self.name, %item, ttl_ms, "ring member added");
        Ok(())
    }

    async fn remove(&self, item: &str, mode: RemovalMode) -> Result<()> {
        match mode {
            RemovalMode::Membership => {
                sqlx::query(
                    r#"
                    DELETE FROM ring_members
                    USING rings, entities
                    WHERE ring_members.ring_id = rings.id
                      AND ring_members.entity_id = entities.id
                      AND rings.namespace = $1
                      AND rings.name = $2
                      AND entities.namespace = $1
                      AND entities.name = $3
                    "#,
                )
                .bind(&self.namespace)
                .bind(&self.name)
                .bind(item)
                .execute(&self.pool)
                .await
                .map_err(|e| CoordError::from_sqlx("remove ring member", e))?;
            }
            RemovalMode::DeleteEntity => {
                sqlx::query("DELETE FROM entities WHERE namespace = $1 AND name = $2")
                    .bind(&self.namespace)
                    .bind(item)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| CoordError::from_sqlx("delete ring entity", e))?;
            }
        }
        trace!(ring = %self.name, %item, ?mode, "ring member removed");
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT NOT EXISTS (
                SELECT 1
                FROM ring_members
                JOIN rings ON rings.id = ring_members.ring_id
                WHERE rings.namespace = $1
                  AND rings.name = $2
                  AND (ring_members.expires_at IS NULL OR ring_members.expires_at > now())
            )
            "#,
        )
        .bind(&self.namespace)
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoordError::from_sqlx("ring emptiness check", e))
    }

    async fn subscribe(
        &self,
        scope: &CancellationToken,
        subscription: RingSubscription,
    ) -> Result<mpsc::Receiver<RingEvent>> {
        subscription.validate()?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            CoordError::from_sqlx("begin ring subscribe", e)
        })?;
        let ring_id = self.ensure_ring(&mut tx).await?;
        sqlx::query(
            r#"
            INSERT INTO ring_subscriptions (ring_id, name, pointer, advanced_at)
            VALUES ($1, $2, NULL, now())
            ON CONFLICT (ring_id, name) DO NOTHING
            "#,
        )
        .bind(ring_id)
        .bind(&subscription.name)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoordError::from_sqlx("register ring subscription", e))?;
        tx.commit()
            .await
            .map_err(|e| CoordError::from_sqlx("commit ring subscribe", e))?;

        let context = SubscriptionContext {
            pool: self.pool.clone(),
            namespace: self.namespace.clone(),
            ring: self.name.clone(),
            ring_id,
            subscription: subscription.name.clone(),
            items: subscription.items,
            jitter_ratio: self.config.advance_jitter_ratio,
        };

        // Register interest before the first read so no advance slips
        // between the startup window and the first notification.
        let notifications = self
            .bus
            .subscribe(scope, &self.namespace, &context.channel())
            .await?;
        let (events, receiver) = mpsc::channel(self.config.event_capacity.max(1));

        info!(
            namespace = %self.namespace,
            ring = %self.name,
            subscription = %subscription.name,
            items = subscription.items,
            schedule = ?subscription.schedule,
            "ring subscription started"
        );

        self.tasks.spawn(produce(
            context.clone(),
            notifications,
            events,
            subscription.schedule.clone(),
            scope.clone(),
            self.tasks.clone(),
        ));
        let ticker = Ticker::start(&subscription.schedule, scope, &self.tasks);
        self.tasks.spawn(manage(context, ticker, scope.clone()));

        Ok(receiver)
    }
}

#[derive(Clone)]
struct SubscriptionContext {
    pool: PgPool,
    namespace: String,
    ring: String,
    ring_id: i64,
    subscription: String,
    items: usize,
    jitter_ratio: f32,
}

impl SubscriptionContext {
    /// Notification name, qualified by ring so identically named
    /// subscriptions on different rings stay apart.
    fn channel(&self) -> String {
        path_join(&self.ring, &self.subscription)
    }

    async fn members(&self, conn: &mut PgConnection) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT entities.name
            FROM ring_members
            JOIN entities ON entities.id = ring_members.entity_id
            WHERE ring_members.ring_id = $1
              AND (ring_members.expires_at IS NULL OR ring_members.expires_at > now())
            ORDER BY entities.name COLLATE "C"
            "#,
        )
        .bind(self.ring_id)
        .fetch_all(conn)
        .await
        .map_err(|e| CoordError::from_sqlx("load ring members", e))
    }

    /// Read the cursor and membership from one snapshot and build the window.
    async fn window(&self) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            CoordError::from_sqlx("begin ring window read", e)
        })?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| CoordError::from_sqlx("set ring window isolation", e))?;

        let pointer = sqlx::query_scalar::<_, Option<String>>(
            "SELECT pointer FROM ring_subscriptions WHERE ring_id = $1 AND name = $2",
        )
        .bind(self.ring_id)
        .bind(&self.subscription)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoordError::from_sqlx("load ring cursor", e))?
        .ok_or_else(|| {
            CoordError::NotFound(format!(
                "ring subscription {}/{}",
                self.ring, self.subscription
            ))
        })?;
        let members = self.members(&mut tx).await?;

        tx.rollback()
            .await
            .map_err(|e| CoordError::from_sqlx("end ring window read", e))?;
        Ok(rotation_window(&members, pointer.as_deref(), self.items))
    }

    /// Advance the cursor if no backend has done so within `guard`.
    async fn advance(&self, guard: Duration) -> Result<Advance> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            CoordError::from_sqlx("begin ring advance", e)
        })?;

        let row = sqlx::query_as::<_, (Option<String>, bool)>(
            r#"
            SELECT pointer,
                   now() - advanced_at >= $3::bigint * INTERVAL '1 millisecond'
            FROM ring_subscriptions
            WHERE ring_id = $1 AND name = $2
            FOR UPDATE
            "#,
        )
        .bind(self.ring_id)
        .bind(&self.subscription)
        .bind(guard.as_millis() as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoordError::from_sqlx("lock ring cursor", e))?;

        let Some((pointer, due)) = row else {
            return Err(CoordError::NotFound(format!(
                "ring subscription {}/{}",
                self.ring, self.subscription
            )));
        };
        if !due {
            tx.rollback()
                .await
                .map_err(|e| CoordError::from_sqlx("rollback ring advance", e))?;
            return Ok(Advance::NotDue);
        }

        sqlx::query(
            r#"
            DELETE FROM ring_members
            WHERE ring_id = $1 AND expires_at IS NOT NULL AND expires_at <= now()
            "#,
        )
        .bind(self.ring_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoordError::from_sqlx("purge expired ring members", e))?;

        let members = self.members(&mut tx).await?;
        let Some(next) = advance_cursor(&members, pointer.as_deref(), self.items) else {
            tx.commit()
                .await
                .map_err(|e| CoordError::from_sqlx("commit ring purge", e))?;
            return Ok(Advance::Empty);
        };

        sqlx::query(
            r#"
            UPDATE ring_subscriptions
            SET pointer = $3, advanced_at = now()
            WHERE ring_id = $1 AND name = $2
            "#,
        )
        .bind(self.ring_id)
        .bind(&self.subscription)
        .bind(&next)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoordError::from_sqlx("advance ring cursor", e))?;

        notify(&mut *tx, &self.namespace, &self.channel(), &next).await?;

        tx.commit()
            .await
            .map_err(|e| CoordError::from_sqlx("commit ring advance", e))?;
        Ok(Advance::Advanced(next))
    }

    /// Send the current window. Returns false once nobody is listening.
    async fn emit(
        &self,
        events: &mpsc::Sender<RingEvent>,
        scope: &CancellationToken,
    ) -> bool {
        let event = match self.window().await {
            Ok(values) => RingEvent::Trigger { values },
            Err(err) => {
                warn!(
                    ring = %self.ring,
                    subscription = %self.subscription,
                    error = %err,
                    "failed to read ring window"
                );
                RingEvent::Error {
                    message: err.to_string(),
                }
            }
        };

        tokio::select! {
            _ = scope.cancelled() => false,
            sent = events.send(event) => sent.is_ok(),
        }
    }
}

async fn manage(
    context: SubscriptionContext,
    mut ticker: Ticker,
    scope: CancellationToken,
) {
    while let Some(period) = ticker.tick(&scope).await {
        let guard = jittered_guard(period, context.jitter_ratio);
        let outcome = tokio::select! {
            _ = scope.cancelled() => break,
            outcome = context.advance(guard) => outcome,
        };

        match outcome {
            Ok(Advance::Advanced(pointer)) => {
                debug!(
                    ring = %context.ring,
                    subscription = %context.subscription,
                    %pointer,
                    "ring rotation advanced"
                );
            }
            Ok(Advance::NotDue) => {
                debug!(
                    ring = %context.ring,
                    subscription = %context.subscription,
                    "ring rotation already advanced this interval"
                );
            }
            Ok(Advance::Empty) => {
                trace!(
                    ring = %context.ring,
                    subscription = %context.subscription,
                    "ring is empty; nothing to advance"
                );
            }
            Err(err) => {
                warn!(
                    ring = %context.ring,
                    subscription = %context.subscription,
                    error = %err,
                    "ring rotation advance failed"
                );
            }
        }
    }
    debug!(
        ring = %context.ring,
        subscription = %context.subscription,
        "ring manage task stopped"
    );
}

async fn produce(
    context: SubscriptionContext,
    mut notifications: mpsc::Receiver<Notification>,
    events: mpsc::Sender<RingEvent>,
    schedule: Schedule,
    scope: CancellationToken,
    tasks: TaskTracker,
) {
    if !context.emit(&events, &scope).await {
        return;
    }

    let mut fallback: Option<Ticker> = None;
    loop {
        if let Some(ticker) = fallback.as_mut() {
            if ticker.tick(&scope).await.is_none() {
                break;
            }
        } else {
            tokio::select! {
                _ = scope.cancelled() => break,
                received = notifications.recv() => {
                    if received.is_none() {
                        if scope.is_cancelled() {
                            break;
                        }
                        warn!(
                            ring = %context.ring,
                            subscription = %context.subscription,
                            "ring notifications ended; polling on schedule"
                        );
                        fallback = Some(Ticker::start(&schedule, &scope, &tasks));
                        continue;
                    }
                }
            }
        }

        if !context.emit(&events, &scope).await {
            break;
        }
    }
    debug!(
        ring = %context.ring,
        subscription = %context.subscription,
        "ring produce task stopped"
    );
}
