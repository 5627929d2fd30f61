use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::{
    MonitorRequest, OperatorFilter, OperatorKey, OperatorPresence, OperatorState,
};
use crate::config::PresenceConfig;
use crate::error::{CoordError, Result};

const OPERATOR_COLUMNS: &str = "id, namespace, op_type, name, controller_id, present, \
     last_update, check_in_timeout_ms, metadata";

#[derive(sqlx::FromRow)]
struct OperatorRow {
    id: i64,
    namespace: String,
    op_type: String,
    name: String,
    controller_id: Option<i64>,
    present: bool,
    last_update: DateTime<Utc>,
    check_in_timeout_ms: i64,
    metadata: Option<serde_json::Value>,
}

impl OperatorRow {
    fn key(&self) -> Result<OperatorKey> {
        Ok(OperatorKey {
            namespace: self.namespace.clone(),
            op_type: self.op_type.parse().map_err(|_| {
                CoordError::Internal(format!(
                    "operator {} has unknown type {:?}",
                    self.id, self.op_type
                ))
            })?,
            name: self.name.clone(),
        })
    }

    fn into_state(self, controller: Option<OperatorKey>) -> Result<OperatorState> {
        let key = self.key()?;
        Ok(OperatorState {
            key,
            controller,
            present: self.present,
            last_update: Some(self.last_update),
            check_in_timeout: Duration::from_millis(self.check_in_timeout_ms.max(0) as u64),
            metadata: self.metadata,
        })
    }
}

/// Resolves controller ids to keys, remembering every id it has looked up.
#[derive(Default)]
struct ControllerCache {
    keys: HashMap<i64, Option<OperatorKey>>,
}

impl ControllerCache {
    async fn resolve(
        &mut self,
        conn: &mut PgConnection,
        id: Option<i64>,
    ) -> Result<Option<OperatorKey>> {
        let Some(id) = id else {
            return Ok(None);
        };
        if let Some(key) = self.keys.get(&id) {
            return Ok(key.clone());
        }

        let row = sqlx::query_as::<_, (String, String, String)>(
            "SELECT namespace, op_type, name FROM operators WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| CoordError::from_sqlx("resolve operator controller", e))?;

        let key = match row {
            Some((namespace, op_type, name)) => Some(OperatorKey {
                namespace,
                op_type: op_type.parse().map_err(|_| {
                    CoordError::Internal(format!(
                        "controller {id} has unknown type {op_type:?}"
                    ))
                })?,
                name,
            }),
            None => None,
        };
        self.keys.insert(id, key.clone());
        Ok(key)
    }
}

/// Presence coordinator backed by the `operators` table.
#[derive(Debug, Clone)]
pub struct PostgresOperatorPresence {
    pool: PgPool,
    config: PresenceConfig,
    tasks: TaskTracker,
}

impl PostgresOperatorPresence {
    pub fn new(pool: PgPool, config: PresenceConfig) -> Self {
        Self {
            pool,
            config,
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Wait for every monitor loop to stop. Loops stop when their scopes end.
    pub async fn close(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn operator_id(
        conn: &mut PgConnection,
        key: &OperatorKey,
    ) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM operators WHERE namespace = $1 AND op_type = $2 AND name = $3",
        )
        .bind(&key.namespace)
        .bind(key.op_type.as_str())
        .bind(&key.name)
        .fetch_optional(conn)
        .await
        .map_err(|e| CoordError::from_sqlx("look up operator", e))
    }

    /// One monitor pass. Commits only when it returns a non-empty batch.
    async fn monitor_tick(
        pool: &PgPool,
        request: &MonitorRequest,
    ) -> Result<Vec<OperatorState>> {
        let monitored = request.op_type.as_str();
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| CoordError::from_sqlx("begin monitor tick", e))?;

        let absent = sqlx::query(
            r#"
            UPDATE operators
            SET present = FALSE, notify = TRUE
            WHERE op_type = $1
              AND present
              AND now() - last_update >= check_in_timeout_ms * INTERVAL '1 millisecond'
            "#,
        )
        .bind(monitored)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoordError::from_sqlx("mark absent operators", e))?
        .rows_affected();

        let reassigned = sqlx::query(
            r#"
            WITH replacement AS (
                SELECT id
                FROM operators
                WHERE namespace = $2
                  AND op_type = $3
                  AND present
                  AND now() - last_update < check_in_timeout_ms * INTERVAL '1 millisecond'
                ORDER BY name COLLATE "C"
                LIMIT 1
            )
            UPDATE operators AS o
            SET controller_id = replacement.id, notify = TRUE
            FROM replacement
            WHERE o.op_type = $1
              AND o.namespace = $2
              AND o.id <> replacement.id
              AND NOT EXISTS (
                  SELECT 1
                  FROM operators AS c
                  WHERE c.id = o.controller_id
                    AND c.present
                    AND now() - c.last_update < c.check_in_timeout_ms * INTERVAL '1 millisecond'
              )
            "#,
        )
        .bind(monitored)
        .bind(&request.controller_namespace)
        .bind(request.controller_type.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| CoordError::from_sqlx("reassign dangling operators", e))?
        .rows_affected();

        if absent > 0 || reassigned > 0 {
            debug!(
                op_type = monitored,
                absent, reassigned, "presence sweep updated operators"
            );
        }

        let Some(controller_id) =
            Self::operator_id(&mut tx, &request.controller_key()).await?
        else {
            tx.rollback()
                .await
                .map_err(|e| CoordError::from_sqlx("rollback monitor tick", e))?;
            return Ok(Vec::new());
        };

        let query = format!(
            r#"
            SELECT {OPERATOR_COLUMNS}
            FROM operators
            WHERE op_type = $1
              AND controller_id = $2
              AND ($3 OR notify)
            ORDER BY namespace COLLATE "C", name COLLATE "C"
            FOR UPDATE
            "#
        );
        let rows = sqlx::query_as::<_, OperatorRow>(&query)
            .bind(monitored)
            .bind(controller_id)
            .bind(request.micromanage)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| CoordError::from_sqlx("collect monitored operators", e))?;

        if rows.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| CoordError::from_sqlx("rollback monitor tick", e))?;
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let mut cache = ControllerCache::default();
        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            let controller = cache.resolve(&mut tx, row.controller_id).await?;
            batch.push(row.into_state(controller)?);
        }

        sqlx::query("UPDATE operators SET notify = FALSE WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoordError::from_sqlx("acknowledge operator changes", e))?;

        tx.commit()
            .await
            .map_err(|e| CoordError::from_sqlx("commit monitor tick", e))?;
        Ok(batch)
    }
}

#[async_trait]
impl OperatorPresence for PostgresOperatorPresence {
    async fn check_in(&self, state: &OperatorState) -> Result<()> {
        state.validate()?;
        let timeout_ms = i64::try_from(state.check_in_timeout.as_millis()).map_err(|_| {
            CoordError::NotValid(format!(
                "check-in timeout {:?} is too long",
                state.check_in_timeout
            ))
        })?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoordError::from_sqlx("begin check-in", e))?;

        let controller_id = match &state.controller {
            Some(controller) => Some(
                Self::operator_id(&mut tx, controller)
                    .await?
                    .ok_or_else(|| {
                        CoordError::NotFound(format!("controller {controller}"))
                    })?,
            ),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO operators AS o (
                namespace, op_type, name, controller_id, present,
                last_update, check_in_timeout_ms, metadata, notify
            )
            VALUES ($1, $2, $3, $4, $5, now(), $6, $7, TRUE)
            ON CONFLICT (namespace, op_type, name) DO UPDATE SET
                controller_id = EXCLUDED.controller_id,
                present = EXCLUDED.present,
                last_update = now(),
                check_in_timeout_ms = EXCLUDED.check_in_timeout_ms,
                metadata = EXCLUDED.metadata,
                notify = o.notify
                    OR o.present IS DISTINCT FROM EXCLUDED.present
                    OR o.controller_id IS DISTINCT FROM EXCLUDED.controller_id
                    OR now() - o.last_update >= o.check_in_timeout_ms * INTERVAL '1 millisecond'
            "#,
        )
        .bind(&state.key.namespace)
        .bind(state.key.op_type.as_str())
        .bind(&state.key.name)
        .bind(controller_id)
        .bind(state.present)
        .bind(timeout_ms)
        .bind(&state.metadata)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoordError::from_sqlx("check in operator", e))?;

        tx.commit()
            .await
            .map_err(|e| CoordError::from_sqlx("commit check-in", e))?;
        trace!(operator = %state.key, present = state.present, "operator checked in");
        Ok(())
    }

    async fn check_out(&self, key: &OperatorKey) -> Result<()> {
        let deleted = sqlx::query(
            "DELETE FROM operators WHERE namespace = $1 AND op_type = $2 AND name = $3",
        )
        .bind(&key.namespace)
        .bind(key.op_type.as_str())
        .bind(&key.name)
        .execute(&self.pool)
        .await
        .map_err(|e| CoordError::from_sqlx("check out operator", e))?
        .rows_affected();

        if deleted == 0 {
            return Err(CoordError::NotFound(format!("operator {key}")));
        }
        debug!(operator = %key, "operator checked out");
        Ok(())
    }

    async fn query_operator(&self, key: &OperatorKey) -> Result<OperatorState> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| CoordError::from_sqlx("acquire connection", e))?;

        let query = format!(
            "SELECT {OPERATOR_COLUMNS} FROM operators \
             WHERE namespace = $1 AND op_type = $2 AND name = $3"
        );
        let row = sqlx::query_as::<_, OperatorRow>(&query)
            .bind(&key.namespace)
            .bind(key.op_type.as_str())
            .bind(&key.name)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| CoordError::from_sqlx("query operator", e))?
            .ok_or_else(|| CoordError::NotFound(format!("operator {key}")))?;

        let controller = ControllerCache::default()
            .resolve(&mut conn, row.controller_id)
            .await?;
        row.into_state(controller)
    }

    async fn list_operators(&self, filter: &OperatorFilter) -> Result<Vec<OperatorState>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| CoordError::from_sqlx("acquire connection", e))?;

        let query = format!(
            r#"
            SELECT {OPERATOR_COLUMNS}
            FROM operators
            WHERE ($1::text IS NULL OR namespace = $1)
              AND ($2::text IS NULL OR op_type = $2)
            ORDER BY namespace COLLATE "C", op_type, name COLLATE "C"
            "#
        );
        let rows = sqlx::query_as::<_, OperatorRow>(&query)
            .bind(filter.namespace.as_deref())
            .bind(filter.op_type.map(|op_type| op_type.as_str()))
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| CoordError::from_sqlx("list operators", e))?;

        let mut cache = ControllerCache::default();
        let mut operators = Vec::with_capacity(rows.len());
        for row in rows {
            let controller = cache.resolve(&mut conn, row.controller_id).await?;
            operators.push(row.into_state(controller)?);
        }
        Ok(operators)
    }

    async fn monitor_operators(
        &self,
        scope: &CancellationToken,
        request: MonitorRequest,
    ) -> Result<mpsc::Receiver<Vec<OperatorState>>> {
        request.validate()?;

        let (batches, receiver) = mpsc::channel(self.config.event_capacity.max(1));
        let pool = self.pool.clone();
        let scope = scope.clone();

        info!(
            op_type = %request.op_type,
            controller = %request.controller_key(),
            every_ms = request.every.as_millis() as u64,
            micromanage = request.micromanage,
            "operator monitor started"
        );

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(request.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let outcome = tokio::select! {
                    _ = scope.cancelled() => break,
                    outcome = Self::monitor_tick(&pool, &request) => outcome,
                };

                match outcome {
                    Ok(batch) => {
                        trace!(
                            controller = %request.controller_key(),
                            operators = batch.len(),
                            "operator monitor tick"
                        );
                        let sent = tokio::select! {
                            _ = scope.cancelled() => break,
                            sent = batches.send(batch) => sent,
                        };
                        if sent.is_err() {
                            break;
                        }
                    }
                    Err(err) => match &request.error_handler {
                        Some(handler) => handler(&err),
                        None => warn!(
                            controller = %request.controller_key(),
                            error = %err,
                            "operator monitor tick failed"
                        ),
                    },
                }
            }
            debug!(controller = %request.controller_key(), "operator monitor stopped");
        });

        Ok(receiver)
    }
}
