//! # Vigil Core
//!
//! Coordination kernel for Vigil backends. Any number of backend processes
//! share one Postgres database and use it in place of a dedicated
//! coordination service.
//!
//! ## Overview
//!
//! - **Notification bus** ([`bus`]): demultiplexes `LISTEN`/`NOTIFY`
//!   notifications to per-subscriber queues
//! - **Round-robin rings** ([`ring`]): persisted rotations served to every
//!   subscribed backend on a schedule, advanced at most once per interval
//! - **Operator presence** ([`presence`]): check-in based liveness with
//!   controller failover
//! - **Synchronized executor** ([`mutex`]): advisory-lock mutual exclusion
//!   with lock-loss cancellation
//!
//! All timing that more than one backend has to agree on is measured with
//! the database clock.
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tokio_util::sync::CancellationToken;
//! use vigil_core::bus::{NotificationBus, PgNotificationListener};
//! use vigil_core::ring::{PostgresRing, RingEvent, RingSubscription, RotationRing, Schedule};
//! use vigil_core::CoordinationConfig;
//!
//! async fn rotate(pool: sqlx::PgPool) -> vigil_core::Result<()> {
//!     let config = CoordinationConfig::default();
//!     let listener = PgNotificationListener::connect(&pool, config.bus.queue_capacity).await?;
//!     let bus = Arc::new(NotificationBus::start(Arc::new(listener), config.bus).await?);
//!
//!     let ring = PostgresRing::new(pool, bus, "default", "proxy-entities", config.ring);
//!     ring.add("mulder", None).await?;
//!
//!     let scope = CancellationToken::new();
//!     let schedule = Schedule::interval(Duration::from_secs(10));
//!     let mut events = ring
//!         .subscribe(&scope, RingSubscription::new("check-cpu", 1, schedule))
//!         .await?;
//!     while let Some(RingEvent::Trigger { values }) = events.recv().await {
//!         println!("run check-cpu on {values:?}");
//!     }
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

/// Notification fan-out over storage-engine change notifications
pub mod bus;

/// Tunables for every coordination component
pub mod config;

/// Error taxonomy shared by all components
pub mod error;

/// Distributed mutex with lock-loss detection
pub mod mutex;

/// Operator liveness and controller failover
pub mod presence;

/// Persisted round-robin rotations
pub mod ring;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use config::CoordinationConfig;
pub use error::{CoordError, Result};
