//! Notification bus: fans storage-engine change notifications out to any
//! number of in-process subscribers.
//!
//! A single demux task drains the listener and delivers each notification to
//! every live subscriber queue registered under its channel, one subscriber at
//! a time. Each subscriber owns a small private queue; a subscriber whose
//! queue stays full past the delivery timeout loses that notification, and
//! delivery moves on to the next subscriber.

mod listener;
pub mod postgres;

pub use listener::{InProcListener, Listener, Notification};
pub use postgres::{PgNotificationListener, notify};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use crate::config::BusConfig;
use crate::error::{CoordError, Result};

/// Postgres truncates identifiers, channel names included, past this length.
pub const MAX_CHANNEL_LEN: usize = 63;

/// Join path segments with `/`, skipping empty segments.
pub fn path_join(namespace: &str, name: &str) -> String {
    [namespace, name]
        .iter()
        .map(|segment| segment.trim_matches('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Channel name for `(namespace, name)`.
///
/// Names longer than [`MAX_CHANNEL_LEN`] bytes are replaced by the URL-safe
/// base64 encoding of their SHA-256 digest. Publishers and subscribers both
/// go through this function.
pub fn channel_name(namespace: &str, name: &str) -> String {
    let joined = path_join(namespace, name);
    if joined.len() <= MAX_CHANNEL_LEN {
        return joined;
    }
    let digest = Sha256::digest(joined.as_bytes());
    URL_SAFE.encode(digest)
}

struct Subscriber {
    id: u64,
    queue: mpsc::Sender<Notification>,
}

type ChannelMap = HashMap<String, Vec<Subscriber>>;

pub struct NotificationBus {
    listener: Arc<dyn Listener>,
    channels: Arc<Mutex<ChannelMap>>,
    /// Serializes listen/unlisten round trips. Never taken by the demux loop.
    registration: Arc<Mutex<()>>,
    config: BusConfig,
    next_id: AtomicU64,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channel_count = self
            .channels
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("NotificationBus")
            .field("config", &self.config)
            .field("channels", &channel_count)
            .field("tasks", &self.tasks.len())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl NotificationBus {
    /// Take ownership of the listener's notification stream and start the
    /// demux loop.
    pub async fn start(
        listener: Arc<dyn Listener>,
        config: BusConfig,
    ) -> Result<Self> {
        let inbound = listener.take_notifications().await.ok_or_else(|| {
            CoordError::Internal(
                "listener notification stream already taken".into(),
            )
        })?;

        let channels: Arc<Mutex<ChannelMap>> = Arc::default();
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(demux(
            inbound,
            Arc::clone(&channels),
            config.delivery_timeout(),
            shutdown.clone(),
        ));

        Ok(Self {
            listener,
            channels,
            registration: Arc::default(),
            config,
            next_id: AtomicU64::new(1),
            tasks,
            shutdown,
        })
    }

    /// Subscribe to notifications published for `(namespace, name)`.
    ///
    /// The returned queue receives every notification on the channel until
    /// `scope` is cancelled, after which the subscription is removed and the
    /// queue drains and closes.
    pub async fn subscribe(
        &self,
        scope: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Result<mpsc::Receiver<Notification>> {
        if self.shutdown.is_cancelled() {
            return Err(CoordError::Cancelled("notification bus shut down".into()));
        }

        let channel = channel_name(namespace, name);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, receiver) = mpsc::channel(self.config.queue_capacity.max(1));

        {
            let _registration = self.registration.lock().await;
            let listening = self.channels.lock().await.contains_key(&channel);
            if !listening {
                self.listener.listen(&channel).await?;
                debug!(%channel, "listening on notification channel");
            }
            self.channels
                .lock()
                .await
                .entry(channel.clone())
                .or_default()
                .push(Subscriber { id, queue });
        }

        let scope = scope.clone();
        let shutdown = self.shutdown.clone();
        let channels = Arc::clone(&self.channels);
        let registration = Arc::clone(&self.registration);
        let listener = Arc::clone(&self.listener);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
            let _registration = registration.lock().await;
            remove_subscriber(&channels, listener.as_ref(), &channel, id).await;
        });

        Ok(receiver)
    }

    /// Stop the demux loop and all subscription cleanup tasks, close the
    /// listener, and wait for every task to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        if let Err(err) = self.listener.close().await {
            warn!(error = %err, "failed to close notification listener");
        }
    }
}

/// Drop subscriber `id` and unlisten once the channel has no subscribers
/// left. Callers hold the registration lock; the map lock is released before
/// talking to the listener.
async fn remove_subscriber(
    channels: &Mutex<ChannelMap>,
    listener: &dyn Listener,
    channel: &str,
    id: u64,
) {
    {
        let mut guard = channels.lock().await;
        let Some(subscribers) = guard.get_mut(channel) else {
            return;
        };
        subscribers.retain(|subscriber| subscriber.id != id);
        if !subscribers.is_empty() {
            return;
        }
        guard.remove(channel);
    }

    if let Err(err) = listener.unlisten(channel).await {
        warn!(%channel, error = %err, "failed to unlisten notification channel");
    } else {
        debug!(%channel, "stopped listening on notification channel");
    }
}

async fn demux(
    mut inbound: mpsc::Receiver<Notification>,
    channels: Arc<Mutex<ChannelMap>>,
    delivery_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = inbound.recv() => match received {
                Some(notification) => notification,
                None => {
                    warn!("notification listener stream ended; demux loop exiting");
                    // Close every subscriber queue so consumers notice.
                    channels.lock().await.clear();
                    break;
                }
            },
        };

        let queues: Vec<(u64, mpsc::Sender<Notification>)> = {
            let guard = channels.lock().await;
            guard
                .get(&notification.channel)
                .map(|subscribers| {
                    subscribers
                        .iter()
                        .map(|subscriber| (subscriber.id, subscriber.queue.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        if queues.is_empty() {
            trace!(channel = %notification.channel, "no subscribers for notification");
            continue;
        }

        for (id, queue) in queues {
            let delivery = queue.send_timeout(notification.clone(), delivery_timeout);
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => return,
                outcome = delivery => outcome,
            };
            match outcome {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    error!(
                        channel = %notification.channel,
                        subscriber = id,
                        timeout_ms = delivery_timeout.as_millis() as u64,
                        "subscriber queue full; dropping notification"
                    );
                }
                Err(SendTimeoutError::Closed(_)) => {
                    trace!(
                        channel = %notification.channel,
                        subscriber = id,
                        "subscriber queue closed"
                    );
                }
            }
        }
    }
}
