//! `LISTEN`/`NOTIFY` plumbing for the notification bus.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Postgres};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::listener::{Listener, Notification};
use super::channel_name;
use crate::error::{CoordError, Result};

const RECEIVE_RETRY_BACKOFF: Duration = Duration::from_millis(500);

enum Command {
    Listen(String, oneshot::Sender<Result<()>>),
    Unlisten(String, oneshot::Sender<Result<()>>),
    UnlistenAll(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Listener backed by a dedicated Postgres connection.
///
/// The connection is owned by a single task that interleaves LISTEN/UNLISTEN
/// commands with receiving notifications. `PgListener` reconnects and
/// re-issues its LISTENs on its own after a connection loss; notifications
/// sent while disconnected are lost.
pub struct PgNotificationListener {
    commands: mpsc::Sender<Command>,
    inbound: Mutex<Option<mpsc::Receiver<Notification>>>,
    tasks: TaskTracker,
}

impl fmt::Debug for PgNotificationListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgNotificationListener")
            .field("closed", &self.commands.is_closed())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl PgNotificationListener {
    pub async fn connect(pool: &PgPool, capacity: usize) -> Result<Self> {
        let listener = PgListener::connect_with(pool).await.map_err(|e| {
            CoordError::from_sqlx("connect notification listener", e)
        })?;

        let (commands, command_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        let tasks = TaskTracker::new();
        tasks.spawn(run_listener(listener, command_rx, inbound_tx));
        tasks.close();

        info!("notification listener connected");
        Ok(Self {
            commands,
            inbound: Mutex::new(Some(inbound_rx)),
            tasks,
        })
    }

    async fn request<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).await.map_err(|_| {
            CoordError::Internal("notification listener task stopped".into())
        })?;
        response.await.map_err(|_| {
            CoordError::Internal("notification listener task dropped reply".into())
        })?
    }
}

#[async_trait]
impl Listener for PgNotificationListener {
    async fn listen(&self, channel: &str) -> Result<()> {
        let channel = channel.to_string();
        self.request(|reply| Command::Listen(channel, reply)).await
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        let channel = channel.to_string();
        self.request(|reply| Command::Unlisten(channel, reply)).await
    }

    async fn unlisten_all(&self) -> Result<()> {
        self.request(Command::UnlistenAll).await
    }

    async fn close(&self) -> Result<()> {
        if self.commands.is_closed() {
            return Ok(());
        }
        let result = self.request(Command::Close).await;
        self.tasks.wait().await;
        result
    }

    async fn take_notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        self.inbound.lock().await.take()
    }
}

async fn run_listener(
    mut listener: PgListener,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<Notification>,
) {
    // At most one notification waits for room in `inbound`; commands are
    // still served meanwhile.
    let mut pending: Option<Notification> = None;
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    Command::Listen(channel, reply) => {
                        let result = listener
                            .listen(&channel)
                            .await
                            .map_err(|e| CoordError::from_sqlx("listen", e));
                        let _ = reply.send(result);
                    }
                    Command::Unlisten(channel, reply) => {
                        let result = listener
                            .unlisten(&channel)
                            .await
                            .map_err(|e| CoordError::from_sqlx("unlisten", e));
                        let _ = reply.send(result);
                    }
                    Command::UnlistenAll(reply) => {
                        let result = listener
                            .unlisten_all()
                            .await
                            .map_err(|e| CoordError::from_sqlx("unlisten all", e));
                        let _ = reply.send(result);
                    }
                    Command::Close(reply) => {
                        let result = listener
                            .unlisten_all()
                            .await
                            .map_err(|e| CoordError::from_sqlx("close listener", e));
                        let _ = reply.send(result);
                        break;
                    }
                }
            }
            permit = inbound.reserve(), if pending.is_some() => match permit {
                Ok(permit) => {
                    if let Some(message) = pending.take() {
                        permit.send(message);
                    }
                }
                Err(_) => {
                    debug!("notification consumer dropped; listener exiting");
                    break;
                }
            },
            received = listener.recv(), if pending.is_none() => match received {
                Ok(notification) => {
                    pending = Some(Notification {
                        channel: notification.channel().to_string(),
                        payload: notification.payload().to_string(),
                    });
                }
                Err(err) => {
                    warn!(error = %err, "notification receive failed; retrying");
                    tokio::time::sleep(RECEIVE_RETRY_BACKOFF).await;
                }
            }
        }
    }
    debug!("notification listener task stopped");
}

/// Publish `payload` on the channel for `(namespace, name)`.
///
/// When `executor` is a transaction the notification is delivered only if
/// that transaction commits.
pub async fn notify<'e, E>(
    executor: E,
    namespace: &str,
    name: &str,
    payload: &str,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let channel = channel_name(namespace, name);
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(&channel)
        .bind(payload)
        .execute(executor)
        .await
        .map_err(|e| CoordError::from_sqlx("pg_notify", e))?;
    Ok(())
}
