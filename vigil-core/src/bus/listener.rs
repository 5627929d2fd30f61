use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::error::{CoordError, Result};

/// A change notification as delivered by the storage engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Source of raw change notifications.
///
/// The bus owns exactly one listener and is the only consumer of its
/// notification stream; `take_notifications` hands the stream out once.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn listen(&self, channel: &str) -> Result<()>;

    async fn unlisten(&self, channel: &str) -> Result<()>;

    async fn unlisten_all(&self) -> Result<()>;

    /// Stop listening and end the notification stream.
    async fn close(&self) -> Result<()>;

    async fn take_notifications(&self) -> Option<mpsc::Receiver<Notification>>;
}

struct InProcState {
    channels: HashSet<String>,
    sender: Option<mpsc::Sender<Notification>>,
    receiver: Option<mpsc::Receiver<Notification>>,
}

/// Listener for single-process deployments. Notifications published on a
/// channel nobody listens to are discarded, mirroring `NOTIFY` semantics.
pub struct InProcListener {
    state: Mutex<InProcState>,
    capacity: usize,
}

impl fmt::Debug for InProcListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self
            .state
            .try_lock()
            .map(|state| state.channels.len())
            .unwrap_or_default();
        f.debug_struct("InProcListener")
            .field("capacity", &self.capacity)
            .field("channels", &channels)
            .finish()
    }
}

impl InProcListener {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            state: Mutex::new(InProcState {
                channels: HashSet::new(),
                sender: Some(sender),
                receiver: Some(receiver),
            }),
            capacity,
        }
    }

    /// Publish `payload` on a raw channel name. Returns whether the
    /// notification was handed to the stream.
    pub async fn publish(&self, channel: &str, payload: &str) -> bool {
        let sender = {
            let state = self.state.lock().await;
            if !state.channels.contains(channel) {
                return false;
            }
            match state.sender.clone() {
                Some(sender) => sender,
                None => return false,
            }
        };

        sender
            .send(Notification {
                channel: channel.to_string(),
                payload: payload.to_string(),
            })
            .await
            .is_ok()
    }

    pub async fn is_listening(&self, channel: &str) -> bool {
        self.state.lock().await.channels.contains(channel)
    }
}

#[async_trait]
impl Listener for InProcListener {
    async fn listen(&self, channel: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.sender.is_none() {
            return Err(CoordError::Internal(format!(
                "listen on {channel}: listener closed"
            )));
        }
        state.channels.insert(channel.to_string());
        Ok(())
    }

    async fn unlisten(&self, channel: &str) -> Result<()> {
        self.state.lock().await.channels.remove(channel);
        Ok(())
    }

    async fn unlisten_all(&self) -> Result<()> {
        self.state.lock().await.channels.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.channels.clear();
        state.sender = None;
        Ok(())
    }

    async fn take_notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        self.state.lock().await.receiver.take()
    }
}
