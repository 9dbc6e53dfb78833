//! Reload notification sent to browsers after a successful build.

use crate::event::ReloadMessage;
use thiserror::Error;
use tokio::sync::broadcast;

/// Default number of reload messages buffered per websocket client.
pub const RELOAD_CHANNEL_CAPACITY: usize = 16;

/// Errors delivering a reload notification. None of them fail a build.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// Nobody is listening; the message went nowhere.
    #[error("no browser is connected")]
    NoClients,
    /// Failure from a custom reloader.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Fire-and-forget notification issued after each successful build.
pub trait Reloader: Send + Sync {
    /// Asks clients to reload `path` (`"*"` for everything).
    ///
    /// Returns how many clients the message was handed to.
    fn reload(&self, path: &str) -> Result<usize, ReloadError>;
}

/// Broadcasts [`ReloadMessage`]s to every websocket client of the web server.
#[derive(Debug, Clone)]
pub struct BrowserReloader {
    tx: broadcast::Sender<ReloadMessage>,
}

impl BrowserReloader {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// New receiver for one websocket client.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadMessage> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BrowserReloader {
    fn default() -> Self {
        Self::new(RELOAD_CHANNEL_CAPACITY)
    }
}

impl Reloader for BrowserReloader {
    fn reload(&self, path: &str) -> Result<usize, ReloadError> {
        let message = ReloadMessage::Reload {
            path: path.to_string(),
        };
        self.tx.send(message).map_err(|_| ReloadError::NoClients)
    }
}
