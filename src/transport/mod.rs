mod socket;
mod ws;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub use socket::{FrameBatch, SocketClient, SocketOptions, SocketStats, Subscription};
pub use ws::WsConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection dropped: {0}")]
    Dropped(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Opens links to a stream endpoint. The socket client calls it once per
/// connection attempt.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError>;
}

/// One open duplex connection carrying text messages.
#[async_trait::async_trait]
pub trait Link: Send {
    /// Next text message, `Ok(None)` once the peer closed. Must be
    /// cancel-safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Graceful shutdown on explicit close.
    async fn close(&mut self) {}
}

/// Connectivity as seen by status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    /// Terminal: reached only through an explicit close.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay before every attempt.
    Fixed(Duration),
    /// Doubling delay, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(Duration::from_secs(1))
    }
}

impl ReconnectPolicy {
    /// The shortest delay this policy will ever produce.
    pub fn minimum(&self) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { initial, .. } => *initial,
        }
    }
}

/// Delay state between reconnect attempts. Reset after every successful
/// connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: policy.minimum(),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        match self.policy {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { initial, max } => {
                let delay = self.current;
                self.current = (self.current * 2).min(max.max(initial));
                delay
            }
        }
    }

    pub fn reset(&mut self) {
        self.current = self.policy.minimum();
    }
}

/// In-memory stand-ins for tests outside the transport module.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::{Connector, Link, TransportError};

    /// Accepts a single connection that replays `messages` and then stays
    /// open and silent. Later attempts are refused.
    pub(crate) struct ScriptedConnector {
        messages: Mutex<Option<Vec<String>>>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(messages: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Some(messages)),
            })
        }
    }

    #[async_trait::async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
            let messages = self.messages.lock().unwrap().take();
            match messages {
                Some(messages) => Ok(Box::new(ScriptedLink {
                    queue: messages.into(),
                })),
                None => Err(TransportError::Connect {
                    url: url.to_string(),
                    reason: "refused".into(),
                }),
            }
        }
    }

    struct ScriptedLink {
        queue: VecDeque<String>,
    }

    #[async_trait::async_trait]
    impl Link for ScriptedLink {
        async fn recv(&mut self) -> Result<Option<String>, TransportError> {
            match self.queue.pop_front() {
                Some(text) => Ok(Some(text)),
                None => std::future::pending().await,
            }
        }

        async fn send(&mut self, _text: String) -> Result<(), TransportError> {
            Ok(())
        }
    }
}
