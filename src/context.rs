use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::transport::{Connector, SocketClient};

/// Owns the process-wide stream connection. Built once at startup and
/// handed to the frontend; views subscribe to the client but never close
/// it, so it outlives any single view.
pub struct StreamContext {
    config: AppConfig,
    client: SocketClient,
}

impl StreamContext {
    /// Start connecting to `config.stream.url`. Must run inside a tokio
    /// runtime.
    pub fn new(config: AppConfig, connector: Arc<dyn Connector>) -> Self {
        info!("Stream endpoint {}", config.stream.url);
        let client = SocketClient::connect(
            config.stream.url.clone(),
            connector,
            config.socket_options(),
        );
        Self { config, client }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn client(&self) -> &SocketClient {
        &self.client
    }

    /// Close the connection for good. Idempotent.
    pub fn shutdown(&self) {
        self.client.close();
    }
}

impl Drop for StreamContext {
    fn drop(&mut self) {
        self.client.close();
    }
}
