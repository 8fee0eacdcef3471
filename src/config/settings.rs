use std::time::Duration;

use serde::Deserialize;

use crate::client::backoff::BackoffPolicy;

/// Top-level configuration settings for the application.
///
/// Includes settings for the relay server, the reconnecting client and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the relay server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Whether a published envelope is also delivered back to its sender.
    pub echo_to_sender: bool,
    /// Bounded wait for connections to close gracefully during shutdown.
    pub shutdown_grace_ms: u64,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Configuration settings for the reconnecting client and publisher.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    /// Base URL of the relay, without the topic path.
    pub url: String,
    pub topic: String,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_retries: u32,
}

impl ClientSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.initial_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
            factor: self.backoff_factor,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Settings as read from sources, where any field may be absent. Missing values are filled from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub client: Option<PartialClientSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub echo_to_sender: Option<bool>,
    pub shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialClientSettings {
    pub url: Option<String>,
    pub topic: Option<String>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8001,
                echo_to_sender: false,
                shutdown_grace_ms: 5000,
            },
            client: ClientSettings {
                url: "ws://127.0.0.1:8001".to_string(),
                topic: "1.0".to_string(),
                initial_delay_ms: 1000,
                max_delay_ms: 30_000,
                backoff_factor: 2.0,
                max_retries: 5,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server;
        let client = self.client;
        let logging = self.logging;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(defaults.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(defaults.server.port),
                echo_to_sender: server
                    .as_ref()
                    .and_then(|s| s.echo_to_sender)
                    .unwrap_or(defaults.server.echo_to_sender),
                shutdown_grace_ms: server
                    .as_ref()
                    .and_then(|s| s.shutdown_grace_ms)
                    .unwrap_or(defaults.server.shutdown_grace_ms),
            },
            client: ClientSettings {
                url: client
                    .as_ref()
                    .and_then(|c| c.url.clone())
                    .unwrap_or(defaults.client.url),
                topic: client
                    .as_ref()
                    .and_then(|c| c.topic.clone())
                    .unwrap_or(defaults.client.topic),
                initial_delay_ms: client
                    .as_ref()
                    .and_then(|c| c.initial_delay_ms)
                    .unwrap_or(defaults.client.initial_delay_ms),
                max_delay_ms: client
                    .as_ref()
                    .and_then(|c| c.max_delay_ms)
                    .unwrap_or(defaults.client.max_delay_ms),
                backoff_factor: client
                    .as_ref()
                    .and_then(|c| c.backoff_factor)
                    .unwrap_or(defaults.client.backoff_factor),
                max_retries: client
                    .as_ref()
                    .and_then(|c| c.max_retries)
                    .unwrap_or(defaults.client.max_retries),
            },
            logging: LoggingSettings {
                level: logging
                    .and_then(|l| l.level)
                    .unwrap_or(defaults.logging.level),
            },
        }
    }
}
