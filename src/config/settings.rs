use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Covers the dispatcher server, the dashboard-side client and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub log: LogSettings,
}

/// Configuration settings for the dispatcher server.
///
/// `auth_token`, when set, is the only bearer token the handshake accepts.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
}

/// Configuration settings for the dashboard-side connection.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    /// WebSocket origin of the notification server.
    pub backend_url: String,
    /// Directory of the persistent credential store.
    pub credential_path: String,
    /// Key the access token is stored under.
    pub token_key: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub client: Option<PartialClientSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialClientSettings {
    pub backend_url: Option<String>,
    pub credential_path: Option<String>,
    pub token_key: Option<String>,
    pub reconnect_delay_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                auth_token: None,
            },
            client: ClientSettings {
                backend_url: "ws://127.0.0.1:8080".to_string(),
                credential_path: "delivery_feed_db".to_string(),
                token_key: "token".to_string(),
                reconnect_delay_ms: 1000,
                max_reconnect_attempts: 5,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server;
        let client = self.client;
        let log = self.log;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                auth_token: server
                    .as_ref()
                    .and_then(|s| s.auth_token.clone())
                    .or(default.server.auth_token),
            },
            client: ClientSettings {
                backend_url: client
                    .as_ref()
                    .and_then(|c| c.backend_url.clone())
                    .unwrap_or(default.client.backend_url),
                credential_path: client
                    .as_ref()
                    .and_then(|c| c.credential_path.clone())
                    .unwrap_or(default.client.credential_path),
                token_key: client
                    .as_ref()
                    .and_then(|c| c.token_key.clone())
                    .unwrap_or(default.client.token_key),
                reconnect_delay_ms: client
                    .as_ref()
                    .and_then(|c| c.reconnect_delay_ms)
                    .unwrap_or(default.client.reconnect_delay_ms),
                max_reconnect_attempts: client
                    .as_ref()
                    .and_then(|c| c.max_reconnect_attempts)
                    .unwrap_or(default.client.max_reconnect_attempts),
            },
            log: LogSettings {
                level: log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}
