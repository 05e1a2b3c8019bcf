use std::time::Duration;

/// Configuration for a client chat session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// HTTP base URL of the server, e.g. `http://127.0.0.1:9091`.
    pub server_url: String,
    /// Consecutive failed reconnects before the session gives up.
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub history_page_size: u32,
    pub request_timeout: Duration,
    /// How long to wait for `connection_established` after the upgrade.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:9091".into(),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            history_page_size: 50,
            request_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn with_server_url(url: impl Into<String>) -> Self {
        Self {
            server_url: url.into(),
            ..Default::default()
        }
    }

    /// WebSocket endpoint derived from the HTTP base URL.
    pub fn ws_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/ws")
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }
}
