use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    /// Per-connection outbound queue; pushes beyond it are dropped.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9091,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:9091");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.max_send_queue, 256);
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = ServerConfig {
            heartbeat_interval_secs: 0,
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
