//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bayes_engine::{EngineConfig, EngineConfigError};

use crate::scheduler::DEFAULT_QUERY_TIMEOUT;

/// Server configuration parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (default: 0.0.0.0:11211).
    pub listen: SocketAddr,

    /// Open connection limit (default: 1000).
    ///
    /// Connections beyond it are accepted and closed at once.
    pub max_connections: usize,

    /// Concurrent bucket reads (default: 64).
    pub aio_slots: usize,

    /// How long a test query waits for a bucket (default: 0.5s).
    pub query_timeout: Duration,

    /// Longest poll wait when no timeout is armed (default: 57ms).
    pub poll_interval: Duration,

    /// Loop iterations spent draining connections on shutdown (default: 64).
    pub shutdown_steps: u32,

    /// Lock process memory with `mlockall` (default: false).
    pub lock_memory: bool,

    /// Engine parameters.
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 11211),
            max_connections: 1000,
            aio_slots: 64,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            poll_interval: Duration::from_millis(57),
            shutdown_steps: 64,
            lock_memory: false,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a server configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address (builder pattern).
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    /// Set the connection limit (builder pattern).
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set concurrent bucket reads (builder pattern).
    pub fn with_aio_slots(mut self, slots: usize) -> Self {
        self.aio_slots = slots;
        self
    }

    /// Set the bucket wait timeout (builder pattern).
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Enable `mlockall` (builder pattern).
    pub fn with_lock_memory(mut self, lock: bool) -> Self {
        self.lock_memory = lock;
        self
    }

    /// Set engine parameters (builder pattern).
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ServerConfigError> {
        if self.max_connections == 0 {
            return Err(ServerConfigError::NoConnections);
        }
        if self.aio_slots == 0 {
            return Err(ServerConfigError::NoAioSlots);
        }
        if self.query_timeout.is_zero() || self.poll_interval.is_zero() {
            return Err(ServerConfigError::ZeroInterval);
        }
        self.engine.validate()?;
        Ok(())
    }

    /// Create a configuration for tests: loopback on an ephemeral port.
    pub fn for_testing() -> Self {
        ServerConfig {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            max_connections: 16,
            aio_slots: 4,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            poll_interval: Duration::from_millis(10),
            shutdown_steps: 16,
            lock_memory: false,
            engine: EngineConfig::for_testing(),
        }
    }
}

/// Server configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerConfigError {
    /// Connection limit is zero
    #[error("max connections must be at least 1")]
    NoConnections,

    /// No bucket read slots
    #[error("aio slots must be at least 1")]
    NoAioSlots,

    /// A timer interval is zero
    #[error("timeouts and poll interval must be positive")]
    ZeroInterval,

    /// Engine parameters invalid
    #[error(transparent)]
    Engine(#[from] EngineConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.port(), 11211);
        assert_eq!(config.max_connections, 1000);
        assert!(config.validate().is_ok());
        assert!(ServerConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_invalid() {
        let config = ServerConfig::new().with_max_connections(0);
        assert_eq!(config.validate(), Err(ServerConfigError::NoConnections));
        let config = ServerConfig::new().with_aio_slots(0);
        assert_eq!(config.validate(), Err(ServerConfigError::NoAioSlots));
        let config = ServerConfig::new().with_engine(EngineConfig::new().with_memory_limit_mib(0));
        assert!(matches!(config.validate(), Err(ServerConfigError::Engine(_))));
    }
}
