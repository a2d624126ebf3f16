//! Public, transport-agnostic bus configuration.
//!
//! This type intentionally contains no transport-specific concepts.
//! Connectors are responsible for interpreting it into concrete connection
//! settings (the AMQP connector assembles a broker URI from the parts;
//! the memory connector ignores everything but the client id).
//!
//! Values are supplied at construction time and treated as immutable; how
//! they are sourced (environment, files, flags) is the caller's concern.

/// Connection parameters for a bus client.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker endpoint. Either a full URI (e.g. `"amqp://localhost:5672/%2f"`)
    /// or a bare hostname combined with [`port`](Self::with_port) and
    /// [`virtual_host`](Self::with_virtual_host).
    pub endpoint: String,

    /// Broker port, when `endpoint` is a bare hostname.
    pub port: Option<u16>,

    /// Virtual host, when `endpoint` is a bare hostname.
    pub virtual_host: Option<String>,

    /// Username for broker authentication.
    pub username: Option<String>,

    /// Password for broker authentication.
    pub password: Option<String>,

    /// Heartbeat/keep-alive interval in seconds (0 to disable).
    pub heartbeat_secs: Option<u16>,

    /// Maximum unacknowledged deliveries a consumer may hold. Default 1,
    /// which serializes processing.
    pub prefetch: u16,

    /// Identifier for this client instance, used in logging and in
    /// broker-side consumer tags.
    pub client_id: String,
}

impl BusConfig {
    /// Create a config for the given broker endpoint.
    ///
    /// Heartbeat uses the transport default; prefetch defaults to 1.
    pub fn new(endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        // ---
        Self {
            endpoint: endpoint.into(),
            port: None,
            virtual_host: None,
            username: None,
            password: None,
            heartbeat_secs: None,
            prefetch: 1,
            client_id: client_id.into(),
        }
    }

    /// Set an explicit broker port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the virtual host.
    pub fn with_virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.virtual_host = Some(vhost.into());
        self
    }

    /// Set broker credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set an explicit heartbeat interval.
    pub fn with_heartbeat_secs(mut self, secs: u16) -> Self {
        self.heartbeat_secs = Some(secs);
        self
    }

    /// Set the consumer prefetch count.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults() {
        // ---
        let config = BusConfig::new("amqp://localhost:5672/%2f", "producer-1");
        assert_eq!(config.prefetch, 1);
        assert!(config.username.is_none());
        assert!(config.heartbeat_secs.is_none());
        assert_eq!(config.client_id, "producer-1");
    }

    #[test]
    fn builder_methods_chain() {
        // ---
        let config = BusConfig::new("broker.internal", "worker")
            .with_port(5671)
            .with_virtual_host("/orders")
            .with_credentials("svc", "secret")
            .with_heartbeat_secs(20)
            .with_prefetch(8);

        assert_eq!(config.port, Some(5671));
        assert_eq!(config.virtual_host.as_deref(), Some("/orders"));
        assert_eq!(config.username.as_deref(), Some("svc"));
        assert_eq!(config.heartbeat_secs, Some(20));
        assert_eq!(config.prefetch, 8);
    }
}
