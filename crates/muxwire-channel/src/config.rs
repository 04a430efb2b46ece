//! Channel and peer configuration.

use std::time::Duration;

use muxwire_core::ConnectionConfig;

/// Per-peer settings.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Time allowed for the transport to open a stream.
    pub connect_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(2) }
    }
}

/// Channel settings.
///
/// The identity fields are advertised in every handshake and override the
/// ones in [`ChannelConfig::connection`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Name of this process.
    pub process_name: String,
    /// `host:port` this process is reachable at.
    pub host_port: String,
    /// Connection settings.
    pub connection: ConnectionConfig,
    /// Peer settings.
    pub peer: PeerConfig,
    /// Ttl for calls made through [`crate::Channel`] with a zero ttl.
    pub default_ttl: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            process_name: "muxwire".to_string(),
            host_port: "0.0.0.0:0".to_string(),
            connection: ConnectionConfig::default(),
            peer: PeerConfig::default(),
            default_ttl: Duration::from_secs(1),
        }
    }
}

impl ChannelConfig {
    /// Config advertising `process_name` and `host_port`.
    pub fn new(process_name: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self { process_name: process_name.into(), host_port: host_port.into(), ..Self::default() }
    }

    /// Replace the connection settings.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.peer.connect_timeout = timeout;
        self
    }

    /// Set the default call ttl.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Connection settings carrying this channel's identity.
    pub fn connection_config(&self) -> ConnectionConfig {
        self.connection.clone().with_identity(&self.host_port, &self.process_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_overrides_connection_config() {
        let config = ChannelConfig::new("billing", "10.0.0.1:4040")
            .with_connection(ConnectionConfig::default().with_identity("ignored:1", "ignored"));
        let connection = config.connection_config();
        assert_eq!(connection.host_port, "10.0.0.1:4040");
        assert_eq!(connection.process_name, "billing");
    }
}
