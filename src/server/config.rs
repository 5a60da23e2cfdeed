//! Server configuration, loaded from the environment.

use std::time::Duration;

use crate::config::{
    host_port_default, load_duration_default, load_string, load_string_default, load_u16_default,
    ConfigError, DEFAULT_KEY,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    /// Pre-shared key for the AEAD key schedule.
    pub key: Vec<u8>,
    /// Per-request logging; off still reports startup and errors.
    pub logging: bool,
    pub idle_timeout: Duration,
    pub retrieve_timeout: Duration,
    pub dial_timeout: Duration,
    pub max_outgoing_connections: usize,
    /// PEM blocks; both present enables TLS.
    pub tls_public_key_block: Vec<u8>,
    pub tls_private_key_block: Vec<u8>,
}

impl ServerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = Self {
            listen: host_port_default("Listen", ":80"),
            key: load_string_default("Key", DEFAULT_KEY).trim().as_bytes().to_vec(),
            logging: load_string_default("Logging", "yes").trim().eq_ignore_ascii_case("yes"),
            idle_timeout: load_duration_default("IdleTimeout", Duration::from_secs(120)),
            retrieve_timeout: load_duration_default("RetrieveTimeout", Duration::from_secs(3)),
            dial_timeout: load_duration_default("DialTimeout", Duration::from_secs(5)),
            max_outgoing_connections: load_u16_default("MaxOutgoingConnections", 128) as usize,
            tls_public_key_block: load_string("TLSPublicKeyBlock").trim().as_bytes().to_vec(),
            tls_private_key_block: load_string("TLSPrivateKeyBlock").trim().as_bytes().to_vec(),
        };
        cfg.verify()
    }

    pub fn verify(self) -> Result<Self, ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError("option \"Listen\" is required".into()));
        }
        if self.key.is_empty() {
            return Err(ConfigError("option \"Key\" is required".into()));
        }
        if self.retrieve_timeout < Duration::from_secs(1) {
            return Err(ConfigError(
                "option \"RetrieveTimeout\" must be at least 1 second".into(),
            ));
        }
        if self.idle_timeout <= self.retrieve_timeout {
            return Err(ConfigError(format!(
                "option \"IdleTimeout\" must be greater than \"RetrieveTimeout\" ({:?})",
                self.retrieve_timeout
            )));
        }
        if self.dial_timeout < Duration::from_secs(1) {
            return Err(ConfigError(
                "option \"DialTimeout\" must be at least 1 second".into(),
            ));
        }
        Ok(self)
    }
}
