//! Client configuration, loaded from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::{
    host_port_default, load_duration_default, load_string, load_string_default, load_u16_default,
    ConfigError, DEFAULT_KEY,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend URL the batcher POSTs to.
    pub backend: String,
    /// Pre-shared key for the AEAD key schedule.
    pub key: Vec<u8>,
    /// Local SOCKS5 listen address.
    pub listen: String,
    /// Optional SOCKS5 credentials; empty disables authentication.
    pub username: String,
    pub password: String,
    /// Dial this address instead of resolving the backend host.
    pub backend_host_enforce: Option<SocketAddr>,
    pub max_client_connections: usize,
    pub max_backend_connections: usize,
    pub max_retrieve_length: u16,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_retries: usize,
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let enforce = load_string("BackendHostEnforce");
        let backend_host_enforce = if enforce.trim().is_empty() {
            None
        } else {
            Some(enforce.trim().parse::<SocketAddr>().map_err(|_| {
                ConfigError(format!(
                    "option \"BackendHostEnforce\" is not a host:port address: {enforce}"
                ))
            })?)
        };
        let cfg = Self {
            backend: load_string("Backend").trim().to_string(),
            key: load_string_default("Key", DEFAULT_KEY).trim().as_bytes().to_vec(),
            listen: host_port_default("Listen", "127.0.0.1:1080"),
            username: load_string("Username").trim().to_string(),
            password: load_string("Password").trim().to_string(),
            backend_host_enforce,
            max_client_connections: load_u16_default("MaxClientConnections", 128) as usize,
            max_backend_connections: load_u16_default("MaxBackendConnections", 5) as usize,
            max_retrieve_length: load_u16_default(
                "MaxRetrieveLength",
                crate::MAX_REQUEST_PAYLOAD_SIZE as u16,
            ),
            request_timeout: load_duration_default("RequestTimeout", Duration::from_secs(32)),
            idle_timeout: load_duration_default("IdleTimeout", Duration::from_secs(128)),
            max_retries: load_u16_default("MaxRetries", 6) as usize,
        };
        cfg.verify()
    }

    pub fn verify(mut self) -> Result<Self, ConfigError> {
        if self.backend.is_empty() {
            return Err(ConfigError("option \"Backend\" is required".into()));
        }
        if self.key.is_empty() {
            return Err(ConfigError("option \"Key\" is required".into()));
        }
        if self.listen.is_empty() {
            return Err(ConfigError("option \"Listen\" is required".into()));
        }
        if self.max_client_connections < 1 {
            return Err(ConfigError(
                "option \"MaxClientConnections\" must be greater than 0".into(),
            ));
        }
        if self.max_backend_connections < 1 {
            return Err(ConfigError(
                "option \"MaxBackendConnections\" must be greater than 0".into(),
            ));
        }
        if self.max_retrieve_length < 1 {
            return Err(ConfigError(
                "option \"MaxRetrieveLength\" must be greater than 0".into(),
            ));
        }
        if self.request_timeout < Duration::from_secs(1) {
            return Err(ConfigError(
                "option \"RequestTimeout\" must be at least 1 second".into(),
            ));
        }
        if self.idle_timeout < self.request_timeout {
            return Err(ConfigError(format!(
                "option \"IdleTimeout\" must be greater than \"RequestTimeout\" ({:?})",
                self.request_timeout
            )));
        }
        if self.max_retries < 1 {
            return Err(ConfigError(
                "option \"MaxRetries\" must be greater than 0".into(),
            ));
        }
        // The per-turn read cap can never exceed what one turn carries.
        if usize::from(self.max_retrieve_length) > crate::MAX_REQUEST_PAYLOAD_SIZE {
            self.max_retrieve_length = crate::MAX_REQUEST_PAYLOAD_SIZE as u16;
        }
        Ok(self)
    }
}
