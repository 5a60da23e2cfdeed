//! Environment configuration loader.
//!
//! Every option is read from the process environment under the `WWF`
//! prefix; a value of the form `$NAME` indirects to another
//! environment variable. Durations are integer seconds.

use std::time::Duration;

use thiserror::Error;

pub const ENV_PREFIX: &str = "WWF";

/// Shared-secret default used when no key is configured. Both ends
/// fall back to the same literal, so a key is strongly recommended but
/// not required for a first run.
pub const DEFAULT_KEY: &str = "CommunicatingPrivatelyAndSecurelyIsANecessityNotAPrivilege";

#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

fn raw(name: &str) -> String {
    std::env::var(format!("{ENV_PREFIX}{name}")).unwrap_or_default()
}

pub fn load_string(name: &str) -> String {
    let v = raw(name);
    match v.strip_prefix('$') {
        Some(indirect) => std::env::var(indirect).unwrap_or_default(),
        None => v,
    }
}

pub fn load_string_default(name: &str, def: &str) -> String {
    let v = load_string(name);
    if v.is_empty() {
        def.to_string()
    } else {
        v
    }
}

/// A `host:port` value; a bare port number is accepted as `:port`.
pub fn host_port_default(name: &str, def: &str) -> String {
    let v = load_string(name);
    let v = v.trim();
    if v.is_empty() {
        return def.to_string();
    }
    if v.contains(':') {
        return v.to_string();
    }
    match v.parse::<u16>() {
        Ok(port) => format!(":{port}"),
        Err(_) => def.to_string(),
    }
}

pub fn load_u16_default(name: &str, def: u16) -> u16 {
    match load_string(name).trim().parse::<u16>() {
        Ok(0) | Err(_) => def,
        Ok(v) => v,
    }
}

pub fn load_duration_default(name: &str, def: Duration) -> Duration {
    match load_string(name).trim().parse::<u64>() {
        Ok(0) | Err(_) => def,
        Ok(secs) => Duration::from_secs(secs),
    }
}

/// Turn a `host:port` or `:port` listen value into a bindable address.
pub fn bind_address(listen: &str) -> String {
    match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global, so every case shares one
    // test.
    #[test]
    fn loading_and_indirection() {
        std::env::set_var("WWFProbe", "direct");
        assert_eq!(load_string("Probe"), "direct");

        std::env::set_var("PROBE_TARGET", "indirect");
        std::env::set_var("WWFProbe", "$PROBE_TARGET");
        assert_eq!(load_string("Probe"), "indirect");

        assert_eq!(load_string_default("ProbeMissing", "fallback"), "fallback");

        std::env::set_var("WWFProbePort", "1080");
        assert_eq!(host_port_default("ProbePort", ":80"), ":1080");
        std::env::set_var("WWFProbeHost", "127.0.0.1:9000");
        assert_eq!(host_port_default("ProbeHost", ":80"), "127.0.0.1:9000");
        assert_eq!(host_port_default("ProbeHostMissing", ":80"), ":80");

        std::env::set_var("WWFProbeNum", "12");
        assert_eq!(load_u16_default("ProbeNum", 5), 12);
        std::env::set_var("WWFProbeNum", "junk");
        assert_eq!(load_u16_default("ProbeNum", 5), 5);

        std::env::set_var("WWFProbeDur", "30");
        assert_eq!(
            load_duration_default("ProbeDur", Duration::from_secs(1)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn bindable_listen_addresses() {
        assert_eq!(bind_address(":80"), "0.0.0.0:80");
        assert_eq!(bind_address("127.0.0.1:1080"), "127.0.0.1:1080");
    }
}
