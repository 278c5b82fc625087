use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use log::LevelFilter;

use crate::error::ConfigError;
use crate::net::framing::MaskPolicy;
use crate::net::handshake::Subprotocol;

pub const DEFAULT_PORT: u16 = 3210;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Directory plain HTTP requests are served from.
    pub static_root: PathBuf,
    /// Subprotocols offered during the handshake.
    pub subprotocols: Vec<Subprotocol>,
    pub mask_policy: MaskPolicy,
    /// Accepted sockets beyond this are closed immediately.
    pub max_connections: usize,
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            static_root: PathBuf::from("public"),
            subprotocols: vec![Subprotocol::Json],
            mask_policy: MaskPolicy::Optional,
            max_connections: 1024,
            log_level: LevelFilter::Info,
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError {
            key,
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

fn parse_subprotocols(key: &'static str, value: &str) -> Result<Vec<Subprotocol>, ConfigError> {
    let mut out = Vec::new();
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let protocol = Subprotocol::from_name(name).ok_or_else(|| ConfigError {
            key,
            value: value.to_string(),
            reason: format!("unknown subprotocol {name:?}"),
        })?;
        if !out.contains(&protocol) {
            out.push(protocol);
        }
    }
    Ok(out)
}

impl Config {
    /// Loads `.env` (if present) and then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, keeping defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BIND_ADDR") {
            config.bind_addr = parse("BIND_ADDR", &v)?;
        }
        if let Some(v) = lookup("PORT") {
            config.port = parse("PORT", &v)?;
        }
        if let Some(v) = lookup("STATIC_ROOT") {
            config.static_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("WS_SUBPROTOCOLS") {
            config.subprotocols = parse_subprotocols("WS_SUBPROTOCOLS", &v)?;
        }
        if let Some(v) = lookup("WS_REQUIRE_MASK") {
            config.mask_policy = if parse_bool("WS_REQUIRE_MASK", &v)? {
                MaskPolicy::Required
            } else {
                MaskPolicy::Optional
            };
        }
        if let Some(v) = lookup("WS_MAX_CONNECTIONS") {
            config.max_connections = parse("WS_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            config.log_level = parse("LOG_LEVEL", &v)?;
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}
