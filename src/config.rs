use std::{fs::read_to_string, net::SocketAddr};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// SSL material: a certificate/key pair, as PEM file paths.
///
/// The pair can appear globally, on an acceptor, and on a vhost; the startup
/// assignment resolves the innermost pair an endpoint actually serves.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Ssl {
    ///
    /// certificate to present, with any intermediates appended
    ///
    pub certificate: String,
    ///
    /// private key matching the certificate
    ///
    pub key: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Bind {
    ///
    /// listen address
    ///
    /// The address and port the acceptor binds to. Multiple acceptors can
    /// be declared; the binding address supports ipv4 and ipv6.
    ///
    pub listen: SocketAddr,
    ///
    /// acceptor name
    ///
    /// Virtual hosts reference acceptors by this name. Defaults to the
    /// listen address.
    ///
    #[serde(default)]
    pub name: Option<String>,
    ///
    /// shared flag
    ///
    /// A shared acceptor serves every virtual host that declares no
    /// explicit binding of its own.
    ///
    #[serde(default = "Bind::shared")]
    pub shared: bool,
    ///
    /// TLS flag
    ///
    /// Serve TLS on this acceptor using the global SSL material.
    ///
    #[serde(default)]
    pub tls: bool,
    ///
    /// SSL configuration
    ///
    /// Presence turns this acceptor into a TLS endpoint; the material here
    /// overrides the global material.
    ///
    #[serde(default)]
    pub ssl: Option<Ssl>,
}

impl Bind {
    fn shared() -> bool {
        true
    }

    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.listen.to_string())
    }

    pub fn is_tls(&self) -> bool {
        self.tls || self.ssl.is_some()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Vhost {
    ///
    /// host name
    ///
    /// Matched case-insensitively against the request's host name.
    ///
    pub name: String,
    ///
    /// dealer names
    ///
    /// The backends this virtual host routes to, in preference order.
    /// Dealers are identified on the bus by these names.
    ///
    #[serde(default)]
    pub dealers: Vec<String>,
    ///
    /// explicit acceptor bindings
    ///
    /// Names of acceptors this vhost is served on. Leave empty to be
    /// picked up by every shared acceptor.
    ///
    #[serde(default)]
    pub binds: Vec<String>,
    ///
    /// SSL override
    ///
    /// Certificate material used instead of the global one when this vhost
    /// is served over TLS.
    ///
    #[serde(default)]
    pub ssl: Option<Ssl>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Runtime {
    ///
    /// dealer liveness probe interval in seconds
    ///
    #[serde(default = "Runtime::ping_freq")]
    pub ping_freq: f64,
    ///
    /// session table bucket count
    ///
    /// Fixed at startup; rounded up to a power of two.
    ///
    #[serde(default = "Runtime::sht_size")]
    pub sht_size: usize,
    ///
    /// maximum request forwarding hops
    ///
    /// Requests that have crossed more gateways than this are refused.
    ///
    #[serde(default = "Runtime::max_hops")]
    pub max_hops: u32,
    ///
    /// idle deadline for persistent sessions, in seconds
    ///
    #[serde(default = "Runtime::session_timeout")]
    pub session_timeout: u64,
}

impl Runtime {
    fn ping_freq() -> f64 {
        3.0
    }

    fn sht_size() -> usize {
        65536
    }

    fn max_hops() -> u32 {
        10
    }

    fn session_timeout() -> u64 {
        30
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            ping_freq: Self::ping_freq(),
            sht_size: Self::sht_size(),
            max_hops: Self::max_hops(),
            session_timeout: Self::session_timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    ///
    /// user to drop privileges to after binding, name or numeric id
    ///
    #[serde(default = "Identity::uid")]
    pub uid: String,
    ///
    /// group to drop privileges to after binding, name or numeric id
    ///
    #[serde(default = "Identity::gid")]
    pub gid: String,
}

impl Identity {
    fn uid() -> String {
        "nobody".to_string()
    }

    fn gid() -> String {
        "nogroup".to_string()
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            uid: Self::uid(),
            gid: Self::gid(),
        }
    }
}

/// How chatty the process log is, from most to least severe.
///
/// `info` covers accepts, disconnects and dealer transitions; `trace` adds
/// per-frame traffic.
#[derive(Deserialize, Debug, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// One of error, warn, info, debug, trace.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// bus router bind endpoint
    ///
    /// The address the dealer-facing router socket listens on. Required;
    /// a gateway without a bus has nowhere to send requests.
    ///
    pub bus: SocketAddr,
    #[serde(default)]
    pub bind: Vec<Bind>,
    #[serde(default)]
    pub vhost: Vec<Vhost>,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub identity: Identity,
    ///
    /// global SSL material
    ///
    /// Used by TLS acceptors and vhosts that do not carry their own.
    ///
    #[serde(default)]
    pub ssl: Option<Ssl>,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Configuration file path
    ///
    /// Example: gateway-server /etc/gateway/config.toml
    ///
    config: String,
}

impl Config {
    ///
    /// Load configure from the config file given on the command line.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(
            &Cli::parse().config,
        )?)?)
    }

    #[doc(hidden)]
    pub fn from_str(value: &str) -> Result<Self> {
        Ok(toml::from_str::<Self>(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config = Config::from_str(
            r#"
            bus = "127.0.0.1:5000"

            [[bind]]
            listen = "127.0.0.1:8080"

            [[vhost]]
            name = "a.example"
            dealers = ["worker-1"]
            "#,
        )
        .unwrap();

        assert_eq!(config.runtime.ping_freq, 3.0);
        assert_eq!(config.runtime.sht_size, 65536);
        assert_eq!(config.runtime.max_hops, 10);
        assert_eq!(config.identity.uid, "nobody");
        assert_eq!(config.identity.gid, "nogroup");
        assert!(config.bind[0].shared);
        assert_eq!(config.bind[0].name(), "127.0.0.1:8080");
        assert!(config.vhost[0].binds.is_empty());
    }

    #[test]
    fn missing_bus_is_an_error() {
        assert!(Config::from_str("[[bind]]\nlisten = \"127.0.0.1:8080\"").is_err());
    }
}
