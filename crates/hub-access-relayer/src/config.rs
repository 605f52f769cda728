use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8788";
const DEFAULT_DB_PATH: &str = ".cache/hub-access-relayer/relayer.sqlite3";
const DEFAULT_JANITOR_INTERVAL_MS: u64 = 30_000;
const DEFAULT_EVENT_RETENTION_MS: u64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub janitor_interval_ms: u64,
    pub event_retention_ms: u64,
    /// Serve rustls when set; plain TCP otherwise.
    pub tls: Option<TlsPaths>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let read_u64 = |key: &str, default_value: u64| -> Result<u64> {
            read(key).map_or(Ok(default_value), |raw| {
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("{key} must be a valid u64 integer"))
            })
        };

        let bind_addr = read("HUB_ACCESS_RELAY_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("HUB_ACCESS_RELAY_BIND_ADDR must be a valid host:port socket address")?;

        let database_path = PathBuf::from(
            read("HUB_ACCESS_RELAY_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
        );

        let tls = match (
            read("HUB_ACCESS_RELAY_TLS_CERT_PATH"),
            read("HUB_ACCESS_RELAY_TLS_KEY_PATH"),
        ) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => bail!(
                "HUB_ACCESS_RELAY_TLS_CERT_PATH and HUB_ACCESS_RELAY_TLS_KEY_PATH must be set together"
            ),
        };

        Ok(Self {
            bind_addr,
            database_path,
            janitor_interval_ms: read_u64(
                "HUB_ACCESS_RELAY_JANITOR_INTERVAL_MS",
                DEFAULT_JANITOR_INTERVAL_MS,
            )?,
            event_retention_ms: read_u64(
                "HUB_ACCESS_RELAY_EVENT_RETENTION_MS",
                DEFAULT_EVENT_RETENTION_MS,
            )?,
            tls,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.port() == 0 {
            bail!("HUB_ACCESS_RELAY_BIND_ADDR must name a fixed port");
        }

        if self.database_path.as_os_str().is_empty() {
            bail!("HUB_ACCESS_RELAY_DB_PATH must not be empty");
        }
        if self.database_path.is_dir() {
            bail!(
                "HUB_ACCESS_RELAY_DB_PATH '{}' is a directory",
                self.database_path.display()
            );
        }

        if self.janitor_interval_ms == 0 {
            bail!("HUB_ACCESS_RELAY_JANITOR_INTERVAL_MS must be > 0");
        }
        if self.event_retention_ms == 0 {
            bail!("HUB_ACCESS_RELAY_EVENT_RETENTION_MS must be > 0");
        }

        if let Some(tls) = &self.tls {
            for (label, path) in [("cert", &tls.cert), ("key", &tls.key)] {
                if !path.is_file() {
                    bail!("TLS {label} path '{}' does not exist", path.display());
                }
            }
        }

        Ok(())
    }
}
