use std::net::{IpAddr, SocketAddr};

use mrs_types::Identity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment variable MRS_{0} is required")]
    Missing(&'static str),
    #[error("environment variable MRS_{name} was not a valid {kind}: {value:?}")]
    Invalid {
        name: &'static str,
        kind: &'static str,
        value: String,
    },
}

/// Server configuration, loaded from `MRS_`-prefixed environment
/// variables the way `noosphere-gateway`'s CLI layers flags over a config
/// file -- here there is no on-disk config file, environment variables
/// are the whole of it. Validated eagerly at startup so a misconfigured
/// deployment fails fast with a readable message rather than at the first
/// request that touches the bad value.
#[derive(Debug, Clone)]
pub struct Config {
    /// This server's own canonical URL, e.g. `https://a.example`. Used as
    /// `origin_server` for locally-authored registrations and as the
    /// `server` field of `/.well-known/mrs`.
    pub server_url: String,
    /// The bare domain this server signs outbound requests as
    /// (`_server@{server_domain}`) and serves key material under.
    pub server_domain: String,
    /// The identity authorized to call `/admin/peers`.
    pub admin_identity: Identity,
    pub bind: SocketAddr,
    /// Accepted for compatibility with deployments that expect a
    /// persistence path; this implementation's store is in-memory and
    /// never reads or writes it.
    pub database_path: Option<String>,
    /// Peers seeded as `is_configured = true` at startup.
    pub bootstrap_peers: Vec<String>,
    pub max_radius_m: f64,
    pub max_results: usize,
    pub token_expiry_hours: i64,
    pub key_cache_ttl_secs: u64,
    pub tombstone_retention_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_url = require("SERVER_URL")?;
        let parsed_server_url = url::Url::parse(&server_url).map_err(|_| ConfigError::Invalid {
            name: "SERVER_URL",
            kind: "URL",
            value: server_url.clone(),
        })?;
        if parsed_server_url.scheme() != "https" && parsed_server_url.scheme() != "http" {
            return Err(ConfigError::Invalid {
                name: "SERVER_URL",
                kind: "http(s) URL",
                value: server_url,
            });
        }

        let server_domain = match std::env::var("SERVER_DOMAIN") {
            Ok(domain) => domain,
            Err(_) => parsed_server_url
                .host_str()
                .ok_or(ConfigError::Invalid {
                    name: "SERVER_URL",
                    kind: "URL with a host",
                    value: server_url.clone(),
                })?
                .to_string(),
        };

        let admin_email = require("ADMIN_EMAIL")?;
        let admin_identity: Identity = admin_email.parse().map_err(|_| ConfigError::Invalid {
            name: "ADMIN_EMAIL",
            kind: "identity",
            value: admin_email,
        })?;

        let host: IpAddr = optional_parsed("HOST", "127.0.0.1".parse().unwrap())?;
        let port: u16 = optional_parsed("PORT", 8080)?;
        let bind = SocketAddr::new(host, port);

        let database_path = std::env::var("DATABASE_PATH").ok();

        let bootstrap_peers = match std::env::var("BOOTSTRAP_PEERS") {
            Ok(raw) => serde_json::from_str::<Vec<String>>(&raw).map_err(|_| ConfigError::Invalid {
                name: "BOOTSTRAP_PEERS",
                kind: "JSON array of URLs",
                value: raw,
            })?,
            Err(_) => Vec::new(),
        };

        let max_radius_m = optional_parsed("MAX_RADIUS", 1_000_000.0)?;
        let max_results: usize = optional_parsed("MAX_RESULTS", mrs_registry::MAX_SEARCH_LIMIT)?;
        let token_expiry_hours = optional_parsed("TOKEN_EXPIRY_HOURS", 24 * 30)?;
        let key_cache_ttl_secs = optional_parsed("KEY_CACHE_TTL_SECONDS", 3600)?;
        let tombstone_retention_days = optional_parsed("TOMBSTONE_RETENTION_DAYS", 30)?;

        Ok(Config {
            server_url,
            server_domain,
            admin_identity,
            bind,
            database_path,
            bootstrap_peers,
            max_radius_m,
            max_results,
            token_expiry_hours,
            key_cache_ttl_secs,
            tombstone_retention_days,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(format!("MRS_{name}")).map_err(|_| ConfigError::Missing(name))
}

fn optional_parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(format!("MRS_{name}")) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            kind: std::any::type_name::<T>(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_server_url_is_rejected() {
        std::env::remove_var("MRS_SERVER_URL");
        std::env::remove_var("MRS_ADMIN_EMAIL");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SERVER_URL")));
    }
}
