//! Server configuration from `CARDFOLD_*` environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::actor::RetryPolicy;
use crate::auth::StaticTokens;
use crate::store::DEFAULT_IDLE_TIMEOUT;

pub const HOST_VAR: &str = "CARDFOLD_HOST";
pub const PORT_VAR: &str = "CARDFOLD_PORT";
pub const DATA_DIR_VAR: &str = "CARDFOLD_DATA_DIR";
pub const IDLE_TIMEOUT_VAR: &str = "CARDFOLD_IDLE_TIMEOUT_SECS";
pub const MAX_RETRIES_VAR: &str = "CARDFOLD_MAX_RETRIES";
pub const TOKENS_FILE_VAR: &str = "CARDFOLD_TOKENS_FILE";

const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read tokens file {path}: {source}")]
    TokensIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse tokens file {path}: {source}")]
    TokensParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Resolved server settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    /// Event log and snapshot directory; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub retry: RetryPolicy,
    /// JSON token table; `None` means every credential is rejected.
    pub tokens_file: Option<PathBuf>,
}

impl Config {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unset and empty variables
    /// take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host: IpAddr =
            parse(HOST_VAR, get(HOST_VAR))?.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port: u16 = parse(PORT_VAR, get(PORT_VAR))?.unwrap_or(DEFAULT_PORT);
        let idle_timeout = parse::<u64>(IDLE_TIMEOUT_VAR, get(IDLE_TIMEOUT_VAR))?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);

        let mut retry = RetryPolicy::default();
        if let Some(max_retries) = parse::<u32>(MAX_RETRIES_VAR, get(MAX_RETRIES_VAR))? {
            retry.max_retries = max_retries;
        }

        Ok(Self {
            addr: SocketAddr::new(host, port),
            data_dir: get(DATA_DIR_VAR).map(PathBuf::from),
            idle_timeout,
            retry,
            tokens_file: get(TOKENS_FILE_VAR).map(PathBuf::from),
        })
    }

    /// Load the token table named by `tokens_file`, or an empty table.
    pub fn load_identities(&self) -> Result<StaticTokens, ConfigError> {
        match &self.tokens_file {
            Some(path) => load_tokens(path),
            None => {
                tracing::warn!("{TOKENS_FILE_VAR} not set, all credentials will be rejected");
                Ok(StaticTokens::default())
            }
        }
    }
}

fn parse<T>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn load_tokens(path: &Path) -> Result<StaticTokens, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::TokensIo {
        path: path.to_owned(),
        source,
    })?;
    let tokens: StaticTokens =
        serde_json::from_str(&raw).map_err(|source| ConfigError::TokensParse {
            path: path.to_owned(),
            source,
        })?;
    tracing::info!(path = %path.display(), count = tokens.len(), "loaded identities");
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::auth::IdentityProvider;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.addr.port(), DEFAULT_PORT);
        assert!(config.data_dir.is_none());
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn explicit_values_are_used() {
        let config = Config::from_lookup(lookup(&[
            (HOST_VAR, "127.0.0.1"),
            (PORT_VAR, "9000"),
            (DATA_DIR_VAR, "/var/lib/cardfold"),
            (IDLE_TIMEOUT_VAR, "30"),
            (MAX_RETRIES_VAR, "7"),
        ]))
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/cardfold")));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 7);
    }

    #[test]
    fn empty_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[(PORT_VAR, " "), (DATA_DIR_VAR, "")])).unwrap();
        assert_eq!(config.addr.port(), DEFAULT_PORT);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn invalid_values_are_reported_with_their_key() {
        let err = Config::from_lookup(lookup(&[(PORT_VAR, "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: PORT_VAR, .. }));
        let err = Config::from_lookup(lookup(&[(HOST_VAR, "not-an-ip")])).unwrap_err();
        assert!(err.to_string().contains(HOST_VAR));
    }

    #[test]
    fn tokens_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, r#"{ "t1": { "id": "alice", "role": "business" } }"#).unwrap();
        let config = Config::from_lookup(lookup(&[(TOKENS_FILE_VAR, path.to_str().unwrap())]))
            .unwrap();

        let tokens = config.load_identities().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens.resolve("t1").unwrap().id.as_str(), "alice");
    }

    #[test]
    fn missing_or_malformed_tokens_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(load_tokens(&missing), Err(ConfigError::TokensIo { .. })));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "[1, 2]").unwrap();
        assert!(matches!(load_tokens(&bad), Err(ConfigError::TokensParse { .. })));
    }

    #[test]
    fn no_tokens_file_means_empty_table() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.load_identities().unwrap().is_empty());
    }
}
