//! Connection configuration.
//!
//! The connection string is the `key=value;...` syntax, keys matched
//! case-insensitively and ignoring embedded spaces, so `Max Pool Size` and
//! `MaxPoolSize` name the same setting.
use std::{env::var, time::Duration};

use crate::common::ByteStr;

/// Hard upper bound on pool sizing keys.
pub const POOL_SIZE_LIMIT: usize = 1024;

/// Parsed connection configuration.
///
/// The original connection-string text is kept verbatim; it is the identity
/// of the pool serving this configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) raw: ByteStr,
    pub(crate) host: ByteStr,
    pub(crate) port: u16,
    pub(crate) user: ByteStr,
    pub(crate) password: ByteStr,
    pub(crate) database: Option<ByteStr>,
    pub(crate) min_pool_size: usize,
    pub(crate) max_pool_size: usize,
    /// `None` means wait forever for a pooled connector.
    pub(crate) acquire_timeout: Option<Duration>,
    /// `None` means no per-execute deadline.
    pub(crate) command_timeout: Option<Duration>,
    pub(crate) pooling: bool,
    pub(crate) search_path: Option<ByteStr>,
    pub(crate) application_name: Option<ByteStr>,
    pub(crate) no_reset_on_close: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            raw: ByteStr::default(),
            host: ByteStr::from_static("localhost"),
            port: 5432,
            user: ByteStr::from_static("postgres"),
            password: ByteStr::default(),
            database: None,
            min_pool_size: 0,
            max_pool_size: 100,
            acquire_timeout: Some(Duration::from_secs(15)),
            command_timeout: Some(Duration::from_secs(30)),
            pooling: true,
            search_path: None,
            application_name: None,
            no_reset_on_close: false,
        }
    }
}

impl Config {
    /// Parse a `key=value;...` connection string.
    pub fn parse(conn_str: &str) -> Result<Config, ParseError> {
        let raw = ByteStr::copy_from_str(conn_str);
        let mut config = Config { raw: raw.clone(), ..Config::default() };

        for segment in raw.as_str().split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let Some((key, value)) = segment.split_once('=') else {
                return Err(ParseError::Syntax(segment.to_owned()));
            };

            let folded: String = key
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            let value = value.trim();

            match folded.as_str() {
                "host" | "server" => config.host = raw.slice_ref(value),
                "port" => config.port = parse_num(value, "Port", 1, u16::MAX as u64)? as u16,
                "database" => config.database = Some(raw.slice_ref(value)),
                "username" | "user" => config.user = raw.slice_ref(value),
                "password" => config.password = raw.slice_ref(value),
                "minpoolsize" => {
                    config.min_pool_size =
                        parse_num(value, "MinPoolSize", 0, POOL_SIZE_LIMIT as u64)? as usize;
                }
                "maxpoolsize" => {
                    config.max_pool_size =
                        parse_num(value, "MaxPoolSize", 1, POOL_SIZE_LIMIT as u64)? as usize;
                }
                "timeout" => {
                    config.acquire_timeout = parse_seconds(value, "Timeout")?;
                }
                "commandtimeout" => {
                    config.command_timeout = parse_seconds(value, "CommandTimeout")?;
                }
                "pooling" => config.pooling = parse_bool(value, "Pooling")?,
                "searchpath" => config.search_path = Some(raw.slice_ref(value)),
                "applicationname" => config.application_name = Some(raw.slice_ref(value)),
                "noresetonclose" => config.no_reset_on_close = parse_bool(value, "NoResetOnClose")?,
                "encoding" => {
                    let folded: String = value
                        .chars()
                        .filter(|c| *c != '-')
                        .map(|c| c.to_ascii_lowercase())
                        .collect();
                    if folded != "utf8" {
                        return Err(ParseError::InvalidValue {
                            key: "Encoding",
                            value: value.to_owned(),
                        });
                    }
                }
                _ => return Err(ParseError::UnknownKey(key.trim().to_owned())),
            }
        }

        Ok(config)
    }

    /// Retrieve configuration from the conventional environment variables:
    /// `PGHOST`, `PGPORT`, `PGUSER`, `PGPASSWORD` and `PGDATABASE`.
    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Ok(host) = var("PGHOST") {
            config.host = host.into();
        }
        if let Ok(port) = var("PGPORT") {
            config.port = port.parse().unwrap_or(5432);
        }
        if let Ok(user) = var("PGUSER") {
            config.user = user.into();
        }
        if let Ok(password) = var("PGPASSWORD") {
            config.password = password.into();
        }
        if let Ok(database) = var("PGDATABASE") {
            config.database = Some(database.into());
        }
        config
    }

    /// The verbatim connection string this config was parsed from.
    pub fn conn_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Run-time parameters forwarded in the startup message.
    pub(crate) fn startup_params(&self) -> Vec<(&str, &str)> {
        let mut params = vec![("client_encoding", "UTF8")];
        if let Some(name) = &self.application_name {
            params.push(("application_name", name));
        }
        if let Some(path) = &self.search_path {
            params.push(("search_path", path));
        }
        params
    }
}

impl std::str::FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_num(value: &str, key: &'static str, min: u64, max: u64) -> Result<u64, ParseError> {
    let n: u64 = value
        .parse()
        .map_err(|_| ParseError::InvalidValue { key, value: value.to_owned() })?;
    if n < min || n > max {
        return Err(ParseError::OutOfRange { key });
    }
    Ok(n)
}

/// Zero means "no deadline" for both timeout keys.
fn parse_seconds(value: &str, key: &'static str) -> Result<Option<Duration>, ParseError> {
    let secs: u64 = value
        .parse()
        .map_err(|_| ParseError::InvalidValue { key, value: value.to_owned() })?;
    Ok((secs != 0).then(|| Duration::from_secs(secs)))
}

fn parse_bool(value: &str, key: &'static str) -> Result<bool, ParseError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ParseError::InvalidValue { key, value: value.to_owned() }),
    }
}

/// Error when parsing or validating a connection string.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("expected `key=value`, found {0:?}")]
    Syntax(String),
    #[error("unknown connection string key {0:?}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} is out of range")]
    OutOfRange { key: &'static str },
    #[error("MinPoolSize may not exceed MaxPoolSize")]
    MinAboveMax,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_core_keys() {
        let c = Config::parse(
            "Host=db.example.com;Port=5433;Database=app;Username=svc;Password=hunter2;\
             MinPoolSize=2;MaxPoolSize=10;Timeout=5;CommandTimeout=0;SearchPath=audit",
        )
        .unwrap();
        assert_eq!(c.host(), "db.example.com");
        assert_eq!(c.port(), 5433);
        assert_eq!(c.database(), Some("app"));
        assert_eq!(c.user(), "svc");
        assert_eq!(c.min_pool_size, 2);
        assert_eq!(c.max_pool_size, 10);
        assert_eq!(c.acquire_timeout, Some(Duration::from_secs(5)));
        assert_eq!(c.command_timeout, None);
        assert_eq!(c.search_path.as_deref(), Some("audit"));
    }

    #[test]
    fn keys_are_case_and_space_insensitive() {
        let c = Config::parse("HOST=h;max pool size=3;pooling=false").unwrap();
        assert_eq!(c.host(), "h");
        assert_eq!(c.max_pool_size, 3);
        assert!(!c.pooling);
    }

    #[test]
    fn min_above_limit_is_out_of_range() {
        let err = Config::parse("MinPoolSize=1025").unwrap_err();
        assert!(matches!(err, ParseError::OutOfRange { key: "MinPoolSize" }));
    }

    #[test]
    fn max_pool_size_zero_is_out_of_range() {
        let err = Config::parse("MaxPoolSize=0").unwrap_err();
        assert!(matches!(err, ParseError::OutOfRange { key: "MaxPoolSize" }));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = Config::parse("Host=h;Bogus=1").unwrap_err();
        assert!(matches!(err, ParseError::UnknownKey(k) if k == "Bogus"));
    }

    #[test]
    fn encoding_accepts_utf8_only() {
        assert!(Config::parse("Encoding=UTF-8").is_ok());
        assert!(Config::parse("Encoding=utf8").is_ok());
        assert!(Config::parse("Encoding=latin1").is_err());
    }

    #[test]
    fn zero_timeout_means_forever() {
        let c = Config::parse("Timeout=0").unwrap();
        assert_eq!(c.acquire_timeout, None);
    }

    #[test]
    fn startup_params_forward_session_settings() {
        let c = Config::parse("ApplicationName=worker;SearchPath=audit").unwrap();
        let params = c.startup_params();
        assert!(params.contains(&("client_encoding", "UTF8")));
        assert!(params.contains(&("application_name", "worker")));
        assert!(params.contains(&("search_path", "audit")));
    }
}
