use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `VENUEBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "venuebook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_var(&lookup, "VENUEBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("VENUEBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("VENUEBOOK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("VENUEBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "VENUEBOOK_MAX_CONNECTIONS")
                .map(|v: usize| v.max(1))
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "VENUEBOOK_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("VENUEBOOK_TLS_CERT"),
            tls_key: lookup("VENUEBOOK_TLS_KEY"),
            metrics_port: parse_var(&lookup, "VENUEBOOK_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
