use std::path::PathBuf;

/// Server settings, read from the environment.
///
/// | Variable | Default |
/// |----------|---------|
/// | BOOKD_BIND | 0.0.0.0 |
/// | BOOKD_PORT | 5433 |
/// | BOOKD_DATA_DIR | ./data |
/// | BOOKD_PASSWORD | bookd |
/// | BOOKD_MAX_CONNECTIONS | 256 |
/// | BOOKD_COMPACT_THRESHOLD | 1000 |
/// | BOOKD_TLS_CERT / BOOKD_TLS_KEY | unset (plaintext) |
/// | BOOKD_METRICS_PORT | unset (no exporter) |
/// | BOOKD_LOG | info |
///
/// Unparseable numbers fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between snapshot rewrites.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// `EnvFilter` directive string.
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse().ok());
        Self {
            bind: lookup("BOOKD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed("BOOKD_PORT").unwrap_or(5433),
            data_dir: lookup("BOOKD_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: lookup("BOOKD_PASSWORD").unwrap_or_else(|| "bookd".into()),
            max_connections: lookup("BOOKD_MAX_CONNECTIONS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(256),
            compact_threshold: lookup("BOOKD_COMPACT_THRESHOLD")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(1000),
            tls_cert: lookup("BOOKD_TLS_CERT"),
            tls_key: lookup("BOOKD_TLS_KEY"),
            metrics_port: parsed("BOOKD_METRICS_PORT"),
            log_filter: lookup("BOOKD_LOG").unwrap_or_else(|| "info".into()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
