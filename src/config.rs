use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

/// Server settings, read from `OFFHIRE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    /// Submissions per renter per hour; 0 disables the throttle.
    pub submit_limit: u32,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: parse_or("OFFHIRE_PORT", get("OFFHIRE_PORT"), 5433),
            bind: get("OFFHIRE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("OFFHIRE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("OFFHIRE_PASSWORD").unwrap_or_else(|| "offhire".into()),
            max_connections: parse_or("OFFHIRE_MAX_CONNECTIONS", get("OFFHIRE_MAX_CONNECTIONS"), 256),
            compact_threshold: parse_or("OFFHIRE_COMPACT_THRESHOLD", get("OFFHIRE_COMPACT_THRESHOLD"), 1000),
            sweep_interval: Duration::from_secs(parse_or(
                "OFFHIRE_SWEEP_INTERVAL_SECS",
                get("OFFHIRE_SWEEP_INTERVAL_SECS"),
                3600,
            )),
            submit_limit: parse_or("OFFHIRE_SUBMIT_LIMIT", get("OFFHIRE_SUBMIT_LIMIT"), 20),
            tls_cert: get("OFFHIRE_TLS_CERT"),
            tls_key: get("OFFHIRE_TLS_KEY"),
            metrics_port: get("OFFHIRE_METRICS_PORT").and_then(|s| s.parse().ok()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("offhire.wal")
    }

    /// TLS acceptor from the configured PEM files. Both or neither must be set.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both OFFHIRE_TLS_CERT and OFFHIRE_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn parse_or<T: FromStr>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(s) => s.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring invalid {name}={s:?}");
            default
        }),
    }
}
