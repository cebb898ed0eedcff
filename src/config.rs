use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::limits::MAX_PROMOTION_WINDOW_MS;
use crate::model::{DEFAULT_PROMOTION_WINDOW_MS, Ms, RequeuePolicy};

/// Per-tenant engine policy. Every tenant created by one server shares it.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Time a promoted actor has to confirm.
    pub promotion_window_ms: Ms,
    /// Where a confirmation that lost the last slot goes back into line.
    pub requeue: RequeuePolicy,
    /// How long one attempt waits for a resource lock.
    pub lock_timeout: Duration,
    /// Attempts before giving up with `ConcurrentConflict`.
    pub lock_retries: u32,
    pub sweep_interval: Duration,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            promotion_window_ms: DEFAULT_PROMOTION_WINDOW_MS,
            requeue: RequeuePolicy::Front,
            lock_timeout: Duration::from_millis(250),
            lock_retries: 3,
            sweep_interval: Duration::from_secs(60),
            compact_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl TlsSettings {
    /// Build the acceptor. Both paths or neither; neither means plaintext.
    pub fn acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.cert, &self.key) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both SLOTLINE_TLS_CERT and SLOTLINE_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| {
                io::Error::new(ErrorKind::InvalidInput, "no private key found in key file")
            })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }

    pub fn enabled(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// Server configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls: TlsSettings,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparseable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            promotion_window_ms: parsed::<Ms>(&get, "SLOTLINE_PROMOTION_WINDOW_MS")
                .filter(|ms| (1..=MAX_PROMOTION_WINDOW_MS).contains(ms))
                .unwrap_or(defaults.promotion_window_ms),
            requeue: get("SLOTLINE_REQUEUE")
                .and_then(|s| RequeuePolicy::parse(&s))
                .unwrap_or(defaults.requeue),
            lock_timeout: parsed::<u64>(&get, "SLOTLINE_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            lock_retries: parsed::<u32>(&get, "SLOTLINE_LOCK_RETRIES")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.lock_retries),
            sweep_interval: parsed::<u64>(&get, "SLOTLINE_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            compact_threshold: parsed(&get, "SLOTLINE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
        };

        Self {
            port: parsed(&get, "SLOTLINE_PORT").unwrap_or(5433),
            bind: get("SLOTLINE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("SLOTLINE_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: get("SLOTLINE_PASSWORD").unwrap_or_else(|| "slotline".into()),
            max_connections: parsed(&get, "SLOTLINE_MAX_CONNECTIONS").unwrap_or(256),
            metrics_port: parsed(&get, "SLOTLINE_METRICS_PORT"),
            tls: TlsSettings {
                cert: get("SLOTLINE_TLS_CERT").map(PathBuf::from),
                key: get("SLOTLINE_TLS_KEY").map(PathBuf::from),
            },
            engine,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}
