use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Device reservation server speaking the PostgreSQL wire protocol.
#[derive(Debug, Clone, Parser)]
#[command(name = "reservd", version, about)]
pub struct Config {
    /// Address to bind the pgwire listener to.
    #[arg(long, env = "RESERVD_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "RESERVD_PORT", default_value_t = 5433)]
    pub port: u16,

    /// Directory holding one WAL file per tenant.
    #[arg(long, env = "RESERVD_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "RESERVD_PASSWORD", default_value = "reservd", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "RESERVD_MAX_CONNECTIONS", default_value_t = 256)]
    pub max_connections: usize,

    /// Appended events before a tenant's WAL is rewritten from live state.
    #[arg(long, env = "RESERVD_COMPACT_THRESHOLD", default_value_t = 1000)]
    pub compact_threshold: u64,

    /// Serve Prometheus metrics on this port. Disabled when unset.
    #[arg(long, env = "RESERVD_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[arg(long, env = "RESERVD_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "RESERVD_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Load the TLS acceptor when a certificate pair is configured.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both RESERVD_TLS_CERT and RESERVD_TLS_KEY must be set, or neither",
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
}
