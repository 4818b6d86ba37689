//! Process configuration. Everything is read from the environment once at
//! startup and validated before the listener binds; configuration problems
//! never surface mid-session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::client::config::{BackendEndpoint, SslMode};
use crate::credentials::CredentialProvider;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:54329";
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SECRET_DIR: &str = "/var/run/secrets/pgmux";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingVar(&'static str),
    #[error("invalid {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("endpoint is missing a host")]
    MissingEndpointHost,
    #[error("at least one writer endpoint is required")]
    NoWriters,
    #[error("a root CA bundle is required for verify-ca and verify-full")]
    MissingRootCa,
    #[error("{0} and {1} must be configured together")]
    MutuallyDependent(&'static str, &'static str),
    #[error("unknown credential source: {0}")]
    UnknownCredentialSource(String),
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Certificate and key presented to clients when the encrypted-transport
/// offering is enabled.
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Transport settings applied to every backend connection.
#[derive(Debug, Clone, Default)]
pub struct BackendTlsConfig {
    pub mode: SslMode,
    pub root_ca: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ProxyConfig {
    pub listen: String,
    pub reader: BackendEndpoint,
    /// ordered, non-empty
    pub writers: Vec<BackendEndpoint>,
    pub client_tls: Option<ClientTlsConfig>,
    pub backend_tls: BackendTlsConfig,
    pub credential_provider: Arc<CredentialProvider>,
    pub credential_reload_interval: Option<Duration>,
    pub query_timeout: Duration,
}

impl ProxyConfig {
    pub fn from_env() -> Result<ProxyConfig, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<ProxyConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen = lookup("PGMUX_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_owned());

        let reader = BackendEndpoint::parse(
            &lookup("PGMUX_READER").ok_or(ConfigError::MissingVar("PGMUX_READER"))?,
        )?;

        let writers_csv =
            lookup("PGMUX_WRITERS").ok_or(ConfigError::MissingVar("PGMUX_WRITERS"))?;
        let writers = writers_csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(BackendEndpoint::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if writers.is_empty() {
            return Err(ConfigError::NoWriters);
        }

        let client_tls = match (lookup("PGMUX_TLS_CERT"), lookup("PGMUX_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(ClientTlsConfig {
                cert: cert.into(),
                key: key.into(),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::MutuallyDependent(
                    "PGMUX_TLS_CERT",
                    "PGMUX_TLS_KEY",
                ));
            }
        };

        let backend_tls = {
            let mode = lookup("PGMUX_BACKEND_TLS_MODE")
                .map(|v| v.parse::<SslMode>())
                .transpose()?
                .unwrap_or_default();

            let root_ca = lookup("PGMUX_BACKEND_TLS_ROOT_CA").map(PathBuf::from);
            if matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull) && root_ca.is_none() {
                return Err(ConfigError::MissingRootCa);
            }

            let (client_cert, client_key) = match (
                lookup("PGMUX_BACKEND_TLS_CLIENT_CERT"),
                lookup("PGMUX_BACKEND_TLS_CLIENT_KEY"),
            ) {
                (Some(cert), Some(key)) => (Some(cert.into()), Some(key.into())),
                (None, None) => (None, None),
                _ => {
                    return Err(ConfigError::MutuallyDependent(
                        "PGMUX_BACKEND_TLS_CLIENT_CERT",
                        "PGMUX_BACKEND_TLS_CLIENT_KEY",
                    ));
                }
            };

            BackendTlsConfig {
                mode,
                root_ca,
                client_cert,
                client_key,
            }
        };

        let credential_provider = match lookup("PGMUX_CREDENTIAL_SOURCE").as_deref() {
            None | Some("") | Some("env") => CredentialProvider::Env {
                users: lookup("PGMUX_USERS").unwrap_or_default(),
            },
            Some("file") => CredentialProvider::File {
                path: lookup("PGMUX_CREDENTIAL_FILE")
                    .ok_or(ConfigError::MissingVar("PGMUX_CREDENTIAL_FILE"))?
                    .into(),
                key: lookup("PGMUX_CREDENTIAL_KEY")
                    .map(|k| crate::credentials::provider::derive_file_key(&k)),
            },
            Some("mounted-secret") => CredentialProvider::MountedSecret {
                dir: lookup("PGMUX_SECRET_DIR")
                    .unwrap_or_else(|| DEFAULT_SECRET_DIR.to_owned())
                    .into(),
            },
            Some("remote-kv") => CredentialProvider::RemoteKv,
            Some("cloud-secret") => CredentialProvider::CloudSecret,
            Some("http") => CredentialProvider::Http,
            Some(other) => return Err(ConfigError::UnknownCredentialSource(other.to_owned())),
        };
        let credential_provider = Arc::new(credential_provider);

        let credential_reload_interval = lookup("PGMUX_CREDENTIAL_RELOAD_INTERVAL")
            .map(|v| {
                v.parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidValue {
                        name: "PGMUX_CREDENTIAL_RELOAD_INTERVAL",
                        value: v,
                    })
            })
            .transpose()?
            .filter(|interval| !interval.is_zero() && credential_provider.supports_reload());

        let query_timeout = lookup("PGMUX_QUERY_TIMEOUT_SECS")
            .map(|v| {
                v.parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidValue {
                        name: "PGMUX_QUERY_TIMEOUT_SECS",
                        value: v,
                    })
            })
            .transpose()?
            .unwrap_or(DEFAULT_QUERY_TIMEOUT);

        Ok(ProxyConfig {
            listen,
            reader,
            writers,
            client_tls,
            backend_tls,
            credential_provider,
            credential_reload_interval,
            query_timeout,
        })
    }
}
