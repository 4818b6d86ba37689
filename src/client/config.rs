use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

/// Backend transport mode, the libpq `sslmode` vocabulary trimmed to what
/// the proxy supports. All modes except `Disable` insist on encryption and
/// treat a refused SSL request as a connect failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disable,
    /// encrypted, certificate accepted blindly
    Require,
    /// certificate chain checked against the configured roots, hostname not
    /// matched
    VerifyCa,
    /// chain checked and hostname matched
    VerifyFull,
}

impl FromStr for SslMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            _ => Err(ConfigError::InvalidValue {
                name: "backend tls mode",
                value: s.to_owned(),
            }),
        }
    }
}

/// One backend address parsed from a libpq-style key=value connection
/// string: `host=db1 port=5432 user=app password=secret dbname=orders`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: Option<String>,
}

impl BackendEndpoint {
    pub fn parse(dsn: &str) -> Result<BackendEndpoint, ConfigError> {
        let mut host = None;
        let mut port = 5432u16;
        let mut user = None;
        let mut password = None;
        let mut dbname = None;

        for token in dsn.split_whitespace() {
            let (key, value) = token.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                name: "endpoint",
                value: dsn.to_owned(),
            })?;
            match key {
                "host" => host = Some(value.to_owned()),
                "port" => {
                    port = value.parse().map_err(|_| ConfigError::InvalidValue {
                        name: "endpoint port",
                        value: value.to_owned(),
                    })?
                }
                "user" => user = Some(value.to_owned()),
                "password" => password = Some(value.to_owned()),
                "dbname" => dbname = Some(value.to_owned()),
                // other libpq keys (sslmode and friends) are governed by the
                // proxy-wide backend transport settings
                _ => {}
            }
        }

        Ok(BackendEndpoint {
            host: host.ok_or(ConfigError::MissingEndpointHost)?,
            port,
            user: user.unwrap_or_else(|| "postgres".to_owned()),
            password,
            dbname,
        })
    }
}

impl fmt::Display for BackendEndpoint {
    /// Loggable form, password withheld.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if let Some(dbname) = &self.dbname {
            write!(f, "/{}", dbname)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_dsn() {
        let ep =
            BackendEndpoint::parse("host=db1 port=5433 user=app password=s3cret dbname=orders")
                .unwrap();
        assert_eq!(ep.host, "db1");
        assert_eq!(ep.port, 5433);
        assert_eq!(ep.user, "app");
        assert_eq!(ep.password.as_deref(), Some("s3cret"));
        assert_eq!(ep.dbname.as_deref(), Some("orders"));
        // display keeps the password out of logs
        assert_eq!(ep.to_string(), "db1:5433/orders");
    }

    #[test]
    fn test_parse_defaults() {
        let ep = BackendEndpoint::parse("host=localhost").unwrap();
        assert_eq!(ep.port, 5432);
        assert_eq!(ep.user, "postgres");
        assert!(ep.password.is_none());
    }

    #[test]
    fn test_parse_rejects_missing_host_and_garbage() {
        assert!(BackendEndpoint::parse("user=app").is_err());
        assert!(BackendEndpoint::parse("not a dsn").is_err());
    }

    #[test]
    fn test_ssl_mode_from_str() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("require".parse::<SslMode>().unwrap(), SslMode::Require);
        assert_eq!("verify-ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
        assert_eq!(
            "verify-full".parse::<SslMode>().unwrap(),
            SslMode::VerifyFull
        );
        assert!("prefer".parse::<SslMode>().is_err());
    }
}
