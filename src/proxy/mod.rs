//! Proxy semantics: statement classification, reader relay and writer
//! fan-out, plus the wiring that hands per-session handlers to the server
//! loop.

use std::sync::Arc;

use crate::api::auth::{DefaultServerParameterProvider, ScramStartupHandler};
use crate::client::BackendTransport;
use crate::config::{ConfigError, ProxyConfig};
use crate::credentials::CredentialStore;

pub mod fanout;
pub mod handler;
pub mod router;

pub use handler::ProxyProcessor;

/// Process-wide proxy state shared across sessions.
#[derive(Debug)]
pub struct Proxy {
    credentials: Arc<CredentialStore>,
    parameter_provider: Arc<DefaultServerParameterProvider>,
    /// SHA-256 over the server certificate DER, for channel binding
    cert_signature: Option<Arc<Vec<u8>>>,
    processor: Arc<ProxyProcessor>,
}

impl Proxy {
    pub fn new(
        config: &ProxyConfig,
        credentials: Arc<CredentialStore>,
        cert_signature: Option<Arc<Vec<u8>>>,
    ) -> Result<Proxy, ConfigError> {
        let transport = BackendTransport::from_config(&config.backend_tls)?;
        Ok(Proxy {
            credentials,
            parameter_provider: Arc::new(DefaultServerParameterProvider::default()),
            cert_signature,
            processor: Arc::new(ProxyProcessor::new(config, transport)),
        })
    }

    /// A fresh startup handler for one session; the SASL exchange is
    /// session-local state.
    pub fn startup_handler(&self) -> ScramStartupHandler<DefaultServerParameterProvider> {
        ScramStartupHandler::new(
            self.credentials.clone(),
            self.parameter_provider.clone(),
            self.cert_signature.clone(),
        )
    }

    pub fn processor(&self) -> Arc<ProxyProcessor> {
        self.processor.clone()
    }
}
