//! Startup and authentication handling.
//!
//! Sessions begin in trust mode when the credential store is empty;
//! otherwise the handler drives a SCRAM-SHA-256 exchange against the stored
//! verifier, with `tls-server-end-point` channel binding on encrypted
//! transports.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::sink::{Sink, SinkExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use self::scram::{ScramServer, ScramServerInFlight};
use super::{ClientInfo, SessionState, METADATA_APPLICATION_NAME, METADATA_USER};
use crate::credentials::{CredentialStore, UserCredential};
use crate::error::{ProxyError, ProxyResult};
use crate::messages::response::{ReadyForQuery, READY_STATUS_IDLE};
use crate::messages::startup::{Authentication, BackendKeyData, ParameterStatus, Startup};
use crate::messages::{BackendMessage, FrontendMessage};

pub mod scram;

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Handles the startup phase of a session, up to the first ReadyForQuery.
#[async_trait]
pub trait StartupHandler: Send + Sync {
    async fn on_startup<C>(&self, client: &mut C, message: FrontendMessage) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>;
}

/// Produces the ParameterStatus burst clients expect after AuthenticationOk.
pub trait ServerParameterProvider: Send + Sync {
    fn server_parameters<C>(&self, client: &C) -> HashMap<String, String>
    where
        C: ClientInfo;
}

#[non_exhaustive]
#[derive(Debug)]
pub struct DefaultServerParameterProvider {
    pub server_version: String,
    pub server_encoding: String,
    pub client_encoding: String,
    pub date_style: String,
    pub time_zone: String,
    pub integer_datetimes: bool,
    pub standard_conforming_strings: bool,
}

impl Default for DefaultServerParameterProvider {
    fn default() -> Self {
        Self {
            server_version: format!("16.6 (pgmux {})", env!("CARGO_PKG_VERSION")),
            server_encoding: "UTF8".to_owned(),
            client_encoding: "UTF8".to_owned(),
            date_style: "ISO, YMD".to_owned(),
            time_zone: "Etc/UTC".to_owned(),
            integer_datetimes: true,
            standard_conforming_strings: true,
        }
    }
}

fn bool_to_string(v: bool) -> String {
    if v {
        "on".to_string()
    } else {
        "off".to_string()
    }
}

impl ServerParameterProvider for DefaultServerParameterProvider {
    fn server_parameters<C>(&self, client: &C) -> HashMap<String, String>
    where
        C: ClientInfo,
    {
        let mut params = HashMap::with_capacity(9);
        params.insert("server_version".to_owned(), self.server_version.clone());
        params.insert("server_encoding".to_owned(), self.server_encoding.clone());
        params.insert("client_encoding".to_owned(), self.client_encoding.clone());
        params.insert("DateStyle".to_owned(), self.date_style.clone());
        params.insert("TimeZone".to_owned(), self.time_zone.clone());
        params.insert(
            "integer_datetimes".to_owned(),
            bool_to_string(self.integer_datetimes),
        );
        params.insert(
            "standard_conforming_strings".to_owned(),
            bool_to_string(self.standard_conforming_strings),
        );

        if let Some(application_name) = client.metadata().get(METADATA_APPLICATION_NAME) {
            params.insert(METADATA_APPLICATION_NAME.to_owned(), application_name.clone());
        }
        if let Some(user) = client.metadata().get(METADATA_USER) {
            params.insert("session_authorization".to_owned(), user.clone());
        }

        params
    }
}

pub fn save_startup_parameters_to_metadata<C>(client: &mut C, startup_message: &Startup)
where
    C: ClientInfo,
{
    client.metadata_mut().extend(
        startup_message
            .parameters
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned())),
    );
}

/// Emit AuthenticationOk, the server parameter burst, BackendKeyData and
/// the first ReadyForQuery, then move the session into the steady state.
pub async fn finish_authentication<C, P>(
    client: &mut C,
    server_parameter_provider: &P,
) -> ProxyResult<()>
where
    C: ClientInfo + Sink<BackendMessage> + Unpin,
    C::Error: Debug,
    ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    P: ServerParameterProvider,
{
    client
        .feed(BackendMessage::Authentication(Authentication::Ok))
        .await?;

    for (k, v) in server_parameter_provider.server_parameters(client) {
        client
            .feed(BackendMessage::ParameterStatus(ParameterStatus::new(k, v)))
            .await?;
    }

    // the secret key is emitted for client compatibility only; the cancel
    // side channel is not honored
    client
        .feed(BackendMessage::BackendKeyData(BackendKeyData::new(
            std::process::id() as i32,
            rand::random::<i32>(),
        )))
        .await?;

    client
        .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(
            READY_STATUS_IDLE,
        )))
        .await?;

    client.set_state(SessionState::ReadyForQuery);
    Ok(())
}

#[derive(Debug)]
enum SaslFlow {
    Initial,
    InFlight(ScramServerInFlight),
    Finished,
}

/// Startup handler of the proxy. Trust mode when the store is empty,
/// SCRAM-SHA-256 otherwise. One instance per session; `state` tracks the
/// exchange.
#[derive(Debug)]
pub struct ScramStartupHandler<P> {
    credentials: Arc<CredentialStore>,
    parameter_provider: Arc<P>,
    /// SHA-256 over the server certificate DER, present when client TLS is
    /// configured
    cert_signature: Option<Arc<Vec<u8>>>,
    state: Mutex<SaslFlow>,
}

impl<P> ScramStartupHandler<P> {
    pub fn new(
        credentials: Arc<CredentialStore>,
        parameter_provider: Arc<P>,
        cert_signature: Option<Arc<Vec<u8>>>,
    ) -> Self {
        ScramStartupHandler {
            credentials,
            parameter_provider,
            cert_signature,
            state: Mutex::new(SaslFlow::Initial),
        }
    }
}

#[async_trait]
impl<P: ServerParameterProvider> StartupHandler for ScramStartupHandler<P> {
    async fn on_startup<C>(&self, client: &mut C, message: FrontendMessage) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        match message {
            FrontendMessage::Startup(ref startup) => {
                save_startup_parameters_to_metadata(client, startup);

                let user = client.metadata().get(METADATA_USER).cloned();
                let Some(user) = user.filter(|u| !u.is_empty()) else {
                    return Err(ProxyError::MissingUserParameter);
                };

                if self.credentials.is_empty() {
                    info!(user = %user, peer = %client.socket_addr(), "trust mode session");
                    finish_authentication(client, self.parameter_provider.as_ref()).await?;
                } else {
                    client.set_state(SessionState::AuthenticationInProgress);
                    client
                        .send(BackendMessage::Authentication(Authentication::SASL(vec![
                            SCRAM_SHA_256.to_owned(),
                        ])))
                        .await?;
                }
            }
            FrontendMessage::PasswordMessageFamily(msg) => {
                let mut flow = self.state.lock().await;
                match std::mem::replace(&mut *flow, SaslFlow::Finished) {
                    SaslFlow::Initial => {
                        let initial = msg.into_sasl_initial_response()?;
                        if initial.auth_method != SCRAM_SHA_256 {
                            return Err(ProxyError::UnsupportedSaslMechanism(
                                initial.auth_method,
                            ));
                        }
                        let data = initial.data.ok_or_else(|| {
                            ProxyError::InvalidScramMessage("empty client-first".to_owned())
                        })?;

                        let username = client
                            .metadata()
                            .get(METADATA_USER)
                            .cloned()
                            .unwrap_or_default();
                        // unknown users get a throwaway verifier so the
                        // exchange runs to completion either way
                        let credential = self
                            .credentials
                            .lookup(&username)
                            .unwrap_or_else(|| Arc::new(UserCredential::mock(&username)));

                        let scram = ScramServer::new(
                            credential,
                            self.cert_signature.clone(),
                            client.is_secure(),
                        );
                        let (server_first, in_flight) = scram.on_client_first(&data)?;
                        debug!(user = %username, "scram client-first accepted");

                        client
                            .send(BackendMessage::Authentication(Authentication::SASLContinue(
                                Bytes::from(server_first),
                            )))
                            .await?;
                        *flow = SaslFlow::InFlight(in_flight);
                    }
                    SaslFlow::InFlight(in_flight) => {
                        let resp = msg.into_sasl_response()?;
                        let server_final = in_flight.on_client_final(&resp.data)?;

                        client
                            .feed(BackendMessage::Authentication(Authentication::SASLFinal(
                                Bytes::from(server_final),
                            )))
                            .await?;
                        drop(flow);

                        finish_authentication(client, self.parameter_provider.as_ref()).await?;
                        info!(
                            user = client.metadata().get(METADATA_USER).map(String::as_str).unwrap_or(""),
                            peer = %client.socket_addr(),
                            "session authenticated"
                        );
                    }
                    SaslFlow::Finished => {
                        return Err(ProxyError::OutOfOrderMessage("password message"));
                    }
                }
            }
            _ => {
                return Err(ProxyError::OutOfOrderMessage(
                    "query before authentication",
                ));
            }
        }

        Ok(())
    }
}
