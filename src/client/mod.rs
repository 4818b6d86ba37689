//! Backend connector: short-lived wire-protocol sessions towards the reader
//! and writer endpoints. One connection per proxied operation; connections
//! are closed on the return path, with a best-effort rollback first when a
//! transaction is still open.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::debug;

use crate::error::{ErrorInfo, ProxyError, ProxyResult};
use crate::messages::extendedquery::{Bind, Execute, Parse, Sync};
use crate::messages::response::READY_STATUS_IDLE;
use crate::messages::simplequery::Query;
use crate::messages::startup::{
    Authentication, Password, PasswordMessageFamily, SASLInitialResponse, SASLResponse, SslRequest,
    Startup,
};
use crate::messages::{BackendMessage, FrontendMessage, Message};

pub mod auth;
pub mod config;
pub mod tls;

pub use config::{BackendEndpoint, SslMode};
pub use tls::BackendTransport;

use auth::ScramClient;

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
const CLOSE_ROLLBACK_GRACE: Duration = Duration::from_secs(1);

#[non_exhaustive]
#[derive(Debug, Default)]
pub struct BackendCodec;

impl Decoder for BackendCodec {
    type Item = BackendMessage;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        BackendMessage::decode(src)
    }
}

impl Encoder<FrontendMessage> for BackendCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: FrontendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

pub enum BackendSocket {
    Plain(TcpStream),
    Secure(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for BackendSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            BackendSocket::Plain(socket) => Pin::new(socket).poll_read(cx, buf),
            BackendSocket::Secure(socket) => Pin::new(socket).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            BackendSocket::Plain(socket) => Pin::new(socket).poll_write(cx, buf),
            BackendSocket::Secure(socket) => Pin::new(socket).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            BackendSocket::Plain(socket) => Pin::new(socket).poll_flush(cx),
            BackendSocket::Secure(socket) => Pin::new(socket).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            BackendSocket::Plain(socket) => Pin::new(socket).poll_shutdown(cx),
            BackendSocket::Secure(socket) => Pin::new(socket).poll_shutdown(cx),
        }
    }
}

/// A connected, authenticated backend session.
pub struct BackendClient {
    socket: Framed<BackendSocket, BackendCodec>,
    endpoint: String,
    in_transaction: bool,
}

impl BackendClient {
    /// Connect and run the startup handshake: optional TLS by transport
    /// mode, then authentication (trust, cleartext or SCRAM-SHA-256).
    pub async fn connect(
        endpoint: &BackendEndpoint,
        transport: &BackendTransport,
    ) -> ProxyResult<BackendClient> {
        let connect_err = |reason: String| ProxyError::BackendConnect {
            endpoint: endpoint.to_string(),
            reason,
        };

        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_nodelay(true).map_err(|e| connect_err(e.to_string()))?;

        let socket = ssl_handshake(tcp, endpoint, transport).await?;

        let mut client = BackendClient {
            socket: Framed::new(socket, BackendCodec),
            endpoint: endpoint.to_string(),
            in_transaction: false,
        };
        client.startup(endpoint).await?;

        debug!(endpoint = %client.endpoint, "backend session established");
        Ok(client)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn startup(&mut self, endpoint: &BackendEndpoint) -> ProxyResult<()> {
        let mut startup = Startup::new();
        startup
            .parameters
            .insert("user".to_owned(), endpoint.user.clone());
        if let Some(dbname) = &endpoint.dbname {
            startup
                .parameters
                .insert("database".to_owned(), dbname.clone());
        }
        startup.parameters.insert(
            "application_name".to_owned(),
            env!("CARGO_PKG_NAME").to_owned(),
        );
        self.socket.send(FrontendMessage::Startup(startup)).await?;

        let mut scram: Option<ScramClient> = None;

        while let Some(message) = self.socket.next().await {
            match message? {
                BackendMessage::Authentication(Authentication::Ok) => {}
                BackendMessage::Authentication(Authentication::CleartextPassword) => {
                    let password = self.required_password(endpoint)?;
                    self.socket
                        .send(FrontendMessage::PasswordMessageFamily(
                            PasswordMessageFamily::Password(Password::new(password)),
                        ))
                        .await?;
                }
                BackendMessage::Authentication(Authentication::SASL(mechanisms)) => {
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(ProxyError::UnsupportedBackendAuth(
                            self.endpoint.clone(),
                            mechanisms.join(","),
                        ));
                    }
                    let password = self.required_password(endpoint)?;
                    let mut client = ScramClient::new(&endpoint.user, &password);
                    let first = client.client_first();
                    scram = Some(client);
                    self.socket
                        .send(FrontendMessage::PasswordMessageFamily(
                            PasswordMessageFamily::SASLInitialResponse(SASLInitialResponse::new(
                                SCRAM_SHA_256.to_owned(),
                                Some(first.into()),
                            )),
                        ))
                        .await?;
                }
                BackendMessage::Authentication(Authentication::SASLContinue(data)) => {
                    let scram = scram.as_mut().ok_or_else(|| {
                        ProxyError::UnexpectedBackendMessage(self.endpoint.clone())
                    })?;
                    let client_final = scram.client_final(&data)?;
                    self.socket
                        .send(FrontendMessage::PasswordMessageFamily(
                            PasswordMessageFamily::SASLResponse(SASLResponse::new(
                                client_final.into(),
                            )),
                        ))
                        .await?;
                }
                BackendMessage::Authentication(Authentication::SASLFinal(data)) => {
                    let scram = scram.as_mut().ok_or_else(|| {
                        ProxyError::UnexpectedBackendMessage(self.endpoint.clone())
                    })?;
                    scram.verify_server_final(&data)?;
                }
                BackendMessage::Authentication(Authentication::MD5Password(_)) => {
                    return Err(ProxyError::UnsupportedBackendAuth(
                        self.endpoint.clone(),
                        "md5".to_owned(),
                    ));
                }
                BackendMessage::ParameterStatus(_)
                | BackendMessage::BackendKeyData(_)
                | BackendMessage::NoticeResponse(_) => {}
                BackendMessage::ReadyForQuery(_) => return Ok(()),
                BackendMessage::ErrorResponse(ref e) => {
                    return Err(ProxyError::Backend(Box::new(ErrorInfo::from(e))));
                }
                _ => {
                    return Err(ProxyError::UnexpectedBackendMessage(self.endpoint.clone()));
                }
            }
        }

        Err(ProxyError::BackendConnect {
            endpoint: self.endpoint.clone(),
            reason: "connection closed during startup".to_owned(),
        })
    }

    fn required_password(&self, endpoint: &BackendEndpoint) -> ProxyResult<String> {
        endpoint.password.clone().ok_or_else(|| {
            ProxyError::UnsupportedBackendAuth(
                self.endpoint.clone(),
                "password required but not configured".to_owned(),
            )
        })
    }

    /// Run a statement through the simple protocol, discarding result rows.
    /// Returns the command tag of the (first) completed statement.
    pub async fn execute_simple(&mut self, sql: &str) -> ProxyResult<String> {
        self.socket
            .send(FrontendMessage::Query(Query::new(sql.to_owned())))
            .await?;

        let mut tag: Option<String> = None;
        let mut error: Option<ProxyError> = None;

        while let Some(message) = self.socket.next().await {
            match message? {
                BackendMessage::CommandComplete(cc) => {
                    tag.get_or_insert(cc.tag);
                }
                BackendMessage::EmptyQueryResponse(_) => {
                    tag.get_or_insert_with(String::new);
                }
                BackendMessage::ErrorResponse(ref e) => {
                    // keep draining to ReadyForQuery so the session stays usable
                    error.get_or_insert(ProxyError::Backend(Box::new(ErrorInfo::from(e))));
                }
                BackendMessage::ReadyForQuery(ready) => {
                    self.in_transaction = ready.status != READY_STATUS_IDLE;
                    return match error {
                        Some(e) => Err(e),
                        None => Ok(tag.unwrap_or_default()),
                    };
                }
                // rows of a simple SELECT issued through this verb are dropped
                _ => {}
            }
        }

        Err(ProxyError::BackendConnect {
            endpoint: self.endpoint.clone(),
            reason: "connection closed mid-statement".to_owned(),
        })
    }

    /// Run one parameterized statement through the extended protocol in the
    /// backend's unnamed slots, discarding result rows. Returns the tag.
    pub async fn execute_extended(
        &mut self,
        sql: &str,
        parameter_oids: &[postgres_types::Oid],
        parameter_format_codes: &[i16],
        parameters: &[Option<bytes::Bytes>],
    ) -> ProxyResult<String> {
        self.socket
            .feed(FrontendMessage::Parse(Parse::new(
                None,
                sql.to_owned(),
                parameter_oids.to_vec(),
            )))
            .await?;
        self.socket
            .feed(FrontendMessage::Bind(Bind::new(
                None,
                None,
                parameter_format_codes.to_vec(),
                parameters.to_vec(),
                vec![],
            )))
            .await?;
        self.socket
            .feed(FrontendMessage::Execute(Execute::new(None, 0)))
            .await?;
        self.socket.send(FrontendMessage::Sync(Sync::new())).await?;

        let mut tag: Option<String> = None;
        let mut error: Option<ProxyError> = None;

        while let Some(message) = self.socket.next().await {
            match message? {
                BackendMessage::CommandComplete(cc) => {
                    tag.get_or_insert(cc.tag);
                }
                BackendMessage::EmptyQueryResponse(_) => {
                    tag.get_or_insert_with(String::new);
                }
                BackendMessage::ErrorResponse(ref e) => {
                    error.get_or_insert(ProxyError::Backend(Box::new(ErrorInfo::from(e))));
                }
                BackendMessage::ReadyForQuery(ready) => {
                    self.in_transaction = ready.status != READY_STATUS_IDLE;
                    return match error {
                        Some(e) => Err(e),
                        None => Ok(tag.unwrap_or_default()),
                    };
                }
                _ => {}
            }
        }

        Err(ProxyError::BackendConnect {
            endpoint: self.endpoint.clone(),
            reason: "connection closed mid-statement".to_owned(),
        })
    }

    pub async fn begin(&mut self) -> ProxyResult<String> {
        self.execute_simple("BEGIN").await
    }

    pub async fn commit(&mut self) -> ProxyResult<String> {
        self.execute_simple("COMMIT").await
    }

    pub async fn rollback(&mut self) -> ProxyResult<String> {
        self.execute_simple("ROLLBACK").await
    }

    /// Read the next backend message. Used by the relay paths in the proxy
    /// handler, which forward row traffic to the frontend verbatim.
    pub async fn next_message(&mut self) -> ProxyResult<BackendMessage> {
        match self.socket.next().await {
            Some(message) => {
                let message = message?;
                if let BackendMessage::ReadyForQuery(ref ready) = message {
                    self.in_transaction = ready.status != READY_STATUS_IDLE;
                }
                Ok(message)
            }
            None => Err(ProxyError::BackendConnect {
                endpoint: self.endpoint.clone(),
                reason: "connection closed mid-statement".to_owned(),
            }),
        }
    }

    pub async fn send_message(&mut self, message: FrontendMessage) -> ProxyResult<()> {
        self.socket.send(message).await
    }

    pub async fn feed_message(&mut self, message: FrontendMessage) -> ProxyResult<()> {
        self.socket.feed(message).await
    }

    /// Close the session, rolling an open transaction back first on a best
    /// effort basis.
    pub async fn close(mut self) {
        if self.in_transaction {
            let _ = tokio::time::timeout(CLOSE_ROLLBACK_GRACE, self.rollback()).await;
        }
        let _ = self.socket.close().await;
    }
}

async fn ssl_handshake(
    mut tcp: TcpStream,
    endpoint: &BackendEndpoint,
    transport: &BackendTransport,
) -> ProxyResult<BackendSocket> {
    let connect_err = |reason: String| ProxyError::BackendConnect {
        endpoint: endpoint.to_string(),
        reason,
    };

    let Some(connector) = &transport.connector else {
        return Ok(BackendSocket::Plain(tcp));
    };

    let mut buf = BytesMut::with_capacity(SslRequest::BODY_SIZE);
    SslRequest::new().encode(&mut buf)?;
    tcp.write_all(&buf).await?;

    match tcp.read_u8().await? {
        b'S' => {
            let server_name = ServerName::try_from(endpoint.host.clone())
                .map_err(|e| connect_err(e.to_string()))?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| connect_err(format!("tls handshake failed: {e}")))?;
            Ok(BackendSocket::Secure(Box::new(tls_stream)))
        }
        // every non-disable mode insists on encryption
        _ => Err(connect_err(
            "backend refused the encrypted-transport request".to_owned(),
        )),
    }
}
