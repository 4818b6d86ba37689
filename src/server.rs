//! Accept-side transport: sentinel negotiation, optional TLS upgrade and
//! the per-session message loop.

use std::fs::File;
use std::io::{BufReader, Error as IOError};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Decoder, Encoder, Framed, FramedParts};

use crate::api::auth::scram::h;
use crate::api::auth::StartupHandler;
use crate::api::query::{send_ready_for_query, ExtendedQueryHandler, SimpleQueryHandler};
use crate::api::store::SessionStore;
use crate::api::{ClientInfo, ProxySession, SessionState};
use crate::config::{ClientTlsConfig, ConfigError};
use crate::error::{ErrorInfo, ProxyError, ProxyResult};
use crate::messages::startup::{
    SslRequest, Startup, CANCEL_REQUEST_MAGIC_NUMBER, GSSENC_REQUEST_MAGIC_NUMBER,
};
use crate::messages::{BackendMessage, FrontendMessage, Message};
use crate::proxy::Proxy;
use tracing::{debug, info, warn};

// generous upper bound on the startup packet, matching real servers
const MAX_STARTUP_PACKET_LEN: i32 = 10_000;

#[non_exhaustive]
#[derive(Debug, new)]
pub struct MessageCodec {
    pub session: ProxySession,
}

impl Decoder for MessageCodec {
    type Item = FrontendMessage;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.session.state {
            // the startup packet has no type byte; sentinels were consumed
            // during transport negotiation
            SessionState::AwaitingStartup => {
                Startup::decode(src).map(|v| v.map(FrontendMessage::Startup))
            }
            _ => FrontendMessage::decode(src),
        }
    }
}

impl Encoder<BackendMessage> for MessageCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: BackendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

impl<T> ClientInfo for Framed<T, MessageCodec> {
    fn socket_addr(&self) -> SocketAddr {
        self.codec().session.socket_addr
    }

    fn is_secure(&self) -> bool {
        self.codec().session.is_secure
    }

    fn state(&self) -> SessionState {
        self.codec().session.state
    }

    fn set_state(&mut self, new_state: SessionState) {
        self.codec_mut().session.set_state(new_state);
    }

    fn metadata(&self) -> &std::collections::HashMap<String, String> {
        self.codec().session.metadata()
    }

    fn metadata_mut(&mut self) -> &mut std::collections::HashMap<String, String> {
        self.codec_mut().session.metadata_mut()
    }

    fn portal_store(&self) -> &SessionStore {
        self.codec().session.portal_store()
    }
}

enum InitialPacket {
    /// the raw startup packet, length prefix included
    Startup(BytesMut),
    Cancel,
    SslAccepted,
}

/// Read length-prefixed packets off the raw socket until something other
/// than a refusable sentinel arrives. The SSL sentinel is answered with 'S'
/// when an acceptor is configured, 'N' otherwise; the GSSAPI sentinel is
/// always refused.
async fn read_initial_packet<S>(socket: &mut S, tls_available: bool) -> ProxyResult<InitialPacket>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let len = socket.read_i32().await?;
        if !(8..=MAX_STARTUP_PACKET_LEN).contains(&len) {
            return Err(ProxyError::InvalidStartupMessage);
        }

        let mut body = vec![0u8; len as usize - 4];
        socket.read_exact(&mut body).await?;
        let code = (&body[0..4]).get_i32();

        if len == SslRequest::BODY_SIZE as i32 {
            match code {
                SslRequest::BODY_MAGIC_NUMBER => {
                    if tls_available {
                        socket.write_u8(b'S').await?;
                        socket.flush().await?;
                        return Ok(InitialPacket::SslAccepted);
                    }
                    socket.write_u8(b'N').await?;
                    socket.flush().await?;
                    continue;
                }
                GSSENC_REQUEST_MAGIC_NUMBER => {
                    socket.write_u8(b'N').await?;
                    socket.flush().await?;
                    continue;
                }
                _ => {}
            }
        }
        if len == 16 && code == CANCEL_REQUEST_MAGIC_NUMBER {
            return Ok(InitialPacket::Cancel);
        }

        let mut packet = BytesMut::with_capacity(len as usize);
        packet.put_i32(len);
        packet.put_slice(&body);
        return Ok(InitialPacket::Startup(packet));
    }
}

/// Drive one accepted connection to completion.
pub async fn process_socket(
    tcp_socket: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
    proxy: Arc<Proxy>,
) -> Result<(), IOError> {
    let addr = tcp_socket.peer_addr()?;
    tcp_socket.set_nodelay(true)?;
    let mut tcp_socket = tcp_socket;

    let initial = match read_initial_packet(&mut tcp_socket, tls_acceptor.is_some()).await {
        Ok(initial) => initial,
        Err(e) => {
            debug!(peer = %addr, error = %e, "connection dropped before startup");
            return Ok(());
        }
    };

    match initial {
        InitialPacket::Cancel => {
            // cancellation is not honored; the side-channel session just ends
            debug!(peer = %addr, "cancel request received, closing");
            Ok(())
        }
        InitialPacket::SslAccepted => {
            // 'S' is only ever sent when an acceptor is configured
            let acceptor = tls_acceptor.unwrap();
            let mut tls_socket = acceptor.accept(tcp_socket).await?;
            debug!(peer = %addr, "session upgraded to tls");

            match read_initial_packet(&mut tls_socket, false).await {
                Ok(InitialPacket::Startup(packet)) => {
                    run_session(tls_socket, packet, true, addr, proxy).await
                }
                Ok(InitialPacket::Cancel) => Ok(()),
                Ok(InitialPacket::SslAccepted) => unreachable!(),
                Err(e) => {
                    debug!(peer = %addr, error = %e, "connection dropped after tls upgrade");
                    Ok(())
                }
            }
        }
        InitialPacket::Startup(packet) => {
            run_session(tcp_socket, packet, false, addr, proxy).await
        }
    }
}

async fn run_session<S>(
    stream: S,
    startup_packet: BytesMut,
    secure: bool,
    addr: SocketAddr,
    proxy: Arc<Proxy>,
) -> Result<(), IOError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let session = ProxySession::new(addr, secure);
    let mut parts = FramedParts::new::<BackendMessage>(stream, MessageCodec::new(session));
    parts.read_buf = startup_packet;
    let mut socket = Framed::from_parts(parts);

    let startup_handler = proxy.startup_handler();
    let processor = proxy.processor();

    loop {
        match socket.next().await {
            Some(Ok(message)) => {
                if matches!(message, FrontendMessage::Terminate(_)) {
                    debug!(peer = %addr, "client terminated session");
                    break;
                }

                let wait_for_sync = message.is_extended_query();
                if let Err(e) =
                    process_message(message, &mut socket, &startup_handler, processor.as_ref())
                        .await
                {
                    match process_error(&mut socket, e, wait_for_sync).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(io) => {
                            debug!(peer = %addr, error = %io, "session write failed");
                            break;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                // undecodable input is a protocol violation and fatal
                warn!(peer = %addr, error = %e, "protocol violation");
                let _ = process_error(&mut socket, e, false).await;
                break;
            }
            None => break,
        }
    }

    Ok(())
}

async fn process_message<S>(
    message: FrontendMessage,
    socket: &mut Framed<S, MessageCodec>,
    startup_handler: &impl StartupHandler,
    processor: &(impl SimpleQueryHandler + ExtendedQueryHandler),
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    match socket.state() {
        SessionState::AwaitingStartup | SessionState::AuthenticationInProgress => {
            startup_handler.on_startup(socket, message).await
        }
        // When an extended-query message fails, everything until Sync is
        // read and discarded; Sync then emits the group's single
        // ReadyForQuery.
        SessionState::AwaitingSync => {
            if let FrontendMessage::Sync(sync) = message {
                processor.on_sync(socket, sync).await?;
                socket.set_state(SessionState::ReadyForQuery);
            }
            Ok(())
        }
        _ => match message {
            FrontendMessage::Query(query) => processor.on_query(socket, query).await,
            FrontendMessage::Parse(parse) => processor.on_parse(socket, parse).await,
            FrontendMessage::Bind(bind) => processor.on_bind(socket, bind).await,
            FrontendMessage::Describe(describe) => processor.on_describe(socket, describe).await,
            FrontendMessage::Execute(execute) => processor.on_execute(socket, execute).await,
            FrontendMessage::Close(close) => processor.on_close(socket, close).await,
            FrontendMessage::Sync(sync) => processor.on_sync(socket, sync).await,
            FrontendMessage::Flush(flush) => processor.on_flush(socket, flush).await,
            _ => Err(ProxyError::OutOfOrderMessage("startup message")),
        },
    }
}

/// Report an error on the session. Returns `true` when the error was fatal
/// and the socket has been closed.
async fn process_error<S>(
    socket: &mut Framed<S, MessageCodec>,
    error: ProxyError,
    wait_for_sync: bool,
) -> Result<bool, IOError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let error_info: ErrorInfo = error.into();
    let is_fatal = error_info.is_fatal();

    socket
        .send(BackendMessage::ErrorResponse(error_info.into()))
        .await
        .map_err(IOError::from)?;

    if is_fatal {
        socket.close().await.map_err(IOError::from)?;
        return Ok(true);
    }

    if wait_for_sync {
        socket.set_state(SessionState::AwaitingSync);
    } else {
        socket.set_state(SessionState::ReadyForQuery);
        send_ready_for_query(socket).await.map_err(IOError::from)?;
    }

    Ok(false)
}

/// Build the client-facing TLS acceptor and the certificate signature used
/// for `tls-server-end-point` channel binding.
pub fn build_tls_acceptor(cfg: &ClientTlsConfig) -> Result<(TlsAcceptor, Vec<u8>), ConfigError> {
    let mut cert_reader =
        BufReader::new(File::open(&cfg.cert).map_err(|e| ConfigError::FileRead {
            path: cfg.cert.clone(),
            source: e,
        })?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::FileRead {
            path: cfg.cert.clone(),
            source: e,
        })?;
    if certs.is_empty() {
        return Err(ConfigError::InvalidValue {
            name: "tls certificate file",
            value: cfg.cert.display().to_string(),
        });
    }
    let cert_signature = h(certs[0].as_ref());

    let mut key_reader = BufReader::new(File::open(&cfg.key).map_err(|e| ConfigError::FileRead {
        path: cfg.key.clone(),
        source: e,
    })?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ConfigError::FileRead {
            path: cfg.key.clone(),
            source: e,
        })?
        .ok_or_else(|| ConfigError::InvalidValue {
            name: "tls key file",
            value: cfg.key.display().to_string(),
        })?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::InvalidValue {
            name: "tls certificate",
            value: e.to_string(),
        })?;

    info!(cert = %cfg.cert.display(), "client tls enabled");
    Ok((TlsAcceptor::from(Arc::new(server_config)), cert_signature))
}
