//! End-to-end tests: a real proxy instance on an ephemeral port, driven by a
//! raw wire client, with scripted in-process PostgreSQL backends behind it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use pgmux::client::auth::ScramClient;
use pgmux::client::{BackendCodec, BackendEndpoint};
use pgmux::config::{BackendTlsConfig, ProxyConfig};
use pgmux::credentials::{CredentialProvider, CredentialStore};
use pgmux::messages::data::{DataRow, FieldDescription, RowDescription};
use pgmux::messages::extendedquery::{
    Bind, Close, Describe, Execute, Parse, Sync, TARGET_TYPE_BYTE_PORTAL,
    TARGET_TYPE_BYTE_STATEMENT,
};
use pgmux::messages::response::{
    CommandComplete, ErrorResponse, ReadyForQuery, READY_STATUS_FAILED_TRANSACTION,
    READY_STATUS_IDLE, READY_STATUS_TRANSACTION,
};
use pgmux::messages::simplequery::Query;
use pgmux::messages::startup::{
    Authentication, PasswordMessageFamily, SASLInitialResponse, SASLResponse, Startup,
};
use pgmux::messages::{BackendMessage, FrontendMessage};
use pgmux::proxy::Proxy;
use pgmux::server::{process_socket, MessageCodec};
use pgmux::api::{ClientInfo, ProxySession, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Healthy,
    FailOnExecute,
    FailOnCommit,
}

type StatementLog = Arc<Mutex<Vec<String>>>;

/// A scripted backend speaking just enough of the server side of the wire
/// protocol for the proxy's reader and writer sessions.
async fn spawn_backend(behavior: Behavior) -> (SocketAddr, StatementLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: StatementLog = Arc::new(Mutex::new(Vec::new()));

    let accept_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, peer)) = listener.accept().await else {
                return;
            };
            let log = accept_log.clone();
            tokio::spawn(async move {
                let _ = serve_backend(socket, peer, behavior, log).await;
            });
        }
    });

    (addr, log)
}

async fn serve_backend(
    socket: TcpStream,
    peer: SocketAddr,
    behavior: Behavior,
    log: StatementLog,
) -> Result<(), pgmux::error::ProxyError> {
    let session = ProxySession::new(peer, false);
    let mut framed = Framed::new(socket, MessageCodec::new(session));

    // startup: trust the proxy straight away
    let Some(Ok(FrontendMessage::Startup(_))) = framed.next().await else {
        return Ok(());
    };
    framed.set_state(SessionState::ReadyForQuery);
    framed
        .feed(BackendMessage::Authentication(Authentication::Ok))
        .await?;
    framed
        .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(
            READY_STATUS_IDLE,
        )))
        .await?;

    let mut in_txn = false;
    let mut portal_sql = String::new();

    while let Some(message) = framed.next().await {
        match message? {
            FrontendMessage::Query(query) => {
                let sql = query.query.clone();
                log.lock().unwrap().push(sql.clone());

                if sql == "BEGIN" {
                    in_txn = true;
                    framed
                        .feed(BackendMessage::CommandComplete(CommandComplete::new(
                            "BEGIN".to_owned(),
                        )))
                        .await?;
                    framed
                        .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(
                            READY_STATUS_TRANSACTION,
                        )))
                        .await?;
                } else if sql == "COMMIT" {
                    in_txn = false;
                    if behavior == Behavior::FailOnCommit {
                        framed
                            .feed(BackendMessage::ErrorResponse(error_response(
                                "53100",
                                "could not write commit record",
                            )))
                            .await?;
                    } else {
                        framed
                            .feed(BackendMessage::CommandComplete(CommandComplete::new(
                                "COMMIT".to_owned(),
                            )))
                            .await?;
                    }
                    framed
                        .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(
                            READY_STATUS_IDLE,
                        )))
                        .await?;
                } else if sql == "ROLLBACK" {
                    in_txn = false;
                    framed
                        .feed(BackendMessage::CommandComplete(CommandComplete::new(
                            "ROLLBACK".to_owned(),
                        )))
                        .await?;
                    framed
                        .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(
                            READY_STATUS_IDLE,
                        )))
                        .await?;
                } else if sql.trim_start().to_uppercase().starts_with("SELECT")
                    || sql.trim_start().to_uppercase().starts_with("SHOW")
                {
                    send_select_result(&mut framed, in_txn).await?;
                } else {
                    // a write statement
                    if behavior == Behavior::FailOnExecute {
                        framed
                            .feed(BackendMessage::ErrorResponse(error_response(
                                "23514",
                                "value violates check constraint",
                            )))
                            .await?;
                        framed
                            .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(
                                READY_STATUS_FAILED_TRANSACTION,
                            )))
                            .await?;
                    } else {
                        framed
                            .feed(BackendMessage::CommandComplete(CommandComplete::new(
                                "INSERT 0 1".to_owned(),
                            )))
                            .await?;
                        let status = if in_txn {
                            READY_STATUS_TRANSACTION
                        } else {
                            READY_STATUS_IDLE
                        };
                        framed
                            .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(status)))
                            .await?;
                    }
                }
            }
            FrontendMessage::Parse(parse) => {
                portal_sql = parse.query.clone();
                log.lock().unwrap().push(format!("parse:{}", parse.query));
                framed
                    .feed(BackendMessage::ParseComplete(
                        pgmux::messages::extendedquery::ParseComplete::new(),
                    ))
                    .await?;
            }
            FrontendMessage::Bind(_) => {
                framed
                    .feed(BackendMessage::BindComplete(
                        pgmux::messages::extendedquery::BindComplete::new(),
                    ))
                    .await?;
            }
            FrontendMessage::Describe(_) => {
                framed
                    .feed(BackendMessage::RowDescription(select_row_description()))
                    .await?;
            }
            FrontendMessage::Execute(execute) => {
                log.lock().unwrap().push(format!("execute:{portal_sql}"));
                if behavior == Behavior::FailOnExecute && !portal_sql.trim_start().to_uppercase().starts_with("SELECT") {
                    framed
                        .feed(BackendMessage::ErrorResponse(error_response(
                            "23514",
                            "value violates check constraint",
                        )))
                        .await?;
                } else {
                    let rows = vec!["1", "2", "3"];
                    let cap = if execute.max_rows > 0 {
                        execute.max_rows as usize
                    } else {
                        rows.len()
                    };
                    for value in rows.iter().take(cap) {
                        framed
                            .feed(BackendMessage::DataRow(DataRow::new(vec![Some(
                                Bytes::copy_from_slice(value.as_bytes()),
                            )])))
                            .await?;
                    }
                    if cap < rows.len() {
                        framed
                            .feed(BackendMessage::PortalSuspended(
                                pgmux::messages::extendedquery::PortalSuspended::new(),
                            ))
                            .await?;
                    } else {
                        framed
                            .feed(BackendMessage::CommandComplete(CommandComplete::new(
                                format!("SELECT {cap}"),
                            )))
                            .await?;
                    }
                }
                framed.flush().await?;
            }
            FrontendMessage::Sync(_) => {
                let status = if in_txn {
                    READY_STATUS_TRANSACTION
                } else {
                    READY_STATUS_IDLE
                };
                framed
                    .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(status)))
                    .await?;
            }
            FrontendMessage::Terminate(_) => break,
            _ => {}
        }
    }

    Ok(())
}

fn error_response(code: &str, message: &str) -> ErrorResponse {
    ErrorResponse::new(vec![
        (b'S', "ERROR".to_owned()),
        (b'C', code.to_owned()),
        (b'M', message.to_owned()),
    ])
}

fn select_row_description() -> RowDescription {
    RowDescription::new(vec![FieldDescription::new(
        "?column?".to_owned(),
        0,
        0,
        23,
        4,
        -1,
        0,
    )])
}

async fn send_select_result(
    framed: &mut Framed<TcpStream, MessageCodec>,
    in_txn: bool,
) -> Result<(), pgmux::error::ProxyError> {
    framed
        .feed(BackendMessage::RowDescription(select_row_description()))
        .await?;
    framed
        .feed(BackendMessage::DataRow(DataRow::new(vec![Some(
            Bytes::from_static(b"1"),
        )])))
        .await?;
    framed
        .feed(BackendMessage::CommandComplete(CommandComplete::new(
            "SELECT 1".to_owned(),
        )))
        .await?;
    let status = if in_txn {
        READY_STATUS_TRANSACTION
    } else {
        READY_STATUS_IDLE
    };
    framed
        .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(status)))
        .await?;
    Ok(())
}

fn endpoint(addr: SocketAddr) -> BackendEndpoint {
    BackendEndpoint {
        host: "127.0.0.1".to_owned(),
        port: addr.port(),
        user: "pgmux".to_owned(),
        password: None,
        dbname: None,
    }
}

/// Boot a proxy over the given backends and return its address.
async fn spawn_proxy(
    reader: BackendEndpoint,
    writers: Vec<BackendEndpoint>,
    users: &[(&str, &str)],
) -> SocketAddr {
    let users_env = users
        .iter()
        .map(|(u, p)| format!("{u}:{p}"))
        .collect::<Vec<_>>()
        .join(",");

    let config = ProxyConfig {
        listen: "127.0.0.1:0".to_owned(),
        reader,
        writers,
        client_tls: None,
        backend_tls: BackendTlsConfig::default(),
        credential_provider: Arc::new(CredentialProvider::Env { users: users_env }),
        credential_reload_interval: None,
        query_timeout: std::time::Duration::from_secs(5),
    };

    let credentials = Arc::new(CredentialStore::from_passwords(
        &config.credential_provider.fetch().await.unwrap(),
    ));
    let proxy = Arc::new(Proxy::new(&config, credentials, None).unwrap());

    let listener = TcpListener::bind(&config.listen).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let proxy = proxy.clone();
            tokio::spawn(async move {
                let _ = process_socket(socket, None, proxy).await;
            });
        }
    });

    addr
}

type WireClient = Framed<TcpStream, BackendCodec>;

async fn connect_client(addr: SocketAddr, user: &str) -> WireClient {
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(socket, BackendCodec::default());

    let mut startup = Startup::new();
    startup
        .parameters
        .insert("user".to_owned(), user.to_owned());
    framed
        .send(FrontendMessage::Startup(startup))
        .await
        .unwrap();
    framed
}

/// Finish a trust-mode startup: expect AuthenticationOk and drain to the
/// first ReadyForQuery.
async fn expect_trust_startup(client: &mut WireClient) {
    let mut authenticated = false;
    while let Some(message) = client.next().await {
        match message.unwrap() {
            BackendMessage::Authentication(Authentication::Ok) => authenticated = true,
            BackendMessage::ParameterStatus(_) | BackendMessage::BackendKeyData(_) => {}
            BackendMessage::ReadyForQuery(ready) => {
                assert!(authenticated, "ReadyForQuery before AuthenticationOk");
                assert_eq!(ready.status, READY_STATUS_IDLE);
                return;
            }
            other => panic!("unexpected startup message: {other:?}"),
        }
    }
    panic!("connection closed during startup");
}

/// Collect messages until (and including) the next ReadyForQuery.
async fn drain_group(client: &mut WireClient) -> Vec<BackendMessage> {
    let mut collected = Vec::new();
    while let Some(message) = client.next().await {
        let message = message.unwrap();
        let done = matches!(message, BackendMessage::ReadyForQuery(_));
        collected.push(message);
        if done {
            return collected;
        }
    }
    panic!("connection closed before ReadyForQuery");
}

fn data_row_text(message: &BackendMessage) -> Vec<Option<String>> {
    match message {
        BackendMessage::DataRow(row) => row
            .fields
            .iter()
            .map(|f| f.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()))
            .collect(),
        other => panic!("expected DataRow, got {other:?}"),
    }
}

#[tokio::test]
async fn trust_mode_simple_read() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (writer_addr, _) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(endpoint(reader_addr), vec![endpoint(writer_addr)], &[]).await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    client
        .send(FrontendMessage::Query(Query::new("SELECT 1".to_owned())))
        .await
        .unwrap();

    let messages = drain_group(&mut client).await;
    assert_eq!(messages.len(), 4, "messages: {messages:?}");

    match &messages[0] {
        BackendMessage::RowDescription(desc) => {
            assert_eq!(desc.fields.len(), 1);
            assert_eq!(desc.fields[0].name, "?column?");
        }
        other => panic!("expected RowDescription, got {other:?}"),
    }
    assert_eq!(data_row_text(&messages[1]), vec![Some("1".to_owned())]);
    match &messages[2] {
        BackendMessage::CommandComplete(cc) => assert_eq!(cc.tag, "SELECT 1"),
        other => panic!("expected CommandComplete, got {other:?}"),
    }
    match &messages[3] {
        BackendMessage::ReadyForQuery(ready) => assert_eq!(ready.status, READY_STATUS_IDLE),
        other => panic!("expected ReadyForQuery, got {other:?}"),
    }
}

async fn scram_login(client: &mut WireClient, user: &str, password: &str) -> Result<(), String> {
    // expect the SASL advertisement
    match client.next().await.unwrap().unwrap() {
        BackendMessage::Authentication(Authentication::SASL(mechanisms)) => {
            assert_eq!(mechanisms, vec!["SCRAM-SHA-256".to_owned()]);
        }
        other => panic!("expected AuthenticationSASL, got {other:?}"),
    }

    let mut scram = ScramClient::new(user, password);
    let first = scram.client_first();
    client
        .send(FrontendMessage::PasswordMessageFamily(
            PasswordMessageFamily::SASLInitialResponse(SASLInitialResponse::new(
                "SCRAM-SHA-256".to_owned(),
                Some(first.into()),
            )),
        ))
        .await
        .unwrap();

    let server_first = match client.next().await.unwrap().unwrap() {
        BackendMessage::Authentication(Authentication::SASLContinue(data)) => data,
        BackendMessage::ErrorResponse(e) => return Err(format!("{e:?}")),
        other => panic!("expected SASLContinue, got {other:?}"),
    };

    let client_final = scram.client_final(&server_first).unwrap();
    client
        .send(FrontendMessage::PasswordMessageFamily(
            PasswordMessageFamily::SASLResponse(SASLResponse::new(client_final.into())),
        ))
        .await
        .unwrap();

    let mut saw_final = false;
    let mut saw_ok = false;
    while let Some(message) = client.next().await {
        match message.map_err(|e| e.to_string())? {
            BackendMessage::Authentication(Authentication::SASLFinal(data)) => {
                scram.verify_server_final(&data).unwrap();
                saw_final = true;
            }
            BackendMessage::Authentication(Authentication::Ok) => saw_ok = true,
            BackendMessage::ParameterStatus(_) | BackendMessage::BackendKeyData(_) => {}
            BackendMessage::ReadyForQuery(_) => {
                assert!(saw_final && saw_ok);
                return Ok(());
            }
            BackendMessage::ErrorResponse(e) => return Err(format!("{e:?}")),
            other => panic!("unexpected message during login: {other:?}"),
        }
    }
    Err("connection closed".to_owned())
}

#[tokio::test]
async fn scram_success_routes_read_to_reader() {
    let (reader_addr, reader_log) = spawn_backend(Behavior::Healthy).await;
    let (writer_addr, writer_log) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(
        endpoint(reader_addr),
        vec![endpoint(writer_addr)],
        &[("alice", "wonderland")],
    )
    .await;

    let mut client = connect_client(proxy, "alice").await;
    scram_login(&mut client, "alice", "wonderland")
        .await
        .unwrap();

    client
        .send(FrontendMessage::Query(Query::new(
            "SHOW server_version".to_owned(),
        )))
        .await
        .unwrap();
    let messages = drain_group(&mut client).await;
    assert!(matches!(messages[0], BackendMessage::RowDescription(_)));

    assert_eq!(
        reader_log.lock().unwrap().as_slice(),
        &["SHOW server_version".to_owned()]
    );
    assert!(writer_log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn scram_failure_closes_session() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (writer_addr, _) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(
        endpoint(reader_addr),
        vec![endpoint(writer_addr)],
        &[("alice", "wonderland")],
    )
    .await;

    let mut client = connect_client(proxy, "alice").await;
    let err = scram_login(&mut client, "alice", "rabbit")
        .await
        .unwrap_err();
    assert!(err.contains("28P01"), "error: {err}");
    assert!(err.contains("FATAL"), "error: {err}");

    // the server closes the socket after the fatal error
    assert!(client.next().await.is_none());
}

#[tokio::test]
async fn unknown_user_fails_like_bad_password() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (writer_addr, _) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(
        endpoint(reader_addr),
        vec![endpoint(writer_addr)],
        &[("alice", "wonderland")],
    )
    .await;

    let mut client = connect_client(proxy, "mallory").await;
    // the handshake proceeds past client-first before failing
    let err = scram_login(&mut client, "mallory", "guess").await.unwrap_err();
    assert!(err.contains("28P01"), "error: {err}");
    assert!(!err.contains("mallory"), "error text leaks the user: {err}");
}

#[tokio::test]
async fn write_fans_out_to_all_writers() {
    let (reader_addr, reader_log) = spawn_backend(Behavior::Healthy).await;
    let (w1_addr, w1_log) = spawn_backend(Behavior::Healthy).await;
    let (w2_addr, w2_log) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(
        endpoint(reader_addr),
        vec![endpoint(w1_addr), endpoint(w2_addr)],
        &[],
    )
    .await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    client
        .send(FrontendMessage::Query(Query::new(
            "INSERT INTO t VALUES (1)".to_owned(),
        )))
        .await
        .unwrap();

    let messages = drain_group(&mut client).await;
    assert_eq!(messages.len(), 2, "messages: {messages:?}");
    match &messages[0] {
        BackendMessage::CommandComplete(cc) => assert_eq!(cc.tag, "INSERT 0 1"),
        other => panic!("expected CommandComplete, got {other:?}"),
    }
    assert!(matches!(messages[1], BackendMessage::ReadyForQuery(_)));

    for log in [&w1_log, &w2_log] {
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[
                "BEGIN".to_owned(),
                "INSERT INTO t VALUES (1)".to_owned(),
                "COMMIT".to_owned(),
            ]
        );
    }
    assert!(reader_log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn execute_failure_rolls_back_every_writer() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (w1_addr, w1_log) = spawn_backend(Behavior::Healthy).await;
    let (w2_addr, w2_log) = spawn_backend(Behavior::FailOnExecute).await;
    let proxy = spawn_proxy(
        endpoint(reader_addr),
        vec![endpoint(w1_addr), endpoint(w2_addr)],
        &[],
    )
    .await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    client
        .send(FrontendMessage::Query(Query::new(
            "INSERT INTO t VALUES (1)".to_owned(),
        )))
        .await
        .unwrap();

    let messages = drain_group(&mut client).await;
    assert_eq!(messages.len(), 2, "messages: {messages:?}");
    match &messages[0] {
        BackendMessage::ErrorResponse(e) => {
            let code = e.fields.iter().find(|(k, _)| *k == b'C').unwrap();
            assert_eq!(code.1, "23514");
        }
        other => panic!("expected ErrorResponse, got {other:?}"),
    }
    assert!(matches!(messages[1], BackendMessage::ReadyForQuery(_)));

    // both writers rolled back and neither committed
    for log in [&w1_log, &w2_log] {
        let log = log.lock().unwrap();
        assert!(log.contains(&"ROLLBACK".to_owned()), "log: {log:?}");
        assert!(!log.contains(&"COMMIT".to_owned()), "log: {log:?}");
    }
}

#[tokio::test]
async fn commit_divergence_names_the_failed_writer() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (w1_addr, w1_log) = spawn_backend(Behavior::Healthy).await;
    let (w2_addr, _) = spawn_backend(Behavior::FailOnCommit).await;
    let proxy = spawn_proxy(
        endpoint(reader_addr),
        vec![endpoint(w1_addr), endpoint(w2_addr)],
        &[],
    )
    .await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    client
        .send(FrontendMessage::Query(Query::new(
            "INSERT INTO t VALUES (1)".to_owned(),
        )))
        .await
        .unwrap();

    let messages = drain_group(&mut client).await;
    match &messages[0] {
        BackendMessage::ErrorResponse(e) => {
            let code = e.fields.iter().find(|(k, _)| *k == b'C').unwrap();
            assert_eq!(code.1, "53100");
            let message = e.fields.iter().find(|(k, _)| *k == b'M').unwrap();
            assert!(message.1.contains("diverge"), "message: {}", message.1);
            assert!(
                message.1.contains(&w2_addr.port().to_string()),
                "message does not name the writer: {}",
                message.1
            );
        }
        other => panic!("expected ErrorResponse, got {other:?}"),
    }
    assert!(matches!(messages[1], BackendMessage::ReadyForQuery(_)));

    // the first writer already committed; the divergence is durable
    assert!(w1_log.lock().unwrap().contains(&"COMMIT".to_owned()));
}

#[tokio::test]
async fn unreachable_writer_is_skipped() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (w1_addr, w1_log) = spawn_backend(Behavior::Healthy).await;
    let unreachable = BackendEndpoint {
        host: "127.0.0.1".to_owned(),
        port: 1,
        user: "pgmux".to_owned(),
        password: None,
        dbname: None,
    };
    let proxy = spawn_proxy(
        endpoint(reader_addr),
        vec![endpoint(w1_addr), unreachable],
        &[],
    )
    .await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    client
        .send(FrontendMessage::Query(Query::new(
            "INSERT INTO t VALUES (1)".to_owned(),
        )))
        .await
        .unwrap();

    let messages = drain_group(&mut client).await;
    match &messages[0] {
        BackendMessage::CommandComplete(cc) => assert_eq!(cc.tag, "INSERT 0 1"),
        other => panic!("expected CommandComplete, got {other:?}"),
    }

    let log = w1_log.lock().unwrap();
    assert_eq!(
        log.as_slice(),
        &[
            "BEGIN".to_owned(),
            "INSERT INTO t VALUES (1)".to_owned(),
            "COMMIT".to_owned(),
        ]
    );
}

#[tokio::test]
async fn extended_query_read_portal() {
    let (reader_addr, reader_log) = spawn_backend(Behavior::Healthy).await;
    let (writer_addr, _) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(endpoint(reader_addr), vec![endpoint(writer_addr)], &[]).await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    client
        .feed(FrontendMessage::Parse(Parse::new(
            Some("q1".to_owned()),
            "SELECT x FROM t WHERE id = $1".to_owned(),
            vec![23],
        )))
        .await
        .unwrap();
    client
        .feed(FrontendMessage::Bind(Bind::new(
            Some("p1".to_owned()),
            Some("q1".to_owned()),
            vec![0],
            vec![Some(Bytes::from_static(b"7"))],
            vec![0],
        )))
        .await
        .unwrap();
    client
        .feed(FrontendMessage::Describe(Describe::new(
            TARGET_TYPE_BYTE_STATEMENT,
            Some("q1".to_owned()),
        )))
        .await
        .unwrap();
    client
        .feed(FrontendMessage::Execute(Execute::new(
            Some("p1".to_owned()),
            0,
        )))
        .await
        .unwrap();
    client.send(FrontendMessage::Sync(Sync::new())).await.unwrap();

    let messages = drain_group(&mut client).await;

    // ParseComplete, BindComplete, ParameterDescription, NoData,
    // RowDescription, 3 rows, CommandComplete, ReadyForQuery
    assert!(matches!(messages[0], BackendMessage::ParseComplete(_)));
    assert!(matches!(messages[1], BackendMessage::BindComplete(_)));
    match &messages[2] {
        BackendMessage::ParameterDescription(desc) => assert_eq!(desc.types, vec![23]),
        other => panic!("expected ParameterDescription, got {other:?}"),
    }
    assert!(matches!(messages[3], BackendMessage::NoData(_)));
    assert!(matches!(messages[4], BackendMessage::RowDescription(_)));
    assert_eq!(data_row_text(&messages[5]), vec![Some("1".to_owned())]);
    assert_eq!(data_row_text(&messages[6]), vec![Some("2".to_owned())]);
    assert_eq!(data_row_text(&messages[7]), vec![Some("3".to_owned())]);
    match &messages[8] {
        BackendMessage::CommandComplete(cc) => assert_eq!(cc.tag, "SELECT 3"),
        other => panic!("expected CommandComplete, got {other:?}"),
    }
    assert!(matches!(messages[9], BackendMessage::ReadyForQuery(_)));
    assert_eq!(messages.len(), 10);

    // exactly one ReadyForQuery in the whole group
    let ready_count = messages
        .iter()
        .filter(|m| matches!(m, BackendMessage::ReadyForQuery(_)))
        .count();
    assert_eq!(ready_count, 1);

    let log = reader_log.lock().unwrap();
    assert_eq!(
        log.as_slice(),
        &[
            "parse:SELECT x FROM t WHERE id = $1".to_owned(),
            "execute:SELECT x FROM t WHERE id = $1".to_owned(),
        ]
    );
}

#[tokio::test]
async fn execute_row_cap_suspends_portal() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (writer_addr, _) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(endpoint(reader_addr), vec![endpoint(writer_addr)], &[]).await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    client
        .feed(FrontendMessage::Parse(Parse::new(
            None,
            "SELECT x FROM t".to_owned(),
            vec![],
        )))
        .await
        .unwrap();
    client
        .feed(FrontendMessage::Bind(Bind::new(
            None,
            None,
            vec![],
            vec![],
            vec![],
        )))
        .await
        .unwrap();
    client
        .feed(FrontendMessage::Execute(Execute::new(None, 2)))
        .await
        .unwrap();
    client.send(FrontendMessage::Sync(Sync::new())).await.unwrap();

    let messages = drain_group(&mut client).await;
    // ParseComplete, BindComplete, RowDescription, 2 rows, PortalSuspended,
    // ReadyForQuery
    assert!(matches!(messages[2], BackendMessage::RowDescription(_)));
    assert_eq!(data_row_text(&messages[3]), vec![Some("1".to_owned())]);
    assert_eq!(data_row_text(&messages[4]), vec![Some("2".to_owned())]);
    assert!(matches!(messages[5], BackendMessage::PortalSuspended(_)));
    assert!(matches!(messages[6], BackendMessage::ReadyForQuery(_)));
}

#[tokio::test]
async fn extended_query_write_portal_fans_out() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (w1_addr, w1_log) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(endpoint(reader_addr), vec![endpoint(w1_addr)], &[]).await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    client
        .feed(FrontendMessage::Parse(Parse::new(
            None,
            "INSERT INTO t VALUES ($1)".to_owned(),
            vec![23],
        )))
        .await
        .unwrap();
    client
        .feed(FrontendMessage::Bind(Bind::new(
            None,
            None,
            vec![0],
            vec![Some(Bytes::from_static(b"9"))],
            vec![],
        )))
        .await
        .unwrap();
    client
        .feed(FrontendMessage::Execute(Execute::new(None, 0)))
        .await
        .unwrap();
    client.send(FrontendMessage::Sync(Sync::new())).await.unwrap();

    let messages = drain_group(&mut client).await;
    assert!(matches!(messages[0], BackendMessage::ParseComplete(_)));
    assert!(matches!(messages[1], BackendMessage::BindComplete(_)));
    match &messages[2] {
        BackendMessage::CommandComplete(cc) => assert_eq!(cc.tag, "INSERT 0 1"),
        other => panic!("expected CommandComplete, got {other:?}"),
    }
    assert!(matches!(messages[3], BackendMessage::ReadyForQuery(_)));

    let log = w1_log.lock().unwrap();
    assert_eq!(log[0], "BEGIN");
    assert_eq!(log[1], "parse:INSERT INTO t VALUES ($1)");
    assert_eq!(log[2], "execute:INSERT INTO t VALUES ($1)");
    assert_eq!(log[3], "COMMIT");
}

#[tokio::test]
async fn error_in_extended_group_discards_until_sync() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (writer_addr, _) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(endpoint(reader_addr), vec![endpoint(writer_addr)], &[]).await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    // Execute against a portal that was never bound, then pipeline a
    // Describe that must be discarded, then Sync
    client
        .feed(FrontendMessage::Execute(Execute::new(
            Some("nope".to_owned()),
            0,
        )))
        .await
        .unwrap();
    client
        .feed(FrontendMessage::Describe(Describe::new(
            TARGET_TYPE_BYTE_PORTAL,
            Some("nope".to_owned()),
        )))
        .await
        .unwrap();
    client.send(FrontendMessage::Sync(Sync::new())).await.unwrap();

    let messages = drain_group(&mut client).await;
    assert_eq!(messages.len(), 2, "messages: {messages:?}");
    match &messages[0] {
        BackendMessage::ErrorResponse(e) => {
            let code = e.fields.iter().find(|(k, _)| *k == b'C').unwrap();
            assert_eq!(code.1, "34000");
        }
        other => panic!("expected ErrorResponse, got {other:?}"),
    }
    assert!(matches!(messages[1], BackendMessage::ReadyForQuery(_)));
}

#[tokio::test]
async fn close_statement_then_reparse() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (writer_addr, _) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(endpoint(reader_addr), vec![endpoint(writer_addr)], &[]).await;

    let mut client = connect_client(proxy, "alice").await;
    expect_trust_startup(&mut client).await;

    client
        .feed(FrontendMessage::Parse(Parse::new(
            Some("q1".to_owned()),
            "SELECT 1".to_owned(),
            vec![],
        )))
        .await
        .unwrap();
    client.send(FrontendMessage::Sync(Sync::new())).await.unwrap();
    let messages = drain_group(&mut client).await;
    assert!(matches!(messages[0], BackendMessage::ParseComplete(_)));

    // re-parsing the same live name is an error
    client
        .feed(FrontendMessage::Parse(Parse::new(
            Some("q1".to_owned()),
            "SELECT 2".to_owned(),
            vec![],
        )))
        .await
        .unwrap();
    client.send(FrontendMessage::Sync(Sync::new())).await.unwrap();
    let messages = drain_group(&mut client).await;
    match &messages[0] {
        BackendMessage::ErrorResponse(e) => {
            let code = e.fields.iter().find(|(k, _)| *k == b'C').unwrap();
            assert_eq!(code.1, "42P05");
        }
        other => panic!("expected ErrorResponse, got {other:?}"),
    }

    // after Close, the name is free again
    client
        .feed(FrontendMessage::Close(Close::new(
            TARGET_TYPE_BYTE_STATEMENT,
            Some("q1".to_owned()),
        )))
        .await
        .unwrap();
    client
        .feed(FrontendMessage::Parse(Parse::new(
            Some("q1".to_owned()),
            "SELECT 2".to_owned(),
            vec![],
        )))
        .await
        .unwrap();
    client.send(FrontendMessage::Sync(Sync::new())).await.unwrap();
    let messages = drain_group(&mut client).await;
    assert!(matches!(messages[0], BackendMessage::CloseComplete(_)));
    assert!(matches!(messages[1], BackendMessage::ParseComplete(_)));
    assert!(matches!(messages[2], BackendMessage::ReadyForQuery(_)));
}

#[tokio::test]
async fn cancel_request_closes_session() {
    let (reader_addr, _) = spawn_backend(Behavior::Healthy).await;
    let (writer_addr, _) = spawn_backend(Behavior::Healthy).await;
    let proxy = spawn_proxy(endpoint(reader_addr), vec![endpoint(writer_addr)], &[]).await;

    use tokio::io::AsyncWriteExt;
    let mut socket = TcpStream::connect(proxy).await.unwrap();
    // length 16, cancel magic, pid, secret
    let mut packet = Vec::new();
    packet.extend_from_slice(&16i32.to_be_bytes());
    packet.extend_from_slice(&80877102i32.to_be_bytes());
    packet.extend_from_slice(&42i32.to_be_bytes());
    packet.extend_from_slice(&7i32.to_be_bytes());
    socket.write_all(&packet).await.unwrap();

    // the proxy closes without a reply
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 1];
    let n = socket.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}
