//! Proxy query handlers: classification, reader relay and write fan-out,
//! wired into the simple and extended protocol traits.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::sink::{Sink, SinkExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::fanout::{FanoutCoordinator, WritePayload};
use super::router::{classify, QueryKind};
use crate::api::portal::Portal;
use crate::api::query::{send_ready_for_query, ExtendedQueryHandler, SimpleQueryHandler};
use crate::api::stmt::PreparedStatement;
use crate::api::{ClientInfo, SessionState};
use crate::client::{BackendClient, BackendEndpoint, BackendTransport};
use crate::config::ProxyConfig;
use crate::error::{ErrorInfo, ProxyError, ProxyResult};
use crate::messages::extendedquery::{
    Bind, BindComplete, Close, CloseComplete, Describe, Execute, Parse, ParseComplete,
    TARGET_TYPE_BYTE_PORTAL, TARGET_TYPE_BYTE_STATEMENT,
};
use crate::messages::data::{NoData, ParameterDescription};
use crate::messages::response::{CommandComplete, EmptyQueryResponse};
use crate::messages::simplequery::Query;
use crate::messages::{BackendMessage, FrontendMessage};

/// Statement router and executor shared by every session.
#[derive(Debug)]
pub struct ProxyProcessor {
    reader: BackendEndpoint,
    transport: BackendTransport,
    fanout: FanoutCoordinator,
    query_timeout: std::time::Duration,
}

impl ProxyProcessor {
    pub fn new(config: &ProxyConfig, transport: BackendTransport) -> ProxyProcessor {
        ProxyProcessor {
            reader: config.reader.clone(),
            fanout: FanoutCoordinator::new(
                config.writers.clone(),
                transport.clone(),
                config.query_timeout,
            ),
            transport,
            query_timeout: config.query_timeout,
        }
    }

    /// Relay a simple-protocol read through a one-shot reader session. Row
    /// descriptions and row bytes pass through verbatim.
    async fn relay_simple_read<C>(&self, client: &mut C, sql: &str) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        let mut backend = BackendClient::connect(&self.reader, &self.transport).await?;
        backend
            .send_message(FrontendMessage::Query(Query::new(sql.to_owned())))
            .await?;

        let mut error: Option<ProxyError> = None;
        loop {
            match backend.next_message().await? {
                message @ (BackendMessage::RowDescription(_)
                | BackendMessage::DataRow(_)
                | BackendMessage::CommandComplete(_)
                | BackendMessage::EmptyQueryResponse(_)
                | BackendMessage::NoticeResponse(_)) => {
                    if error.is_none() {
                        client.feed(message).await?;
                    }
                }
                BackendMessage::ErrorResponse(ref e) => {
                    error.get_or_insert(ProxyError::Backend(Box::new(ErrorInfo::from(e))));
                }
                BackendMessage::ReadyForQuery(_) => break,
                _ => {}
            }
        }
        backend.close().await;

        match error {
            Some(e) => Err(e),
            None => {
                client.flush().await?;
                Ok(())
            }
        }
    }

    /// Drive an executed read portal against a one-shot reader session
    /// through the extended protocol, forwarding the client's formats and
    /// row cap. The row shape arrives from the backend at execute time.
    async fn relay_portal_read<C>(
        &self,
        client: &mut C,
        portal: &Portal,
        max_rows: i32,
    ) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        let statement = &portal.statement;

        let mut backend = BackendClient::connect(&self.reader, &self.transport).await?;
        backend
            .feed_message(FrontendMessage::Parse(Parse::new(
                None,
                statement.query.clone(),
                statement.parameter_oids.clone(),
            )))
            .await?;
        backend
            .feed_message(FrontendMessage::Bind(Bind::new(
                None,
                None,
                portal.parameter_format_codes.clone(),
                portal.parameters.clone(),
                portal.result_column_format_codes.clone(),
            )))
            .await?;
        backend
            .feed_message(FrontendMessage::Describe(Describe::new(
                TARGET_TYPE_BYTE_PORTAL,
                None,
            )))
            .await?;
        backend
            .feed_message(FrontendMessage::Execute(Execute::new(None, max_rows)))
            .await?;
        backend
            .send_message(FrontendMessage::Sync(
                crate::messages::extendedquery::Sync::new(),
            ))
            .await?;

        let mut error: Option<ProxyError> = None;
        loop {
            match backend.next_message().await? {
                message @ (BackendMessage::RowDescription(_)
                | BackendMessage::DataRow(_)
                | BackendMessage::PortalSuspended(_)
                | BackendMessage::CommandComplete(_)
                | BackendMessage::EmptyQueryResponse(_)
                | BackendMessage::NoticeResponse(_)) => {
                    if error.is_none() {
                        client.feed(message).await?;
                    }
                }
                BackendMessage::ErrorResponse(ref e) => {
                    error.get_or_insert(ProxyError::Backend(Box::new(ErrorInfo::from(e))));
                }
                BackendMessage::ReadyForQuery(_) => break,
                // ParseComplete, BindComplete and NoData belong to the
                // backend conversation; the client already has its replies
                _ => {}
            }
        }
        backend.close().await;

        match error {
            Some(e) => Err(e),
            None => {
                client.flush().await?;
                Ok(())
            }
        }
    }

    async fn send_execution_tag<C>(&self, client: &mut C, tag: String) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        if tag.is_empty() {
            client
                .send(BackendMessage::EmptyQueryResponse(EmptyQueryResponse::new()))
                .await?;
        } else {
            client
                .send(BackendMessage::CommandComplete(CommandComplete::new(tag)))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SimpleQueryHandler for ProxyProcessor {
    async fn on_query<C>(&self, client: &mut C, query: Query) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        client.set_state(SessionState::QueryInProgress);
        let kind = classify(&query.query);
        debug!(kind = ?kind, "simple query");

        match kind {
            QueryKind::Read => {
                let deadline = Instant::now() + self.query_timeout;
                match timeout_at(deadline, self.relay_simple_read(client, &query.query)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(ProxyError::DeadlineExceeded),
                }
            }
            QueryKind::Write => {
                let tag = self.fanout.execute(WritePayload::Simple(&query.query)).await?;
                self.send_execution_tag(client, tag).await?;
            }
        }

        send_ready_for_query(client).await?;
        client.set_state(SessionState::ReadyForQuery);
        Ok(())
    }
}

#[async_trait]
impl ExtendedQueryHandler for ProxyProcessor {
    async fn on_parse<C>(&self, client: &mut C, message: Parse) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        let name = message.name.clone().unwrap_or_default();
        {
            let store = client.portal_store();
            // only the unnamed slot may be overwritten without a Close
            if !name.is_empty() && store.has_statement(&name) {
                return Err(ProxyError::DuplicateStatement(name));
            }

            let kind = classify(&message.query);
            store.put_statement(PreparedStatement::new(
                name,
                message.query,
                message.type_oids,
                kind,
            ));
        }

        client
            .send(BackendMessage::ParseComplete(ParseComplete::new()))
            .await?;
        Ok(())
    }

    async fn on_bind<C>(&self, client: &mut C, message: Bind) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        {
            let store = client.portal_store();
            let portal = Portal::try_new(&message, store)?;
            if !portal.name.is_empty() && store.has_portal(&portal.name) {
                return Err(ProxyError::DuplicatePortal(portal.name));
            }
            store.put_portal(portal);
        }

        client
            .send(BackendMessage::BindComplete(BindComplete::new()))
            .await?;
        Ok(())
    }

    async fn on_describe<C>(&self, client: &mut C, message: Describe) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        let name = message.name.clone().unwrap_or_default();
        match message.target_type {
            TARGET_TYPE_BYTE_STATEMENT => {
                let statement = client
                    .portal_store()
                    .get_statement(&name)
                    .ok_or(ProxyError::StatementNotFound(name))?;
                // the row shape is not discovered here; it is emitted by the
                // relay at execute time
                client
                    .feed(BackendMessage::ParameterDescription(
                        ParameterDescription::new(statement.parameter_oids.clone()),
                    ))
                    .await?;
                client.send(BackendMessage::NoData(NoData::new())).await?;
            }
            TARGET_TYPE_BYTE_PORTAL => {
                if !client.portal_store().has_portal(&name) {
                    return Err(ProxyError::PortalNotFound(name));
                }
                client.send(BackendMessage::NoData(NoData::new())).await?;
            }
            other => return Err(ProxyError::InvalidMessageType(other)),
        }
        Ok(())
    }

    async fn on_execute<C>(&self, client: &mut C, message: Execute) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        let name = message.name.clone().unwrap_or_default();
        let portal = client
            .portal_store()
            .get_portal(&name)
            .ok_or(ProxyError::PortalNotFound(name))?;

        debug!(kind = ?portal.statement.kind, max_rows = message.max_rows, "execute portal");
        match portal.statement.kind {
            QueryKind::Read => {
                let deadline = Instant::now() + self.query_timeout;
                match timeout_at(
                    deadline,
                    self.relay_portal_read(client, &portal, message.max_rows),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) => return Err(ProxyError::DeadlineExceeded),
                }
            }
            QueryKind::Write => {
                let tag = self
                    .fanout
                    .execute(WritePayload::Extended {
                        sql: &portal.statement.query,
                        parameter_oids: &portal.statement.parameter_oids,
                        parameter_format_codes: &portal.parameter_format_codes,
                        parameters: &portal.parameters,
                    })
                    .await?;
                self.send_execution_tag(client, tag).await?;
            }
        }
        Ok(())
    }

    async fn on_close<C>(&self, client: &mut C, message: Close) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        let name = message.name.clone().unwrap_or_default();
        match message.target_type {
            // closing a slot that does not exist is not an error
            TARGET_TYPE_BYTE_STATEMENT => client.portal_store().rm_statement(&name),
            TARGET_TYPE_BYTE_PORTAL => client.portal_store().rm_portal(&name),
            other => return Err(ProxyError::InvalidMessageType(other)),
        }

        client
            .send(BackendMessage::CloseComplete(CloseComplete::new()))
            .await?;
        Ok(())
    }
}
