use std::fmt::Debug;

use async_trait::async_trait;
use futures::sink::{Sink, SinkExt};

use super::ClientInfo;
use crate::error::{ProxyError, ProxyResult};
use crate::messages::extendedquery::{self, Bind, Close, Describe, Execute, Flush, Parse};
use crate::messages::response::{ReadyForQuery, READY_STATUS_IDLE};
use crate::messages::simplequery::Query;
use crate::messages::BackendMessage;

pub async fn send_ready_for_query<C>(client: &mut C) -> ProxyResult<()>
where
    C: Sink<BackendMessage> + Unpin,
    C::Error: Debug,
    ProxyError: From<<C as Sink<BackendMessage>>::Error>,
{
    client
        .send(BackendMessage::ReadyForQuery(ReadyForQuery::new(
            READY_STATUS_IDLE,
        )))
        .await?;
    Ok(())
}

/// Handler for the simple query subprotocol.
#[async_trait]
pub trait SimpleQueryHandler: Send + Sync {
    async fn on_query<C>(&self, client: &mut C, query: Query) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>;
}

/// Handler for the extended query subprotocol. One method per message; the
/// session loop dispatches into these and funnels errors through the
/// discard-until-Sync discipline.
#[async_trait]
pub trait ExtendedQueryHandler: Send + Sync {
    async fn on_parse<C>(&self, client: &mut C, message: Parse) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>;

    async fn on_bind<C>(&self, client: &mut C, message: Bind) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>;

    async fn on_describe<C>(&self, client: &mut C, message: Describe) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>;

    async fn on_execute<C>(&self, client: &mut C, message: Execute) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>;

    async fn on_close<C>(&self, client: &mut C, message: Close) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>;

    /// Emit exactly one ReadyForQuery per Sync.
    async fn on_sync<C>(&self, client: &mut C, _message: extendedquery::Sync) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        send_ready_for_query(client).await
    }

    /// Responses are not buffered, so Flush only drains the sink.
    async fn on_flush<C>(&self, client: &mut C, _message: Flush) -> ProxyResult<()>
    where
        C: ClientInfo + Sink<BackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        ProxyError: From<<C as Sink<BackendMessage>>::Error>,
    {
        client.flush().await?;
        Ok(())
    }
}
