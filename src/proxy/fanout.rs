//! Coordinated write execution across every configured writer.
//!
//! The envelope is begin/execute/commit per writer, in configured order.
//! Writers that cannot be reached are skipped with a warning; any failure
//! between begin and commit rolls every open transaction back. The commit
//! phase is not a true two-phase commit: a commit that lands on some writers
//! and fails on a later one leaves a durable divergence, which is reported
//! to the client rather than hidden.

use std::time::Duration;

use bytes::Bytes;
use postgres_types::Oid;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::client::{BackendClient, BackendEndpoint, BackendTransport};
use crate::error::{ErrorInfo, ProxyError, ProxyResult};

/// A write statement on its way to the writer set.
#[derive(Debug, Clone, Copy)]
pub enum WritePayload<'a> {
    /// statement text from the simple protocol; may contain several
    /// semicolon-separated commands
    Simple(&'a str),
    /// one parameterized statement from an executed portal
    Extended {
        sql: &'a str,
        parameter_oids: &'a [Oid],
        parameter_format_codes: &'a [i16],
        parameters: &'a [Option<Bytes>],
    },
}

#[derive(Debug)]
pub struct FanoutCoordinator {
    writers: Vec<BackendEndpoint>,
    transport: BackendTransport,
    query_timeout: Duration,
}

impl FanoutCoordinator {
    pub fn new(
        writers: Vec<BackendEndpoint>,
        transport: BackendTransport,
        query_timeout: Duration,
    ) -> FanoutCoordinator {
        FanoutCoordinator {
            writers,
            transport,
            query_timeout,
        }
    }

    /// Apply the payload to every reachable writer under the coordinated
    /// envelope. Returns the command tag of the first writer, which is
    /// authoritative when writers disagree.
    pub async fn execute(&self, payload: WritePayload<'_>) -> ProxyResult<String> {
        let deadline = Instant::now() + self.query_timeout;

        // phase 1: connect; unreachable writers are skipped
        let mut sessions = Vec::with_capacity(self.writers.len());
        for endpoint in &self.writers {
            match timeout_at(deadline, BackendClient::connect(endpoint, &self.transport)).await {
                Ok(Ok(session)) => sessions.push(session),
                Ok(Err(e)) => {
                    warn!(writer = %endpoint, error = %e, "skipping unreachable writer");
                }
                Err(_) => {
                    warn!(writer = %endpoint, "skipping writer, connect deadline exceeded");
                }
            }
        }
        if sessions.is_empty() {
            return Err(ProxyError::NoWritersAvailable);
        }

        // phase 2: begin; a writer that cannot open a transaction is dropped
        let mut in_txn: Vec<BackendClient> = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            match timeout_at(deadline, session.begin()).await {
                Ok(Ok(_)) => in_txn.push(session),
                Ok(Err(e)) => {
                    warn!(writer = %session.endpoint(), error = %e, "dropping writer, begin failed");
                    session.close().await;
                }
                Err(_) => {
                    warn!(writer = %session.endpoint(), "dropping writer, begin deadline exceeded");
                    session.close().await;
                }
            }
        }
        if in_txn.is_empty() {
            return Err(ProxyError::NoWritersAvailable);
        }

        // phase 3: execute on every writer; first failure aborts the lot
        let mut first_tag: Option<String> = None;
        for i in 0..in_txn.len() {
            let outcome = match payload {
                WritePayload::Simple(sql) => {
                    timeout_at(deadline, in_txn[i].execute_simple(sql)).await
                }
                WritePayload::Extended {
                    sql,
                    parameter_oids,
                    parameter_format_codes,
                    parameters,
                } => {
                    timeout_at(
                        deadline,
                        in_txn[i].execute_extended(
                            sql,
                            parameter_oids,
                            parameter_format_codes,
                            parameters,
                        ),
                    )
                    .await
                }
            };
            match outcome {
                Ok(Ok(tag)) => {
                    first_tag.get_or_insert(tag);
                }
                Ok(Err(e)) => {
                    warn!(writer = %in_txn[i].endpoint(), error = %e, "execute failed, rolling back all writers");
                    close_all(in_txn).await;
                    return Err(e);
                }
                Err(_) => {
                    warn!(writer = %in_txn[i].endpoint(), "execute deadline exceeded, rolling back all writers");
                    close_all(in_txn).await;
                    return Err(ProxyError::DeadlineExceeded);
                }
            }
        }

        // phase 4: commit in order. After the first successful commit the
        // all-or-nothing window is gone; a later failure is a divergence.
        let mut committed = 0usize;
        for i in 0..in_txn.len() {
            match timeout_at(deadline, in_txn[i].commit()).await {
                Ok(Ok(_)) => committed += 1,
                outcome => {
                    let writer = in_txn[i].endpoint().to_owned();
                    let source: ErrorInfo = match outcome {
                        Ok(Err(e)) => e.into(),
                        _ => ProxyError::DeadlineExceeded.into(),
                    };
                    // roll the not-yet-committed remainder back, best effort
                    close_all(in_txn).await;
                    if committed == 0 {
                        warn!(writer = %writer, "commit failed before any writer committed");
                        return Err(ProxyError::Backend(Box::new(source)));
                    }
                    warn!(
                        writer = %writer,
                        committed,
                        "commit diverged across writers, reconciliation required"
                    );
                    return Err(ProxyError::CommitDivergence {
                        writer,
                        committed,
                        source: Box::new(source),
                    });
                }
            }
        }

        debug!(writers = in_txn.len(), "fan-out committed");
        close_all(in_txn).await;
        Ok(first_tag.unwrap_or_default())
    }
}

/// Close every session; `BackendClient::close` rolls back any transaction
/// that is still open.
async fn close_all(sessions: Vec<BackendClient>) {
    for session in sessions {
        session.close().await;
    }
}
