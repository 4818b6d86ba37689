use std::sync::Arc;

use bytes::Bytes;

use super::stmt::PreparedStatement;
use super::store::SessionStore;
use crate::error::{ProxyError, ProxyResult};
use crate::messages::extendedquery::Bind;

/// A prepared statement with parameter values bound by a `Bind` request.
/// Parameter bytes and format codes are kept raw; they travel to the backend
/// untouched.
#[non_exhaustive]
#[derive(Debug)]
pub struct Portal {
    pub name: String,
    pub statement: Arc<PreparedStatement>,
    pub parameter_format_codes: Vec<i16>,
    pub parameters: Vec<Option<Bytes>>,
    pub result_column_format_codes: Vec<i16>,
}

impl Portal {
    /// Build a portal from a bind request, resolving the referenced
    /// statement in the session store.
    pub fn try_new(bind: &Bind, store: &SessionStore) -> ProxyResult<Portal> {
        let portal_name = bind.portal_name.clone().unwrap_or_default();
        let statement_name = bind.statement_name.clone().unwrap_or_default();
        let statement = store
            .get_statement(&statement_name)
            .ok_or(ProxyError::StatementNotFound(statement_name))?;

        Ok(Portal {
            name: portal_name,
            statement,
            parameter_format_codes: bind.parameter_format_codes.clone(),
            parameters: bind.parameters.clone(),
            result_column_format_codes: bind.result_column_format_codes.clone(),
        })
    }
}
