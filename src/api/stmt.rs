use postgres_types::Oid;

use crate::proxy::router::QueryKind;

/// A statement created by Parse. The proxy never prepares it against a
/// backend; it keeps the SQL text, the declared parameter oids and the
/// read/write classification computed once at Parse time.
#[non_exhaustive]
#[derive(Debug, new)]
pub struct PreparedStatement {
    /// name from the Parse message; empty for the unnamed slot
    pub name: String,
    /// original SQL text
    pub query: String,
    /// declared parameter type oids, possibly empty
    pub parameter_oids: Vec<Oid>,
    /// cached classification
    pub kind: QueryKind,
}
