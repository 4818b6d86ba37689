use std::io::Error as IOError;

use thiserror::Error;

use crate::messages::response::{ErrorResponse, NoticeResponse};

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid protocol version, received {0}")]
    InvalidProtocolVersion(i32),
    #[error("Invalid message received, type {0}")]
    InvalidMessageType(u8),
    #[error("Invalid startup packet")]
    InvalidStartupMessage,
    #[error("Startup parameter \"user\" is required")]
    MissingUserParameter,
    #[error("Message {0} is not allowed in current session state")]
    OutOfOrderMessage(&'static str),

    #[error("Unsupported SASL mechanism: {0}")]
    UnsupportedSaslMechanism(String),
    #[error("Invalid SCRAM message: {0}")]
    InvalidScramMessage(String),
    #[error("Channel binding mismatch")]
    ChannelBindingMismatch,
    #[error("Password authentication failed for user {0:?}")]
    InvalidPassword(String),

    #[error("Prepared statement not found: {0:?}")]
    StatementNotFound(String),
    #[error("Prepared statement already exists: {0:?}")]
    DuplicateStatement(String),
    #[error("Portal not found: {0:?}")]
    PortalNotFound(String),
    #[error("Portal already exists: {0:?}")]
    DuplicatePortal(String),

    #[error("Failed to connect to backend {endpoint}: {reason}")]
    BackendConnect { endpoint: String, reason: String },
    #[error("Backend {0} requires an unsupported authentication method: {1}")]
    UnsupportedBackendAuth(String, String),
    #[error("No writer backends available")]
    NoWritersAvailable,
    #[error("Backend error: {}", .0.message)]
    Backend(Box<ErrorInfo>),
    #[error("Unexpected message from backend {0}")]
    UnexpectedBackendMessage(String),
    #[error("Commit failed on writer {writer} after {committed} writer(s) already committed")]
    CommitDivergence {
        writer: String,
        committed: usize,
        source: Box<ErrorInfo>,
    },
    #[error("Statement deadline exceeded")]
    DeadlineExceeded,

    #[error("Credential provider error: {0}")]
    CredentialProvider(String),

    #[error(transparent)]
    IoError(#[from] IOError),
}

impl From<ProxyError> for IOError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::IoError(io) => io,
            e => IOError::other(e),
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Error and notice fields of the wire protocol, keyed by the single-byte
/// field identifiers defined in
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>.
#[derive(new, Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ErrorInfo {
    /// `ERROR`, `FATAL` or `PANIC` for errors; `WARNING`, `NOTICE`, `DEBUG`,
    /// `INFO` or `LOG` for notices
    pub severity: String,
    /// SQLSTATE code
    pub code: String,
    pub message: String,
    #[new(default)]
    pub detail: Option<String>,
    #[new(default)]
    pub hint: Option<String>,
}

impl ErrorInfo {
    pub fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL" || self.severity == "PANIC"
    }

    fn into_fields(self) -> Vec<(u8, String)> {
        let mut fields = Vec::with_capacity(5);
        fields.push((b'S', self.severity));
        fields.push((b'C', self.code));
        fields.push((b'M', self.message));
        if let Some(value) = self.detail {
            fields.push((b'D', value));
        }
        if let Some(value) = self.hint {
            fields.push((b'H', value));
        }
        fields
    }
}

impl From<ErrorInfo> for ErrorResponse {
    fn from(ei: ErrorInfo) -> ErrorResponse {
        ErrorResponse::new(ei.into_fields())
    }
}

impl From<ErrorInfo> for NoticeResponse {
    fn from(ei: ErrorInfo) -> NoticeResponse {
        NoticeResponse::new(ei.into_fields())
    }
}

impl From<&ErrorResponse> for ErrorInfo {
    fn from(error: &ErrorResponse) -> ErrorInfo {
        let field = |id: u8| {
            error
                .fields
                .iter()
                .find(|(k, _)| *k == id)
                .map(|(_, v)| v.clone())
        };
        ErrorInfo {
            severity: field(b'S').unwrap_or_else(|| "ERROR".to_owned()),
            code: field(b'C').unwrap_or_else(|| "XX000".to_owned()),
            message: field(b'M').unwrap_or_else(|| "unknown error".to_owned()),
            detail: field(b'D'),
            hint: field(b'H'),
        }
    }
}

impl From<ProxyError> for ErrorInfo {
    fn from(e: ProxyError) -> ErrorInfo {
        match e {
            ProxyError::InvalidProtocolVersion(_)
            | ProxyError::InvalidMessageType(_)
            | ProxyError::InvalidStartupMessage
            | ProxyError::MissingUserParameter
            | ProxyError::OutOfOrderMessage(_) => {
                ErrorInfo::new("FATAL".to_owned(), "08P01".to_owned(), e.to_string())
            }

            // A single message for every authentication failure so that the
            // error text does not reveal whether the user exists.
            ProxyError::UnsupportedSaslMechanism(_)
            | ProxyError::InvalidScramMessage(_)
            | ProxyError::ChannelBindingMismatch
            | ProxyError::InvalidPassword(_) => ErrorInfo::new(
                "FATAL".to_owned(),
                "28P01".to_owned(),
                "password authentication failed".to_owned(),
            ),

            ProxyError::StatementNotFound(_) => {
                ErrorInfo::new("ERROR".to_owned(), "26000".to_owned(), e.to_string())
            }
            ProxyError::DuplicateStatement(_) => {
                ErrorInfo::new("ERROR".to_owned(), "42P05".to_owned(), e.to_string())
            }
            ProxyError::PortalNotFound(_) => {
                ErrorInfo::new("ERROR".to_owned(), "34000".to_owned(), e.to_string())
            }
            ProxyError::DuplicatePortal(_) => {
                ErrorInfo::new("ERROR".to_owned(), "42P03".to_owned(), e.to_string())
            }

            ProxyError::BackendConnect { .. }
            | ProxyError::UnsupportedBackendAuth(_, _)
            | ProxyError::NoWritersAvailable
            | ProxyError::UnexpectedBackendMessage(_) => {
                ErrorInfo::new("ERROR".to_owned(), "08006".to_owned(), e.to_string())
            }

            // Pass the backend's SQLSTATE through, but never its severity: a
            // FATAL on one backend must not take down the client session.
            ProxyError::Backend(info) => {
                ErrorInfo::new("ERROR".to_owned(), info.code, info.message)
            }
            ProxyError::CommitDivergence {
                ref writer,
                committed,
                ref source,
            } => ErrorInfo::new(
                "ERROR".to_owned(),
                source.code.clone(),
                format!(
                    "commit failed on writer {}: {}; {} writer(s) had already committed and now diverge",
                    writer, source.message, committed
                ),
            )
            .with_detail(
                "the transaction is durable on the writers that committed and absent on the rest; \
                 external reconciliation is required"
                    .to_owned(),
            ),

            ProxyError::DeadlineExceeded => ErrorInfo::new(
                "ERROR".to_owned(),
                "57014".to_owned(),
                "canceling statement due to statement timeout".to_owned(),
            ),

            ProxyError::CredentialProvider(_) => {
                ErrorInfo::new("FATAL".to_owned(), "28000".to_owned(), e.to_string())
            }

            ProxyError::IoError(_) => {
                ErrorInfo::new("FATAL".to_owned(), "08006".to_owned(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_info_fields() {
        let error_info = ErrorInfo::new(
            "FATAL".to_owned(),
            "28P01".to_owned(),
            "password authentication failed".to_owned(),
        );
        assert!(error_info.is_fatal());

        let resp: ErrorResponse = error_info.into();
        assert_eq!(
            resp.fields,
            vec![
                (b'S', "FATAL".to_owned()),
                (b'C', "28P01".to_owned()),
                (b'M', "password authentication failed".to_owned()),
            ]
        );
    }

    #[test]
    fn test_sqlstate_mapping() {
        let info = ErrorInfo::from(ProxyError::DeadlineExceeded);
        assert_eq!(info.code, "57014");
        assert!(!info.is_fatal());

        let info = ErrorInfo::from(ProxyError::InvalidPassword("alice".to_owned()));
        assert_eq!(info.code, "28P01");
        assert!(info.is_fatal());
        // auth failures must not leak the failing user through the message
        assert!(!info.message.contains("alice"));

        let info = ErrorInfo::from(ProxyError::NoWritersAvailable);
        assert_eq!(info.code, "08006");
        assert!(!info.is_fatal());
    }

    #[test]
    fn test_backend_code_passthrough() {
        let backend = ErrorInfo::new(
            "FATAL".to_owned(),
            "23505".to_owned(),
            "duplicate key value".to_owned(),
        );
        let info = ErrorInfo::from(ProxyError::Backend(Box::new(backend)));
        assert_eq!(info.code, "23505");
        // backend severity is clamped to ERROR for the proxied session
        assert_eq!(info.severity, "ERROR");
    }
}
