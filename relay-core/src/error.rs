use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a connection ended or could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum ConnectionErrorCode {
    #[error("internal exception")]
    InternalException,
    #[error("bad request")]
    BadRequest,
    #[error("client is outdated")]
    ClientOutdated,
    #[error("server is outdated")]
    ServerOutdated,
    #[error("unauthorized")]
    Unauthorized,
    #[error("connection error")]
    Connection,
    #[error("external error")]
    ExternalError,
    #[error("unknown error")]
    Unknown,
}

/// What the user can do about a [`ConnectionErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    Retry,
    UpdateClient,
    UpdateServer,
    Reconfigure,
}

impl ConnectionErrorCode {
    /// Connection-level failures are the only ones that justify trying an
    /// older protocol version or scheduling an immediate reconnect.
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            ConnectionErrorCode::Connection | ConnectionErrorCode::ExternalError
        )
    }

    pub fn remediation(self) -> Remediation {
        match self {
            ConnectionErrorCode::ClientOutdated => Remediation::UpdateClient,
            ConnectionErrorCode::ServerOutdated => Remediation::UpdateServer,
            ConnectionErrorCode::Unauthorized => Remediation::Reconfigure,
            _ => Remediation::Retry,
        }
    }
}

/// Locally generated failures shared by every request kind.
///
/// The pending request table fails entries through this trait, so each request
/// kind keeps its own error type without any runtime casting.
pub trait RequestFailure: std::error::Error + Clone + Send + Sync + 'static {
    fn network() -> Self;
    fn timeout() -> Self;
    fn connection_lost() -> Self;
    fn bad_response() -> Self;
    fn io() -> Self;
    fn unknown() -> Self;
}

macro_rules! request_error {
    ($(#[$meta:meta])* $name:ident { $($extra:tt)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Error)]
        pub enum $name {
            #[error("no connection to the server")]
            Network,
            #[error("request timed out")]
            Timeout,
            #[error("connection lost")]
            ConnectionLost,
            #[error("bad response from server")]
            BadResponse,
            #[error("local I/O error")]
            Io,
            #[error("server reported error {code}")]
            Remote { code: i32, details: Option<String> },
            #[error("unknown error")]
            Unknown,
            $($extra)*
        }

        impl RequestFailure for $name {
            fn network() -> Self {
                Self::Network
            }

            fn timeout() -> Self {
                Self::Timeout
            }

            fn connection_lost() -> Self {
                Self::ConnectionLost
            }

            fn bad_response() -> Self {
                Self::BadResponse
            }

            fn io() -> Self {
                Self::Io
            }

            fn unknown() -> Self {
                Self::Unknown
            }
        }
    };
}

request_error! {
    /// Failure of a text message or file upload.
    MessageSendError {}
}

request_error! {
    /// Failure of an attachment download.
    AttachmentRequestError {}
}

request_error! {
    /// Failure of a chat creation request.
    ChatCreateError {}
}

request_error! {
    /// Failure of a full-history download.
    MassRetrievalError {
        #[error("a mass retrieval is already in progress")]
        AlreadyInProgress,
    }
}

/// Why an aggregator rejected a callback.
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// The server broke the streaming protocol: wrong order, unknown GUID, or a
    /// length that does not add up.
    #[error("protocol violation: {0}")]
    BadResponse(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AggregatorError {
    pub(crate) fn bad_response(message: impl Into<String>) -> Self {
        AggregatorError::BadResponse(message.into())
    }

    /// Maps the failure onto the request kind's own taxonomy.
    pub fn classify<E: RequestFailure>(&self) -> E {
        match self {
            AggregatorError::BadResponse(_) => E::bad_response(),
            AggregatorError::Io(_) => E::io(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_codes() {
        assert!(ConnectionErrorCode::Connection.is_connection_level());
        assert!(ConnectionErrorCode::ExternalError.is_connection_level());
        assert!(!ConnectionErrorCode::Unauthorized.is_connection_level());
        assert!(!ConnectionErrorCode::ServerOutdated.is_connection_level());
    }

    #[test]
    fn test_remediation() {
        assert_eq!(
            ConnectionErrorCode::ClientOutdated.remediation(),
            Remediation::UpdateClient
        );
        assert_eq!(
            ConnectionErrorCode::Unauthorized.remediation(),
            Remediation::Reconfigure
        );
        assert_eq!(ConnectionErrorCode::Connection.remediation(), Remediation::Retry);
    }

    #[test]
    fn test_classify_aggregator_errors() {
        let err = AggregatorError::bad_response("out of order");
        assert_eq!(err.classify::<MassRetrievalError>(), MassRetrievalError::BadResponse);

        let err = AggregatorError::Io(std::io::Error::other("disk full"));
        assert_eq!(
            err.classify::<AttachmentRequestError>(),
            AttachmentRequestError::Io
        );
    }
}
