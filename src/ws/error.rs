#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// Transport error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the WebSocket server
    #[cfg(feature = "tungstenite")]
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The transport is no longer accepting messages
    ConnectionClosed,
    /// The handle was disposed and can no longer be used
    Disposed,
    /// The endpoint cannot be used by this transport
    InvalidEndpoint(String),
    /// The operation is not available on this kind of transport
    Unsupported(&'static str),
    /// Message stream lagged and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "tungstenite")]
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectionClosed => write!(f, "transport connection closed"),
            Self::Disposed => write!(f, "connection handle was disposed"),
            Self::InvalidEndpoint(endpoint) => write!(f, "invalid endpoint: {endpoint}"),
            Self::Unsupported(operation) => {
                write!(f, "{operation} is not supported by this transport")
            }
            Self::Lagged { count } => write!(f, "Message stream lagged, missed {count} messages"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            #[cfg(feature = "tungstenite")]
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<TransportError> for crate::error::Error {
    fn from(e: TransportError) -> Self {
        let kind = match e {
            TransportError::InvalidEndpoint(_) => crate::error::Kind::Validation,
            _ => crate::error::Kind::Transport,
        };
        crate::error::Error::with_source(kind, e)
    }
}

#[cfg(feature = "tungstenite")]
impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(
            crate::error::Kind::Transport,
            TransportError::Connection(e),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Kind};

    #[test]
    fn invalid_endpoint_is_a_validation_error() {
        let error: Error = TransportError::InvalidEndpoint("ftp://nope".to_owned()).into();

        assert_eq!(error.kind(), Kind::Validation);
        assert!(error.to_string().contains("ftp://nope"));
    }

    #[test]
    fn disposed_is_a_transport_error() {
        let error: Error = TransportError::Disposed.into();

        assert_eq!(error.kind(), Kind::Transport);
        assert!(matches!(
            error.downcast_ref::<TransportError>(),
            Some(TransportError::Disposed)
        ));
    }
}
