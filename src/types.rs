//! Value types shared by the transport capability, the supervisor and callers.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Close code for a normal, clean shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code for a connection that dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Lifecycle state of a connection as observed by one subscriber.
///
/// Transitions only along `Uninstantiated -> Connecting -> Open -> (Closing -> Closed | Connecting)`;
/// `Closed` is also reachable directly from `Connecting` when a connection never opened.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[non_exhaustive]
pub enum ReadyState {
    /// No connection has been requested yet
    #[default]
    Uninstantiated,
    /// A transport is being created or a reconnect is pending
    Connecting,
    /// The transport is open and sends go straight to the wire
    Open,
    /// Disposal was requested on an open connection
    Closing,
    /// The connection is down and no reconnect is pending
    Closed,
}

impl ReadyState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// A single message travelling over the socket.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// Text payload, if this is a text message.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.as_bytes())?)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

/// Details of a transport `close` event.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }

    /// A close that happened without a close handshake.
    #[must_use]
    pub fn abnormal<S: Into<String>>(reason: S) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason, false)
    }
}

/// Details of a transport `error` event.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub message: String,
}

impl ErrorInfo {
    #[must_use]
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&crate::error::Error> for ErrorInfo {
    fn from(error: &crate::error::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// A resolved connection target. Two shared connections with the same key use one
/// physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(Arc<str>);

impl EndpointKey {
    #[must_use]
    pub fn new<S: AsRef<str>>(key: S) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for EndpointKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl AsRef<str> for EndpointKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
