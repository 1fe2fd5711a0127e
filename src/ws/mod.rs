//! Connection lifecycle engine.
//!
//! # Architecture
//!
//! - [`Transport`] / [`TransportFactory`]: the capability the engine consumes; it never owns a
//!   socket implementation itself
//! - [`ReconnectPolicy`]: attempt budget and delay before each retry
//! - [`HeartbeatMonitor`]: keep-alive pings plus a liveness check that closes silent transports
//! - [`OutboundQueue`]: buffers sends until the connection opens, then flushes them in order
//! - `ConnectionSupervisor`: one actor task per physical connection
//! - [`SharedConnectionRegistry`]: multiplexes equal endpoints onto one physical connection

pub mod config;
mod connection;
pub mod error;
pub mod heartbeat;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub(crate) mod subscriber;
pub mod traits;
#[cfg(feature = "tungstenite")]
pub mod tungstenite;

pub(crate) use connection::{ConnectionConfig, ConnectionSupervisor, Link};
pub use heartbeat::{HeartbeatMonitor, MessageWatchdog};
pub use queue::{Delivery, OutboundQueue};
pub use reconnect::{ReconnectPolicy, ReconnectTimer};
pub use registry::SharedConnectionRegistry;
pub use traits::*;
#[cfg(feature = "tungstenite")]
pub use tungstenite::TungsteniteFactory;
