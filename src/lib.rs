#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod error;
pub mod types;
pub mod ws;

pub use client::{Client, ConnectionHandle};
pub use error::Error;
pub use types::{CloseInfo, EndpointKey, ErrorInfo, Message, ReadyState};
pub use ws::config::Options;

pub type Result<T> = std::result::Result<T, Error>;
