//! WebSocket transport built on `tokio-tungstenite`.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use super::error::TransportError;
use super::traits::{Transport, TransportEvent, TransportFactory, TransportHandle};
use crate::Result;
use crate::error::Error;
use crate::types::{CloseInfo, EndpointKey, ErrorInfo, Message, NORMAL_CLOSURE};

/// Close code reported when the peer's close frame carried no status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// How long a local close waits for the peer's close frame before dropping the socket.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Outgoing {
    Message(Message),
    Close,
}

/// Creates [`TransportKind::Bidirectional`](super::traits::TransportKind) transports for
/// `ws://` and `wss://` endpoints.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteFactory;

impl TransportFactory for TungsteniteFactory {
    fn validate(&self, endpoint: &EndpointKey) -> Result<()> {
        let url = Url::parse(endpoint.as_str())?;
        match url.scheme() {
            "ws" | "wss" => Ok(()),
            _ => Err(TransportError::InvalidEndpoint(endpoint.to_string()).into()),
        }
    }

    fn connect(&self, endpoint: &EndpointKey, protocols: &[String]) -> Result<TransportHandle> {
        self.validate(endpoint)?;

        let mut request = endpoint.as_str().into_client_request()?;
        if !protocols.is_empty() {
            let value = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|_e| Error::validation("sub-protocols must be valid header text"))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(request, outgoing_rx, events_tx));

        Ok(TransportHandle::new(
            Arc::new(TungsteniteTransport {
                outgoing: outgoing_tx,
            }),
            events_rx,
        ))
    }
}

struct TungsteniteTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Transport for TungsteniteTransport {
    fn send(&self, message: Message) -> Result<()> {
        self.outgoing
            .send(Outgoing::Message(message))
            .map_err(|_e| TransportError::ConnectionClosed)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // A finished socket task has nothing left to close
        _ = self.outgoing.send(Outgoing::Close);
        Ok(())
    }
}

fn to_wire(message: Message) -> WsMessage {
    match message {
        Message::Text(text) => WsMessage::Text(text.into()),
        Message::Binary(bytes) => WsMessage::Binary(bytes.into()),
    }
}

fn fail(events: &mpsc::UnboundedSender<TransportEvent>, error: &Error) {
    let reason = error.to_string();
    _ = events.send(TransportEvent::Error(ErrorInfo::new(reason.clone())));
    _ = events.send(TransportEvent::Close(CloseInfo::abnormal(reason)));
}

/// Socket task: connects, then pumps frames both ways until either side closes.
async fn drive(
    request: Request,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut connecting = pin!(connect_async(request));
    let stream = loop {
        tokio::select! {
            result = &mut connecting => match result {
                Ok((stream, _)) => break stream,
                Err(e) => {
                    fail(&events, &e.into());
                    return;
                }
            },
            command = outgoing.recv() => match command {
                // Nothing is written before the socket opens
                Some(Outgoing::Message(_)) => {}
                Some(Outgoing::Close) | None => {
                    _ = events.send(TransportEvent::Close(CloseInfo::abnormal(
                        "closed before the connection opened",
                    )));
                    return;
                }
            },
        }
    };

    _ = events.send(TransportEvent::Open);
    let (mut write, mut read) = stream.split();
    let mut closing = false;
    let mut close_deadline = Instant::now();

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    _ = events.send(TransportEvent::Message(Message::Text(text.as_str().to_owned())));
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    _ = events.send(TransportEvent::Message(Message::Binary(bytes.to_vec())));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let close = frame.map_or_else(
                        || CloseInfo::new(NO_STATUS_RECEIVED, "", true),
                        |frame| CloseInfo::new(u16::from(frame.code), frame.reason.as_str(), true),
                    );
                    // Complete the handshake; the peer may already be gone
                    _ = write.close().await;
                    _ = events.send(TransportEvent::Close(close));
                    return;
                }
                Some(Ok(_)) => {
                    // Ping and pong frames are answered by tungstenite itself
                }
                Some(Err(e)) => {
                    fail(&events, &e.into());
                    return;
                }
                None => {
                    _ = events.send(TransportEvent::Close(CloseInfo::abnormal("stream ended")));
                    return;
                }
            },

            command = outgoing.recv(), if !closing => match command {
                Some(Outgoing::Message(message)) => {
                    if let Err(e) = write.send(to_wire(message)).await {
                        fail(&events, &e.into());
                        return;
                    }
                }
                Some(Outgoing::Close) | None => {
                    closing = true;
                    close_deadline = Instant::now() + CLOSE_HANDSHAKE_TIMEOUT;
                    let frame = CloseFrame {
                        code: CloseCode::from(NORMAL_CLOSURE),
                        reason: "".into(),
                    };
                    // A peer that stopped reading can leave the write pending too
                    _ = timeout(
                        CLOSE_HANDSHAKE_TIMEOUT,
                        write.send(WsMessage::Close(Some(frame))),
                    )
                    .await;
                }
            },

            () = sleep_until(close_deadline), if closing => {
                #[cfg(feature = "tracing")]
                tracing::debug!(timeout = ?CLOSE_HANDSHAKE_TIMEOUT, "Peer never completed the close handshake");
                _ = events.send(TransportEvent::Close(CloseInfo::abnormal(
                    "close handshake timed out",
                )));
                return;
            }
        }
    }
}
