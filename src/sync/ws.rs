//! WebSocket room transport.
//!
//! Each connection runs in its own task: it connects, pumps outbound frames and
//! inbound events, and reconnects with a fixed delay until a bounded number of
//! consecutive attempts has failed. Emits made while disconnected are queued
//! and flushed once a connection is up.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::SyncProtocol;
use super::state::DisconnectReason;
use super::transport::{ConnectOptions, Connection, EventSink, TransportEvent, TransportFactory};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport factory for JSON-envelope WebSocket room servers
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl TransportFactory for WsTransport {
    type Sink = WsSink;

    fn connect(&self, options: &ConnectOptions) -> Connection<WsSink> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_connection(options.clone(), outbound_rx, event_tx));

        Connection {
            sink: WsSink {
                outbound: outbound_tx,
            },
            events: event_rx,
        }
    }
}

/// Outbound half of a WebSocket connection. Dropping it closes the connection.
pub struct WsSink {
    outbound: mpsc::UnboundedSender<String>,
}

impl EventSink for WsSink {
    fn emit(&self, event: &str, payload: Value) {
        match SyncProtocol::encode(event, payload) {
            Ok(text) => {
                if self.outbound.send(text).is_err() {
                    debug!("Connection task gone, dropped {}", event);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", event, e),
        }
    }
}

async fn run_connection(
    options: ConnectOptions,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let endpoint = options.endpoint();
    let mut failures: u32 = 0;

    loop {
        match connect_async(endpoint.as_str()).await {
            Ok((stream, _response)) => {
                failures = 0;
                info!("Connected to {}", endpoint);
                if events.send(TransportEvent::Connect).is_err() {
                    return;
                }

                let reason = pump(stream, &mut outbound, &events).await;
                let stop = matches!(
                    reason,
                    DisconnectReason::ClientDisconnect | DisconnectReason::ServerDisconnect
                );
                let _ = events.send(TransportEvent::Disconnect(reason));
                if stop {
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Connection attempt {}/{} to {} failed: {}",
                    failures, options.reconnection_attempts, endpoint, e
                );
                if events.send(TransportEvent::ConnectError(e.to_string())).is_err() {
                    return;
                }
                if failures >= options.reconnection_attempts {
                    warn!("Giving up on {} after {} attempts", endpoint, failures);
                    return;
                }
            }
        }

        if events.is_closed() {
            return;
        }
        tokio::time::sleep(options.reconnection_delay).await;
    }
}

async fn pump(
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> DisconnectReason {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!("WebSocket send failed: {}", e);
                        return DisconnectReason::TransportError;
                    }
                }
                None => {
                    let _ = write.close().await;
                    return DisconnectReason::ClientDisconnect;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match SyncProtocol::decode(&text) {
                    Ok(envelope) => {
                        let event = TransportEvent::Message {
                            event: envelope.event,
                            payload: envelope.data,
                        };
                        if events.send(event).is_err() {
                            let _ = write.close().await;
                            return DisconnectReason::ClientDisconnect;
                        }
                    }
                    Err(e) => warn!("Dropping malformed frame: {}", e),
                },
                Some(Ok(Message::Close(_))) => return DisconnectReason::ServerDisconnect,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket receive failed: {}", e);
                    return DisconnectReason::TransportError;
                }
                None => return DisconnectReason::TransportClose,
            },
        }
    }
}
