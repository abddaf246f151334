//! Relay transport
//!
//! [`RelayTransport`] is the seam between a role connection and the wire. The
//! production implementation, [`SocketIoTransport`], speaks Socket.IO over a
//! tokio-tungstenite websocket: it performs the Engine.IO open and namespace
//! connect handshakes, answers heartbeats, resolves acknowledgements, and hands
//! every inbound event to a [`DeliveryRouter`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::capture::CapturedEvent;
use crate::error::ConnectionError;
use crate::protocol::{payload_from_args, EnginePacket, OpenHandshake, SocketPacket};
use crate::subscription::DeliveryRouter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>>;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Fire-and-forget emit of a single-payload event
    async fn emit(&self, event: &str, payload: Value) -> Result<(), ConnectionError>;

    /// Emit and wait for the relay's acknowledgement arguments
    async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        wait: Duration,
    ) -> Result<Vec<Value>, ConnectionError>;

    /// Graceful close; calling it again is a no-op
    async fn close(&self) -> Result<(), ConnectionError>;

    fn is_connected(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Socket.IO Transport
// ----------------------------------------------------------------------------

/// Timing knobs for [`SocketIoTransport::connect`]
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
}

pub struct SocketIoTransport {
    label: String,
    outbound: mpsc::UnboundedSender<WsMessage>,
    connected: Arc<AtomicBool>,
    pending_acks: PendingAcks,
    next_ack_id: AtomicU64,
    close_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SocketIoTransport {
    /// Open the websocket, complete both handshakes, and start the reader and writer tasks
    pub async fn connect(
        label: impl Into<String>,
        endpoint: &Url,
        options: &TransportOptions,
        router: Arc<DeliveryRouter>,
    ) -> Result<Self, ConnectionError> {
        let label = label.into();
        info!("[{}] Connecting to {}", label, endpoint);

        let (ws, handshake) = timeout(options.connect_timeout, Self::handshake(endpoint))
            .await
            .map_err(|_| ConnectionError::Timeout {
                stage: "connecting to relay",
                timeout: options.connect_timeout,
            })??;

        info!("[{}] Connected (engine sid {})", label, handshake.sid);

        let (sink, stream) = ws.split();

        let connected = Arc::new(AtomicBool::new(true));
        let pending_acks: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::write_loop(label.clone(), sink, outbound_rx));

        let reader = tokio::spawn(Self::read_loop(
            label.clone(),
            stream,
            handshake.liveness_window(),
            outbound_tx.clone(),
            router,
            Arc::clone(&pending_acks),
            Arc::clone(&connected),
        ));

        Ok(Self {
            label,
            outbound: outbound_tx,
            connected,
            pending_acks,
            next_ack_id: AtomicU64::new(0),
            close_timeout: options.close_timeout,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Engine.IO open followed by the default-namespace connect
    async fn handshake(endpoint: &Url) -> Result<(WsStream, OpenHandshake), ConnectionError> {
        let (mut ws, _response) = connect_async(endpoint.as_str()).await?;

        let handshake = match Self::next_engine_packet(&mut ws).await? {
            EnginePacket::Open(handshake) => handshake,
            other => {
                return Err(ConnectionError::Handshake(format!(
                    "expected open packet, got {:?}",
                    other
                )))
            }
        };

        ws.send(WsMessage::Text(SocketPacket::connect().to_engine_text()))
            .await?;

        loop {
            match Self::next_engine_packet(&mut ws).await? {
                EnginePacket::Ping(data) => {
                    ws.send(WsMessage::Text(EnginePacket::Pong(data).encode())).await?;
                }
                EnginePacket::Message(body) => match SocketPacket::decode(&body)? {
                    SocketPacket::Connect { .. } => return Ok((ws, handshake)),
                    SocketPacket::ConnectError { data, .. } => {
                        let reason = data
                            .as_ref()
                            .and_then(|d| d.get("message"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("{:?}", data));
                        return Err(ConnectionError::Rejected(reason));
                    }
                    other => debug!("Ignoring {:?} before namespace connect", other),
                },
                EnginePacket::Close => return Err(ConnectionError::Closed),
                EnginePacket::Noop | EnginePacket::Pong(_) => {}
                other => debug!("Ignoring {:?} during handshake", other),
            }
        }
    }

    async fn next_engine_packet(ws: &mut WsStream) -> Result<EnginePacket, ConnectionError> {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(EnginePacket::decode(&text)?),
                Some(Ok(WsMessage::Close(_))) | None => return Err(ConnectionError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn write_loop(
        label: String,
        mut sink: futures::stream::SplitSink<WsStream, WsMessage>,
        mut outbound: mpsc::UnboundedReceiver<WsMessage>,
    ) {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!("[{}] Write failed: {}", label, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    }

    async fn read_loop(
        label: String,
        mut stream: futures::stream::SplitStream<WsStream>,
        liveness: Duration,
        outbound: mpsc::UnboundedSender<WsMessage>,
        router: Arc<DeliveryRouter>,
        pending_acks: PendingAcks,
        connected: Arc<AtomicBool>,
    ) {
        loop {
            let frame = match timeout(liveness, stream.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    if connected.load(Ordering::SeqCst) {
                        warn!("[{}] Websocket error: {}", label, e);
                    }
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("[{}] No heartbeat from relay within {:?}", label, liveness);
                    break;
                }
            };

            let text = match frame {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => break,
                _ => continue,
            };

            let packet = match EnginePacket::decode(&text) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("[{}] Dropping undecodable frame '{}': {}", label, text, e);
                    continue;
                }
            };

            match packet {
                EnginePacket::Ping(data) => {
                    let _ = outbound.send(WsMessage::Text(EnginePacket::Pong(data).encode()));
                }
                EnginePacket::Message(body) => match SocketPacket::decode(&body) {
                    Ok(SocketPacket::Event { name, args, .. }) => {
                        let event = CapturedEvent::new(name, payload_from_args(args));
                        debug!("[{}] Delivery {}", label, event);
                        router.dispatch(&event);
                    }
                    Ok(SocketPacket::Ack { id, args, .. }) => {
                        let waiter = pending_acks
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(args);
                            }
                            None => debug!("[{}] Unsolicited ack {}", label, id),
                        }
                    }
                    Ok(SocketPacket::Disconnect { .. }) => {
                        info!("[{}] Relay closed the namespace", label);
                        break;
                    }
                    Ok(other) => debug!("[{}] Ignoring {:?}", label, other),
                    Err(e) => warn!("[{}] Dropping malformed packet '{}': {}", label, body, e),
                },
                EnginePacket::Close => break,
                _ => {}
            }
        }

        if connected.swap(false, Ordering::SeqCst) {
            info!("[{}] Connection lost", label);
        }
        router.close();
        // Wakes every pending ack waiter with a closed channel
        pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn send_packet(&self, packet: &SocketPacket) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(WsMessage::Text(packet.to_engine_text()))
            .map_err(|_| ConnectionError::Closed)
    }
}

#[async_trait]
impl RelayTransport for SocketIoTransport {
    async fn emit(&self, event: &str, payload: Value) -> Result<(), ConnectionError> {
        debug!("[{}] Emit {}: {}", self.label, event, payload);
        self.send_packet(&SocketPacket::event(event, payload, None))
    }

    async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        wait: Duration,
    ) -> Result<Vec<Value>, ConnectionError> {
        let id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        debug!("[{}] Emit {} (ack {}): {}", self.label, event, id, payload);
        if let Err(e) = self.send_packet(&SocketPacket::event(event, payload, Some(id))) {
            self.pending_acks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(args)) => Ok(args),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.pending_acks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                Err(ConnectionError::Timeout {
                    stage: "waiting for acknowledgement",
                    timeout: wait,
                })
            }
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            return Ok(());
        };

        if self.connected.swap(false, Ordering::SeqCst) {
            let disconnect = SocketPacket::Disconnect {
                namespace: crate::protocol::DEFAULT_NAMESPACE.to_string(),
            };
            let _ = self.outbound.send(WsMessage::Text(disconnect.to_engine_text()));
            let _ = self.outbound.send(WsMessage::Close(None));
        }

        let abort = reader.abort_handle();
        match timeout(self.close_timeout, reader).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!("[{}] Reader task failed: {}", self.label, e),
            Err(_) => {
                abort.abort();
                return Err(ConnectionError::Timeout {
                    stage: "closing connection",
                    timeout: self.close_timeout,
                });
            }
        }

        info!("[{}] Disconnected", self.label);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SocketIoTransport {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}
