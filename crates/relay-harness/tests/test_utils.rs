//! Test utilities for exercising the harness against an in-process relay
//!
//! [`MockRelay`] speaks enough Engine.IO / Socket.IO over a real websocket to
//! stand in for the production relay: it pairs sockets by the token in their
//! `ID` registration and routes events between `send` and `receive` sockets
//! using the same reserved-name table. Knobs let a test drop, rewrite or hold
//! back events, cut a destination socket, and decide whether registrations are
//! acknowledged.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_harness::protocol::{EnginePacket, OpenHandshake, SocketPacket, DEFAULT_NAMESPACE};
use relay_harness::{HarnessConfig, RegistrationSettle, RECEIVER_TO_SENDER_EVENTS};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Route harness logs through the test writer; `RUST_LOG=debug` shows wire traffic
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ----------------------------------------------------------------------------
// Relay Behaviour
// ----------------------------------------------------------------------------

/// Fault injection knobs for [`MockRelay`]
#[derive(Debug, Clone, Default)]
pub struct RelayBehavior {
    /// Event names swallowed instead of forwarded
    pub drop_events: HashSet<String>,
    /// Payload forwarded in place of the published one, per event name
    pub rewrite_payloads: HashMap<String, Value>,
    /// Event names held back until the next event of the same session is routed
    pub late_events: HashSet<String>,
    /// Event names that make the relay close the destination socket instead of forwarding
    pub close_on: HashSet<String>,
    /// Answer `ID` registrations that request an acknowledgement
    pub ack_registration: bool,
    /// Milliseconds between server pings; 0 disables pinging
    pub ping_interval_ms: u64,
}

impl RelayBehavior {
    /// Forwards everything, never acknowledges, pings every 200ms
    pub fn faithful() -> Self {
        Self {
            ping_interval_ms: 200,
            ..Self::default()
        }
    }

    pub fn dropping(mut self, event: &str) -> Self {
        self.drop_events.insert(event.to_string());
        self
    }

    pub fn rewriting(mut self, event: &str, payload: Value) -> Self {
        self.rewrite_payloads.insert(event.to_string(), payload);
        self
    }

    pub fn delaying(mut self, event: &str) -> Self {
        self.late_events.insert(event.to_string());
        self
    }

    pub fn closing_on(mut self, event: &str) -> Self {
        self.close_on.insert(event.to_string());
        self
    }

    pub fn acknowledging(mut self) -> Self {
        self.ack_registration = true;
        self
    }
}

// ----------------------------------------------------------------------------
// Mock Relay
// ----------------------------------------------------------------------------

struct Peer {
    outbound: mpsc::UnboundedSender<Message>,
    token: Option<String>,
    role: Option<String>,
}

struct Held {
    token: String,
    target_role: &'static str,
    text: String,
}

struct RelayState {
    behavior: RelayBehavior,
    peers: Mutex<HashMap<u64, Peer>>,
    held: Mutex<Vec<Held>>,
    registrations: Mutex<Vec<(String, String)>>,
    next_peer: AtomicU64,
    pongs: AtomicUsize,
    forwarded: AtomicUsize,
}

pub struct MockRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    accept_task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start(behavior: RelayBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(RelayState {
            behavior,
            peers: Mutex::new(HashMap::new()),
            held: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            next_peer: AtomicU64::new(1),
            pongs: AtomicUsize::new(0),
            forwarded: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_peer(stream, Arc::clone(&accept_state)));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// Address in the form users configure, e.g. `http://127.0.0.1:40123`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Harness configuration pointed at this relay with short timeouts
    pub fn config(&self) -> HarnessConfig {
        HarnessConfig {
            connect_timeout_ms: 2_000,
            step_timeout_ms: 1_000,
            close_timeout_ms: 500,
            registration: RegistrationSettle::Delay { settle_ms: 100 },
            ..HarnessConfig::for_server(self.url())
        }
    }

    /// `(token, role)` pairs in registration order
    pub fn registrations(&self) -> Vec<(String, String)> {
        self.state.registrations.lock().unwrap().clone()
    }

    pub fn pongs(&self) -> usize {
        self.state.pongs.load(Ordering::SeqCst)
    }

    pub fn forwarded(&self) -> usize {
        self.state.forwarded.load(Ordering::SeqCst)
    }

    pub fn connected_peers(&self) -> usize {
        self.state.peers.lock().unwrap().len()
    }

    /// Wait until every peer has gone away, up to `budget`
    pub async fn wait_for_disconnects(&self, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            if self.connected_peers() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.connected_peers() == 0
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_peer(stream: TcpStream, state: Arc<RelayState>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut sink, mut source) = ws.split();

    let peer_id = state.next_peer.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let ping_interval = state.behavior.ping_interval_ms;
    let open = EnginePacket::Open(OpenHandshake {
        sid: format!("engine-{}", peer_id),
        upgrades: vec![],
        ping_interval: if ping_interval == 0 { 25_000 } else { ping_interval },
        ping_timeout: 20_000,
        max_payload: Some(1_000_000),
    });
    let _ = tx.send(Message::Text(open.encode()));

    state.peers.lock().unwrap().insert(
        peer_id,
        Peer {
            outbound: tx.clone(),
            token: None,
            role: None,
        },
    );

    let pinger = (ping_interval > 0).then(|| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(ping_interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(Message::Text(EnginePacket::Ping(String::new()).encode())).is_err() {
                    break;
                }
            }
        })
    });

    while let Some(Ok(message)) = source.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match EnginePacket::decode(&text) {
            Ok(EnginePacket::Pong(_)) => {
                state.pongs.fetch_add(1, Ordering::SeqCst);
            }
            Ok(EnginePacket::Message(body)) => {
                let Ok(packet) = SocketPacket::decode(&body) else {
                    continue;
                };
                if !handle_packet(peer_id, packet, &tx, &state) {
                    break;
                }
            }
            Ok(EnginePacket::Close) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.peers.lock().unwrap().remove(&peer_id);
    if let Some(pinger) = pinger {
        pinger.abort();
    }
    drop(tx);
    let _ = tokio::time::timeout(Duration::from_millis(200), writer).await;
}

/// Returns false once the peer asked to leave
fn handle_packet(
    peer_id: u64,
    packet: SocketPacket,
    tx: &mpsc::UnboundedSender<Message>,
    state: &RelayState,
) -> bool {
    match packet {
        SocketPacket::Connect { .. } => {
            let reply = SocketPacket::Connect {
                namespace: DEFAULT_NAMESPACE.to_string(),
                data: Some(json!({ "sid": format!("socket-{}", peer_id) })),
            };
            let _ = tx.send(Message::Text(reply.to_engine_text()));
        }
        SocketPacket::Disconnect { .. } => return false,
        SocketPacket::Event { name, id, args, .. } if name == "ID" => {
            let registration = args.first().and_then(Value::as_array).cloned().unwrap_or_default();
            let token = registration.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let role = registration.get(1).and_then(Value::as_str).unwrap_or_default().to_string();

            if let Some(peer) = state.peers.lock().unwrap().get_mut(&peer_id) {
                peer.token = Some(token.clone());
                peer.role = Some(role.clone());
            }
            state.registrations.lock().unwrap().push((token, role));

            if let (true, Some(id)) = (state.behavior.ack_registration, id) {
                let ack = SocketPacket::Ack {
                    namespace: DEFAULT_NAMESPACE.to_string(),
                    id,
                    args: vec![json!("registered")],
                };
                let _ = tx.send(Message::Text(ack.to_engine_text()));
            }
        }
        SocketPacket::Event { name, args, .. } => route(peer_id, name, args, state),
        SocketPacket::Ack { .. } | SocketPacket::ConnectError { .. } => {}
    }
    true
}

fn route(peer_id: u64, event: String, args: Vec<Value>, state: &RelayState) {
    if state.behavior.drop_events.contains(&event) {
        return;
    }

    let target_role = if RECEIVER_TO_SENDER_EVENTS.contains(&event.as_str()) {
        "send"
    } else {
        "receive"
    };

    // The relay forwards only the first argument
    let payload = state
        .behavior
        .rewrite_payloads
        .get(&event)
        .cloned()
        .unwrap_or_else(|| args.into_iter().next().unwrap_or(Value::Null));

    let peers = state.peers.lock().unwrap();
    let Some(token) = peers.get(&peer_id).and_then(|p| p.token.clone()) else {
        return;
    };

    if state.behavior.close_on.contains(&event) {
        for peer in session_peers(&peers, &token, target_role) {
            let _ = peer.outbound.send(Message::Close(None));
        }
        return;
    }

    let text = SocketPacket::event(event.as_str(), payload, None).to_engine_text();
    if state.behavior.late_events.contains(&event) {
        state.held.lock().unwrap().push(Held {
            token,
            target_role,
            text,
        });
        return;
    }

    let released: Vec<Held> = {
        let mut held = state.held.lock().unwrap();
        let (released, kept): (Vec<Held>, Vec<Held>) = std::mem::take(&mut *held)
            .into_iter()
            .partition(|entry| entry.token == token);
        *held = kept;
        released
    };
    for held in released {
        deliver(&peers, &held.token, held.target_role, &held.text, state);
    }
    deliver(&peers, &token, target_role, &text, state);
}

fn session_peers<'a>(
    peers: &'a HashMap<u64, Peer>,
    token: &'a str,
    role: &'a str,
) -> impl Iterator<Item = &'a Peer> + 'a {
    peers
        .values()
        .filter(move |peer| peer.token.as_deref() == Some(token) && peer.role.as_deref() == Some(role))
}

fn deliver(peers: &HashMap<u64, Peer>, token: &str, role: &str, text: &str, state: &RelayState) {
    for peer in session_peers(peers, token, role) {
        if peer.outbound.send(Message::Text(text.to_string())).is_ok() {
            state.forwarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}
