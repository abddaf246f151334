//! Role connections
//!
//! A [`RoleConnection`] owns one relay transport registered as either the sender
//! or the receiver of a session. Every inbound delivery is forwarded verbatim into
//! the connection's [`CaptureQueue`] by a catch-all subscription that is created
//! before the transport starts reading, so nothing can arrive unobserved.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::capture::{CaptureQueue, CapturedEvent};
use crate::config::{HarnessConfig, RegistrationSettle};
use crate::error::{CaptureError, ConnectionError};
use crate::session::{Role, SessionToken};
use crate::subscription::{DeliveryRouter, Subscription};
use crate::transport::{RelayTransport, SocketIoTransport, TransportOptions};

/// Event name the relay uses for role registration
pub const REGISTRATION_EVENT: &str = "ID";

pub struct RoleConnection {
    role: Role,
    transport: Box<dyn RelayTransport>,
    router: Arc<DeliveryRouter>,
    queue: CaptureQueue,
    _capture: Subscription,
    disconnected: bool,
}

impl RoleConnection {
    /// Connect to the configured relay over Socket.IO
    pub async fn connect(config: &HarnessConfig, role: Role) -> Result<Self, ConnectionError> {
        let endpoint = config
            .websocket_endpoint()
            .map_err(|e| ConnectionError::InvalidEndpoint {
                url: config.server_url.clone(),
                reason: e.to_string(),
            })?;

        let options = TransportOptions {
            connect_timeout: config.connect_timeout(),
            close_timeout: config.close_timeout(),
        };

        Self::with_transport(role, |router| async move {
            let transport =
                SocketIoTransport::connect(role.to_string(), &endpoint, &options, router).await?;
            Ok(Box::new(transport) as Box<dyn RelayTransport>)
        })
        .await
    }

    /// Build a connection over any transport. `open` receives the router the
    /// transport must dispatch inbound events to; capture is already wired up.
    pub async fn with_transport<F, Fut>(role: Role, open: F) -> Result<Self, ConnectionError>
    where
        F: FnOnce(Arc<DeliveryRouter>) -> Fut,
        Fut: Future<Output = Result<Box<dyn RelayTransport>, ConnectionError>>,
    {
        let router = DeliveryRouter::new();
        let (sink, queue) = CaptureQueue::channel();

        let capture = router.on_any(move |event: &CapturedEvent| {
            info!("{} received {}", role, event);
            sink.push(event.clone());
        });

        let transport = open(Arc::clone(&router)).await?;

        Ok(Self {
            role,
            transport,
            router,
            queue,
            _capture: capture,
            disconnected: false,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected && self.transport.is_connected()
    }

    /// Send the `ID` registration for this role. With `Acknowledged` the relay must
    /// answer within the timeout; with `Delay` the caller owns the settle wait.
    pub async fn register(
        &self,
        session: &SessionToken,
        settle: &RegistrationSettle,
    ) -> Result<(), ConnectionError> {
        let payload = json!([session.as_str(), self.role.wire_name()]);

        let sent = match settle {
            RegistrationSettle::Delay { .. } => {
                self.transport.emit(REGISTRATION_EVENT, payload).await
            }
            RegistrationSettle::Acknowledged { timeout_ms } => self
                .transport
                .emit_with_ack(REGISTRATION_EVENT, payload, Duration::from_millis(*timeout_ms))
                .await
                .map(|_| ()),
        };

        sent.map_err(|e| ConnectionError::Registration {
            role: self.role,
            reason: e.to_string(),
        })?;

        info!("{} registered as '{}' in session {}", self.role, self.role.wire_name(), session);
        Ok(())
    }

    /// Fire-and-forget publish; no acknowledgement is requested
    pub async fn publish(&self, event: &str, payload: Value) -> Result<(), ConnectionError> {
        if self.disconnected {
            return Err(ConnectionError::Closed);
        }
        info!("{} publishing {}: {}", self.role, event, payload);
        self.transport.emit(event, payload).await
    }

    /// Observe one event name in addition to the capture queue
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&CapturedEvent) + Send + Sync + 'static,
    {
        self.router.on(event, handler)
    }

    /// Observe every delivery in addition to the capture queue
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&CapturedEvent) + Send + Sync + 'static,
    {
        self.router.on_any(handler)
    }

    /// Next captured delivery, waiting at most `budget`
    pub async fn pop(&mut self, budget: Duration) -> Result<CapturedEvent, CaptureError> {
        self.queue.pop(budget).await
    }

    /// Deliveries that arrived but were never asserted against
    pub fn drain_unclaimed(&mut self) -> Vec<CapturedEvent> {
        self.queue.drain()
    }

    /// Close the transport. Safe to call repeatedly; failures are logged, never returned.
    pub async fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;

        if let Err(e) = self.transport.close().await {
            warn!("{} disconnect failed: {}", self.role, e);
        }
    }
}
