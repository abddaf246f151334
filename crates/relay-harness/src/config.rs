//! Harness configuration
//!
//! Everything the harness needs to reach the relay is injected through
//! [`HarnessConfig`]: the server address, the Socket.IO endpoint path, the
//! timeouts, and how role registration is allowed to settle. Values can be loaded
//! from a TOML file; missing keys fall back to the defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Relay the harness targets when nothing else is configured
pub const DEFAULT_SERVER_URL: &str = "https://pinpoint.allenneuraldynamics-test.org:5000";

// ----------------------------------------------------------------------------
// Registration Settle Policy
// ----------------------------------------------------------------------------

/// How the harness decides both roles are registered before the first step
///
/// The production relay does not acknowledge `ID` messages, so the default is a
/// fixed settle delay. That delay is a guess: a slow relay or a distant
/// deployment may still be processing registrations when the first publish
/// goes out. Use `Acknowledged` against relays that answer the registration ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RegistrationSettle {
    /// Sleep once after both registrations were sent
    Delay { settle_ms: u64 },
    /// Require the relay to acknowledge each registration within the timeout
    Acknowledged { timeout_ms: u64 },
}

impl Default for RegistrationSettle {
    fn default() -> Self {
        RegistrationSettle::Delay { settle_ms: 2000 }
    }
}

// ----------------------------------------------------------------------------
// Harness Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Relay address; http(s) or ws(s)
    pub server_url: String,

    /// Socket.IO endpoint path on the relay
    pub socketio_path: String,

    /// Websocket + namespace handshake budget
    pub connect_timeout_ms: u64,

    /// Delivery budget for steps that do not carry their own
    pub step_timeout_ms: u64,

    /// Budget for a graceful close before the connection is dropped
    pub close_timeout_ms: u64,

    pub registration: RegistrationSettle,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            socketio_path: "/socket.io/".to_string(),
            connect_timeout_ms: 10_000,
            step_timeout_ms: 5_000,
            close_timeout_ms: 2_000,
            registration: RegistrationSettle::default(),
        }
    }
}

impl HarnessConfig {
    /// Default configuration pointed at another relay
    pub fn for_server(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Websocket endpoint for the Engine.IO transport, e.g.
    /// `wss://host:5000/socket.io/?EIO=4&transport=websocket`
    pub fn websocket_endpoint(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.server_url).map_err(|e| invalid(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot switch scheme to {}", scheme)))?;

        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }

        url.set_path(&self.socketio_path);
        url.query_pairs_mut()
            .clear()
            .append_pair("EIO", &crate::protocol::ENGINE_IO_VERSION.to_string())
            .append_pair("transport", "websocket");

        Ok(url)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.websocket_endpoint()?;

        if !self.socketio_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "socketio_path must start with '/', got '{}'",
                self.socketio_path
            )));
        }

        if self.connect_timeout_ms == 0 || self.step_timeout_ms == 0 || self.close_timeout_ms == 0 {
            return Err(ConfigError::Validation("Timeouts must be greater than 0".to_string()));
        }

        if let RegistrationSettle::Acknowledged { timeout_ms: 0 } = self.registration {
            return Err(ConfigError::Validation(
                "Registration acknowledgement timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
