//! Session tokens, roles and publish directions

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Session Token
// ----------------------------------------------------------------------------

/// Opaque identifier pairing the two role connections on the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh, globally unique token for one run
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an externally chosen token
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Role
// ----------------------------------------------------------------------------

/// Side of the relay pairing a connection registers as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// Role name carried in the `ID` registration message
    pub fn wire_name(&self) -> &'static str {
        match self {
            Role::Sender => "send",
            Role::Receiver => "receive",
        }
    }

    /// The opposite side of the pairing
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

// ----------------------------------------------------------------------------
// Direction
// ----------------------------------------------------------------------------

/// Which role publishes and which one must observe the delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    SenderToReceiver,
    ReceiverToSender,
}

impl Direction {
    pub fn source(&self) -> Role {
        match self {
            Direction::SenderToReceiver => Role::Sender,
            Direction::ReceiverToSender => Role::Receiver,
        }
    }

    pub fn destination(&self) -> Role {
        self.source().counterpart()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source(), self.destination())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_unique() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(Role::Sender.wire_name(), "send");
        assert_eq!(Role::Receiver.wire_name(), "receive");
        assert_eq!(Role::Sender.counterpart(), Role::Receiver);
    }

    #[test]
    fn test_direction_endpoints() {
        let d = Direction::ReceiverToSender;
        assert_eq!(d.source(), Role::Receiver);
        assert_eq!(d.destination(), Role::Sender);
        assert_eq!(d.to_string(), "receiver -> sender");
    }
}
