//! Relay routing table
//!
//! The relay forwards a fixed set of reserved event names from receivers to
//! senders; every other name is broadcast from senders to receivers. A step
//! published against this table can never be delivered, so scenarios are
//! checked against it before a run.

use crate::session::Direction;

/// Events the relay routes receiver -> sender
pub const RECEIVER_TO_SENDER_EVENTS: &[&str] = &[
    "CameraImgMeta",
    "CameraImg",
    "ReceiveCameraImgMeta",
    "ReceiveCameraImg",
    "NeuronCallback",
    "log",
    "log-warning",
    "log-error",
    "urchin-loaded-callback",
    "urchin-dock-callback",
];

/// Names the relay consumes itself and never forwards
pub const CONTROL_EVENTS: &[&str] = &["connection", "connect", "disconnect", "ID"];

/// Direction the relay forwards `event` in, or `None` for control names
pub fn relay_direction(event: &str) -> Option<Direction> {
    if CONTROL_EVENTS.contains(&event) {
        None
    } else if RECEIVER_TO_SENDER_EVENTS.contains(&event) {
        Some(Direction::ReceiverToSender)
    } else {
        Some(Direction::SenderToReceiver)
    }
}
