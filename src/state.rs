//! Observable connection/protocol state (spec §3, §4.8): the lifecycle
//! FSM and the mutable, multiply-read protocol facts the engine tracks
//! across the handshake and the life of a session.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::colormap::ColorMap;
use crate::pixel::PixelFormat;
use crate::protocol::RfbVersion;
use crate::rect::Screen;

/// `Uninitialized → Connecting → Connected → (Interrupted →
/// Reconnecting → (Connected | ReconnectFailed)*) → Closed`. `Closed`
/// is terminal; `ReconnectFailed` is a transient label between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Interrupted,
    Reconnecting,
    ReconnectFailed,
    Closed,
}

/// Why a `Connected` session stopped being connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionReason {
    TransportError,
    ProtocolError,
    AuthenticationError,
    Cancelled,
    Closed,
}

/// Emitted whenever `ConnectionState` changes. `cause` carries the
/// human-readable error for `Interrupted`/`ReconnectFailed`/`Closed`
/// transitions triggered by a failure; `is_manual` distinguishes a
/// caller-initiated `close`/`force_reconnect` from one the engine
/// decided on its own.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<InterruptionReason>,
    pub cause: Option<String>,
    pub attempt_count: u32,
    pub is_manual: bool,
}

/// One mutable observable field changing, for property-changed
/// notifications.
#[derive(Debug, Clone)]
pub enum PropertyChange {
    ProtocolVersion(RfbVersion),
    SecurityType(u8),
    PixelFormat(PixelFormat),
    FramebufferSize { width: u16, height: u16 },
    ScreenLayout(Vec<Screen>),
    DesktopName(String),
    Resizable(bool),
    ContinuousUpdates(bool),
}

/// The facts the handshake and receive worker accumulate about the
/// session in progress. Guarded by a single coarse `Mutex` rather than
/// per-field locks (see `DESIGN.md`): readers never block for long
/// because the receive worker only holds the lock for the duration of
/// one field update, and a single lock keeps the "used-before-sent"
/// invariant trivially atomic.
#[derive(Debug, Clone)]
pub struct ProtocolStateSnapshot {
    pub version: Option<RfbVersion>,
    pub security_type: Option<u8>,
    pub pixel_format: PixelFormat,
    pub framebuffer_width: u16,
    pub framebuffer_height: u16,
    pub screens: Vec<Screen>,
    pub desktop_name: String,
    pub color_map: ColorMap,
    pub used_message_types: HashSet<u8>,
    pub used_encoding_types: HashSet<i32>,
    pub continuous_updates: bool,
    pub qemu_extended_key_event: bool,
    pub qemu_pointer_relative: bool,
    pub xvp_supported: bool,
    pub xvp_version: u8,
    pub extended_clipboard_formats: u32,
    pub resizable: bool,
}

impl Default for ProtocolStateSnapshot {
    fn default() -> ProtocolStateSnapshot {
        ProtocolStateSnapshot {
            version: None,
            security_type: None,
            pixel_format: PixelFormat::rgb888(),
            framebuffer_width: 0,
            framebuffer_height: 0,
            screens: Vec::new(),
            desktop_name: String::new(),
            color_map: ColorMap::new(),
            used_message_types: HashSet::new(),
            used_encoding_types: HashSet::new(),
            continuous_updates: false,
            qemu_extended_key_event: false,
            qemu_pointer_relative: false,
            xvp_supported: false,
            xvp_version: 0,
            extended_clipboard_formats: 0,
            resizable: false,
        }
    }
}

/// Owns the `Mutex` and the current `ConnectionState`, and is the only
/// thing application threads and the connection engine touch directly.
pub struct ConnectionStateMachine {
    connection_state: Mutex<ConnectionState>,
    protocol: Mutex<ProtocolStateSnapshot>,
}

impl ConnectionStateMachine {
    pub fn new() -> ConnectionStateMachine {
        ConnectionStateMachine {
            connection_state: Mutex::new(ConnectionState::Uninitialized),
            protocol: Mutex::new(ProtocolStateSnapshot::default()),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock().unwrap()
    }

    /// Transitions the connection state and returns the `StateChange`
    /// the engine should hand to registered observers. Locking is
    /// scoped to the assignment only, so observers never run with the
    /// lock held.
    pub fn transition(
        &self,
        current: ConnectionState,
        reason: Option<InterruptionReason>,
        cause: Option<String>,
        attempt_count: u32,
        is_manual: bool,
    ) -> StateChange {
        let mut guard = self.connection_state.lock().unwrap();
        let previous = *guard;
        *guard = current;
        drop(guard);
        StateChange { previous, current, reason, cause, attempt_count, is_manual }
    }

    pub fn protocol(&self) -> MutexGuard<'_, ProtocolStateSnapshot> {
        self.protocol.lock().unwrap()
    }

    /// True if `message_type` may be sent: it's either one of the
    /// always-available handshake-era messages or has already been
    /// recorded as used. Matches spec.md §3's "a message type must be
    /// present in `UsedMessageTypes` before any outgoing message of
    /// that type may be sent".
    pub fn mark_message_type_used(&self, message_type: u8) {
        self.protocol.lock().unwrap().used_message_types.insert(message_type);
    }

    pub fn message_type_is_used(&self, message_type: u8) -> bool {
        self.protocol.lock().unwrap().used_message_types.contains(&message_type)
    }

    pub fn mark_encoding_type_used(&self, encoding: i32) {
        self.protocol.lock().unwrap().used_encoding_types.insert(encoding);
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_reports_previous_and_current() {
        let fsm = ConnectionStateMachine::new();
        let change = fsm.transition(ConnectionState::Connecting, None, None, 0, true);
        assert_eq!(change.previous, ConnectionState::Uninitialized);
        assert_eq!(change.current, ConnectionState::Connecting);
        assert_eq!(fsm.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn message_type_usage_is_tracked() {
        let fsm = ConnectionStateMachine::new();
        assert!(!fsm.message_type_is_used(2));
        fsm.mark_message_type_used(2);
        assert!(fsm.message_type_is_used(2));
    }

    #[test]
    fn protocol_snapshot_starts_with_rgb888_default_format() {
        let fsm = ConnectionStateMachine::new();
        assert_eq!(fsm.protocol().pixel_format.bits_per_pixel, 32);
    }
}
