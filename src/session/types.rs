use std::sync::atomic::{AtomicU8, Ordering};

use crate::bgp;

/// Which slot of `Session::connections` a `Connection` occupies. The
/// primary is always the outbound-connect leg, the secondary the
/// inbound-accept leg — never the reverse, and a Session never runs two
/// Connections in the same ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ordinal {
    Primary,
    Secondary,
}

impl Ordinal {
    pub fn other(self) -> Ordinal {
        match self {
            Ordinal::Primary => Ordinal::Secondary,
            Ordinal::Secondary => Ordinal::Primary,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Ordinal::Primary => 0,
            Ordinal::Secondary => 1,
        }
    }

    fn from_index(index: u8) -> Ordinal {
        match index {
            0 => Ordinal::Primary,
            _ => Ordinal::Secondary,
        }
    }
}

/// A `Connection`'s current slot, shared between the `Session` that owns
/// it and whatever long-lived task (event pump, socket reader) was
/// spawned for it. `Session::make_primary` swaps which array slot a
/// winning Connection occupies *after* its pump/reader are already
/// running; those tasks hold a clone of this cell instead of a bare
/// `Ordinal` captured at spawn time, so they keep addressing the right
/// slot across a mid-flight promotion (§8 scenario 2).
#[derive(Debug)]
pub struct OrdinalCell(AtomicU8);

impl OrdinalCell {
    pub fn new(ordinal: Ordinal) -> Self {
        OrdinalCell(AtomicU8::new(ordinal.index() as u8))
    }

    pub fn get(&self) -> Ordinal {
        Ordinal::from_index(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, ordinal: Ordinal) {
        self.0.store(ordinal.index() as u8, Ordering::SeqCst);
    }
}

/// RFC 4271 §8.2.1 FSM states, plus `Initial` (pre-Idle, set once at
/// Connection construction) and `Stopping` (this design's terminal
/// teardown state, covering the NOTIFICATION-drain window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Initial,
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
    Stopping,
}

/// Events the dispatcher accepts. `Null` is a no-op placeholder event used
/// when an action wants to re-enter `raise_event` without actually raising
/// anything (e.g. to drain a deferred slot).
#[derive(Debug, Clone)]
pub enum Event {
    Null,
    BgpStart,
    BgpStop,
    TcpConnectionOpen,
    TcpConnectionClosed,
    TcpConnectionOpenFailed,
    TcpFatalError,
    ConnectRetryTimerExpired,
    HoldTimerExpired,
    KeepaliveTimerExpired,
    ReceiveOpen(bgp::BGPOpenMessage),
    ReceiveKeepalive,
    ReceiveUpdate(bgp::BGPUpdateMessage),
    ReceiveNotification(bgp::BGPNotificationMessage),
    SentNotification,
}

/// Administrative lifecycle of a Session, as distinct from the FSM state of
/// its Connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdminState {
    #[default]
    Disabled,
    Enabled,
    Established,
    Stopping,
}

/// The reason a Connection is being torn down or rewound to Idle. Every
/// kind except `Discard` and `Collision` is reported to the Routeing
/// Engine (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptKind {
    Disabled,
    Discard,
    Collision,
    NomRecv,
    TcpDropped,
    TcpFailed,
    TcpError,
    FsmError,
    Expired,
    Invalid,
    Retry,
    Established,
}

impl ExceptKind {
    pub fn reportable(self) -> bool {
        !matches!(self, ExceptKind::Discard | ExceptKind::Collision)
    }
}

/// The pending-exception slot on a Connection: `post` fills it, the
/// dispatcher drains and reports it on the way out of `raise_event`.
#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: ExceptKind,
    pub error_code: Option<bgp::ErrorCode>,
    pub notification: Option<bgp::BGPNotificationMessage>,
}

impl Exception {
    pub fn new(kind: ExceptKind) -> Self {
        Exception {
            kind,
            error_code: None,
            notification: None,
        }
    }

    pub fn with_notification(
        kind: ExceptKind,
        error_code: bgp::ErrorCode,
        notification: bgp::BGPNotificationMessage,
    ) -> Self {
        Exception {
            kind,
            error_code: Some(error_code),
            notification: Some(notification),
        }
    }
}

/// What `raise_event` reports to the Routeing Engine on the way out, once
/// per dispatch, only for reportable exception kinds (§4.1 step 5).
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub kind: ExceptKind,
    pub notification: Option<bgp::BGPNotificationMessage>,
    pub ordinal: Ordinal,
    pub stopped: bool,
}
