use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::bgp;
use super::io::ConnectionIo;
use super::timers::Timer;
use super::types::{Event, Exception, Ordinal, OrdinalCell, State};

/// One TCP peering attempt. Lives inside `Session::connections[ordinal]`;
/// there is no owning back-pointer to the Session — callers always reach
/// a Connection through the Session they already hold locked, and the
/// "sibling" is just `session.connections[ordinal.other()]` (§9).
pub struct Connection {
    pub ordinal: Ordinal,
    /// Shared with this Connection's event pump and socket reader, which
    /// are spawned once and outlive any later `Session::make_primary`
    /// swap. Clone it out before moving the Connection into
    /// `Session::connections` so those tasks always resolve the slot it
    /// currently lives at, not the one it was created in.
    pub ordinal_cell: Arc<OrdinalCell>,
    pub state: State,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub open_recv: Option<bgp::BGPOpenMessage>,
    pub hold_interval: u16,
    pub keepalive_interval: u16,
    pub idle_hold_interval: u16,
    pub hold_timer: Option<Timer>,
    pub keepalive_timer: Option<Timer>,
    pub pending_exception: Option<Exception>,
    pub notification_pending: bool,
    pub comatose: bool,
    pub fsm_active: u8,
    pub deferred_event: Option<Event>,
    pub io: Arc<dyn ConnectionIo>,
    pub tx: mpsc::Sender<Event>,
    pub log_target: String,
}

impl Connection {
    pub fn new(
        ordinal: Ordinal,
        peer: std::net::IpAddr,
        io: Arc<dyn ConnectionIo>,
        tx: mpsc::Sender<Event>,
        idle_hold_interval: u16,
    ) -> Self {
        Connection {
            ordinal,
            ordinal_cell: Arc::new(OrdinalCell::new(ordinal)),
            state: State::Initial,
            local_addr: None,
            remote_addr: None,
            open_recv: None,
            hold_interval: 0,
            keepalive_interval: 0,
            idle_hold_interval,
            hold_timer: None,
            keepalive_timer: None,
            pending_exception: None,
            notification_pending: false,
            comatose: false,
            fsm_active: 0,
            deferred_event: None,
            io,
            tx,
            log_target: format!("{}/{:?}", peer, ordinal),
        }
    }
}
