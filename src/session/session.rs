use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::bgp;
use crate::config::AllowedMode;
use super::connection::Connection;
use super::io::ConnectionIo;
use super::routeing::RouteingEngine;
use super::types::{AdminState, Event, Ordinal, OrdinalCell, State};

/// Immutable OPEN payload this Session sends on every Connection, filled
/// once at construction (§5: "the OPEN payload is immutable once set").
#[derive(Debug, Clone)]
pub struct OpenTemplate {
    pub asn: u16,
    pub router_id: u32,
    pub hold_time: u16,
    pub opt_params: Vec<u8>,
}

/// One configured BGP peer: up to two racing Connections, the
/// administrative lifecycle, and the negotiated intervals mirrored from
/// whichever Connection wins (§3).
pub struct Session {
    pub peer_address: IpAddr,
    pub port: u16,
    pub allowed_modes: AllowedMode,
    pub idle_hold: u16,
    pub connect_retry: u16,
    pub open_hold: u16,
    pub hold: u16,
    pub keepalive: u16,
    pub admin_state: AdminState,
    pub connections: [Option<Connection>; 2],
    pub accept_enabled: bool,
    pub open_template: OpenTemplate,
    pub routeing: Arc<dyn RouteingEngine>,
}

impl Session {
    pub fn new(
        peer_address: IpAddr,
        port: u16,
        allowed_modes: AllowedMode,
        idle_hold: u16,
        connect_retry: u16,
        open_hold: u16,
        open_template: OpenTemplate,
        routeing: Arc<dyn RouteingEngine>,
    ) -> Self {
        Session {
            peer_address,
            port,
            allowed_modes,
            idle_hold,
            connect_retry,
            open_hold,
            hold: 0,
            keepalive: 0,
            admin_state: AdminState::Disabled,
            connections: [None, None],
            accept_enabled: false,
            open_template,
            routeing,
        }
    }

    pub fn connection(&self, ordinal: Ordinal) -> Option<&Connection> {
        self.connections[ordinal.index()].as_ref()
    }

    pub fn connection_mut(&mut self, ordinal: Ordinal) -> Option<&mut Connection> {
        self.connections[ordinal.index()].as_mut()
    }

    /// Only the secondary is ever the Established primary's sibling slot
    /// after collision resolution "promotes" the accepted Connection — see
    /// `make_primary`. Updates each surviving Connection's `ordinal_cell`
    /// in the same swap, so a pump/reader spawned against the old slot
    /// follows its Connection to the new one instead of being orphaned.
    pub fn make_primary(&mut self, ordinal: Ordinal) {
        if ordinal == Ordinal::Primary {
            return;
        }
        self.connections.swap(Ordinal::Primary.index(), Ordinal::Secondary.index());
        if let Some(conn) = self.connections[Ordinal::Primary.index()].as_mut() {
            conn.ordinal = Ordinal::Primary;
            conn.ordinal_cell.set(Ordinal::Primary);
            conn.log_target = format!("{}/{:?}", self.peer_address, Ordinal::Primary);
        }
        if let Some(conn) = self.connections[Ordinal::Secondary.index()].as_mut() {
            conn.ordinal = Ordinal::Secondary;
            conn.ordinal_cell.set(Ordinal::Secondary);
            conn.log_target = format!("{}/{:?}", self.peer_address, Ordinal::Secondary);
        }
    }
}

/// Spins up both Connection slots for a Session and raises `BGP_Start` on
/// each, per their allowed mode (§3 invariants: only primary connects,
/// only secondary accepts).
pub async fn enable_session(
    session: &Arc<Mutex<Session>>,
    primary_io: Arc<dyn ConnectionIo>,
    secondary_io: Arc<dyn ConnectionIo>,
) {
    let (tx_p, rx_p) = mpsc::channel(64);
    let (tx_s, rx_s) = mpsc::channel(64);

    let mut primary_cell = None;
    let mut secondary_cell = None;

    {
        let mut s = session.lock().await;
        let peer = s.peer_address;
        let idle_hold = s.idle_hold;
        s.admin_state = AdminState::Enabled;

        if s.allowed_modes != AllowedMode::AcceptOnly {
            let conn = Connection::new(Ordinal::Primary, peer, primary_io, tx_p.clone(), idle_hold);
            primary_cell = Some(conn.ordinal_cell.clone());
            s.connections[Ordinal::Primary.index()] = Some(conn);
        }
        if s.allowed_modes != AllowedMode::ConnectOnly {
            let conn = Connection::new(Ordinal::Secondary, peer, secondary_io, tx_s.clone(), idle_hold);
            secondary_cell = Some(conn.ordinal_cell.clone());
            s.connections[Ordinal::Secondary.index()] = Some(conn);
        }
    }

    if let Some(cell) = primary_cell.clone() {
        spawn_event_pump(session.clone(), cell, rx_p);
        let _ = tx_p.send(Event::BgpStart).await;
    }
    if let Some(cell) = secondary_cell.clone() {
        spawn_event_pump(session.clone(), cell, rx_s);
        let _ = tx_s.send(Event::BgpStart).await;
    }
}

/// Pumps one Connection's channel into `fsm::raise_event`, re-reading
/// `ordinal_cell` on every iteration rather than closing over a fixed
/// `Ordinal` — a collision-winning secondary can be promoted to primary
/// (`Session::make_primary`) long after this task starts, and every
/// event already queued or arriving afterwards on this same channel must
/// keep landing on wherever the Connection actually lives now.
pub fn spawn_event_pump(
    session: Arc<Mutex<Session>>,
    ordinal_cell: Arc<OrdinalCell>,
    mut rx: mpsc::Receiver<Event>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let ordinal = ordinal_cell.get();
            super::fsm::raise_event(&session, ordinal, event).await;
        }
    });
}

/// Administrative shutdown: throws `Disabled` against whichever
/// Connections exist. `catch_exception` handles draining both down to
/// Stopping (§8 scenario 5).
pub async fn disable_session(session: &Arc<Mutex<Session>>, notification: bgp::BGPNotificationMessage) {
    let ordinals: Vec<Ordinal> = {
        let mut s = session.lock().await;
        s.admin_state = AdminState::Stopping;
        [Ordinal::Primary, Ordinal::Secondary]
            .into_iter()
            .filter(|o| s.connection(*o).is_some())
            .collect()
    };
    for ordinal in ordinals {
        super::exception::throw(
            session,
            ordinal,
            super::types::ExceptKind::Disabled,
            Some(bgp::ErrorCode::Cease),
            Some(notification.clone()),
        )
        .await;
    }
}
