use pretty_assertions::assert_eq;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::bgp;
use crate::config::AllowedMode;
use super::connection::Connection;
use super::exception::throw;
use super::fsm::raise_event;
use super::io::{IoCall, MockIo};
use super::routeing::{ChannelRouteingEngine, RoutEngineMessage};
use super::session::{OpenTemplate, Session};
use super::types::{AdminState, Event, ExceptKind, Ordinal, State};

const LOCAL_ID: u32 = 0x0101_0101;
const PEER_ID: u32 = 0x0202_0202;
const PEER: &str = "192.0.2.1";

struct Harness {
    session: Arc<Mutex<Session>>,
    primary_io: Arc<MockIo>,
    secondary_io: Arc<MockIo>,
    routeing_rx: mpsc::Receiver<RoutEngineMessage>,
}

fn open_template() -> OpenTemplate {
    OpenTemplate {
        asn: 65000,
        router_id: LOCAL_ID,
        hold_time: 180,
        opt_params: vec![],
    }
}

fn peer_open(hold_time: u16) -> bgp::BGPOpenMessage {
    bgp::BGPOpenMessage::new(65001, PEER_ID, hold_time, vec![]).unwrap()
}

/// Builds a Session with whichever Connections `mode` implies, each
/// backed by its own `MockIo`, without going through `enable_session` —
/// tests drive `raise_event` directly so event ordering stays
/// deterministic instead of racing real tokio tasks.
fn harness(mode: AllowedMode) -> Harness {
    let peer: IpAddr = PEER.parse().unwrap();
    let (route_tx, routeing_rx) = mpsc::channel(16);
    let routeing = Arc::new(ChannelRouteingEngine::new(route_tx));

    let mut session = Session::new(
        peer,
        179,
        mode,
        4,
        120,
        240,
        open_template(),
        routeing,
    );

    let primary_io = Arc::new(MockIo::new());
    let secondary_io = Arc::new(MockIo::new());

    if mode != AllowedMode::AcceptOnly {
        let (tx, _rx) = mpsc::channel(64);
        session.connections[Ordinal::Primary.index()] =
            Some(Connection::new(Ordinal::Primary, peer, primary_io.clone(), tx, 1));
    }
    if mode != AllowedMode::ConnectOnly {
        let (tx, _rx) = mpsc::channel(64);
        session.connections[Ordinal::Secondary.index()] =
            Some(Connection::new(Ordinal::Secondary, peer, secondary_io.clone(), tx, 1));
    }

    Harness {
        session: Arc::new(Mutex::new(session)),
        primary_io,
        secondary_io,
        routeing_rx,
    }
}

async fn state_of(session: &Arc<Mutex<Session>>, ordinal: Ordinal) -> State {
    session.lock().await.connection(ordinal).unwrap().state
}

struct PumpedHarness {
    session: Arc<Mutex<Session>>,
    tx_primary: mpsc::Sender<Event>,
    tx_secondary: mpsc::Sender<Event>,
    routeing_rx: mpsc::Receiver<RoutEngineMessage>,
}

/// Like `harness`, but wires both Connections through REAL event pumps
/// (`session::spawn_event_pump`, keyed off each Connection's
/// `ordinal_cell`) instead of driving `raise_event` directly. Only the
/// promotion-routing test below needs this — every other test in this
/// file can assume deterministic, unpumped ordering.
fn pumped_harness(mode: AllowedMode) -> PumpedHarness {
    let peer: IpAddr = PEER.parse().unwrap();
    let (route_tx, routeing_rx) = mpsc::channel(16);
    let routeing = Arc::new(ChannelRouteingEngine::new(route_tx));

    let mut session = Session::new(peer, 179, mode, 4, 120, 240, open_template(), routeing);

    let (tx_primary, rx_primary) = mpsc::channel(64);
    let (tx_secondary, rx_secondary) = mpsc::channel(64);

    let primary_conn = Connection::new(Ordinal::Primary, peer, Arc::new(MockIo::new()), tx_primary.clone(), 1);
    let primary_cell = primary_conn.ordinal_cell.clone();
    session.connections[Ordinal::Primary.index()] = Some(primary_conn);

    let secondary_conn = Connection::new(Ordinal::Secondary, peer, Arc::new(MockIo::new()), tx_secondary.clone(), 1);
    let secondary_cell = secondary_conn.ordinal_cell.clone();
    session.connections[Ordinal::Secondary.index()] = Some(secondary_conn);

    let session = Arc::new(Mutex::new(session));
    super::session::spawn_event_pump(session.clone(), primary_cell, rx_primary);
    super::session::spawn_event_pump(session.clone(), secondary_cell, rx_secondary);

    PumpedHarness {
        session,
        tx_primary,
        tx_secondary,
        routeing_rx,
    }
}

/// Sends an event over a Connection's own channel and gives its spawned
/// pump a moment to actually run — unlike `raise_event`, sending over a
/// channel only enqueues the event.
async fn send_and_settle(tx: &mpsc::Sender<Event>, event: Event) {
    tx.send(event).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

/// Scenario 1: happy path, connect-only session.
#[tokio::test]
async fn test_happy_path_connect_only() {
    let h = harness(AllowedMode::ConnectOnly);

    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Idle);

    // IdleHoldTimer firing is modelled as another BGP_Start on this Connection.
    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Connect);
    assert!(h
        .primary_io
        .calls()
        .await
        .iter()
        .any(|c| matches!(c, IoCall::Connect(_))));

    raise_event(&h.session, Ordinal::Primary, Event::TcpConnectionOpen).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::OpenSent);
    assert!(h.primary_io.calls().await.contains(&IoCall::EnableRead));
    assert!(h
        .primary_io
        .calls()
        .await
        .iter()
        .any(|c| matches!(c, IoCall::WriteOpen(_))));

    raise_event(&h.session, Ordinal::Primary, Event::ReceiveOpen(peer_open(180))).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::OpenConfirm);
    assert!(h.primary_io.calls().await.contains(&IoCall::WriteKeepalive));

    raise_event(&h.session, Ordinal::Primary, Event::ReceiveKeepalive).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Established);

    let session = h.session.lock().await;
    assert_eq!(session.admin_state, AdminState::Established);
    assert_eq!(session.hold, 180);
    assert_eq!(session.keepalive, 60);
    drop(session);

    let mut rx = h.routeing_rx;
    let RoutEngineMessage::SessionEvent(_, ev) = rx.try_recv().unwrap() else {
        panic!("expected a SessionEvent");
    };
    assert_eq!(ev.kind, ExceptKind::Established);
    assert!(!ev.stopped);
}

/// Scenario 2: both connections reach OpenSent; the one whose local
/// BGP identifier loses the comparison falls back to Idle with a
/// Cease/Collision NOTIFICATION, the other proceeds to OpenConfirm.
#[tokio::test]
async fn test_collision_primary_loses() {
    let h = harness(AllowedMode::Both);

    for ordinal in [Ordinal::Primary, Ordinal::Secondary] {
        raise_event(&h.session, ordinal, Event::BgpStart).await;
        raise_event(&h.session, ordinal, Event::BgpStart).await;
        raise_event(&h.session, ordinal, Event::TcpConnectionOpen).await;
        assert_eq!(state_of(&h.session, ordinal).await, State::OpenSent);
    }

    // Secondary's OPEN arrives first and it is not yet racing a sibling
    // already in OpenConfirm, so it proceeds cleanly.
    raise_event(&h.session, Ordinal::Secondary, Event::ReceiveOpen(peer_open(180))).await;
    assert_eq!(state_of(&h.session, Ordinal::Secondary).await, State::OpenConfirm);

    // Primary's OPEN arrives once the sibling is already in OpenConfirm:
    // local id 0x01010101 < peer id 0x02020202, so Primary is the loser.
    raise_event(&h.session, Ordinal::Primary, Event::ReceiveOpen(peer_open(180))).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::OpenSent);
    assert!(h
        .primary_io
        .calls()
        .await
        .iter()
        .any(|c| matches!(c, IoCall::WriteNotification(_))));

    // The courtesy HoldTimer firing finalizes the fall to Idle.
    raise_event(&h.session, Ordinal::Primary, Event::HoldTimerExpired).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Idle);

    // Secondary was never touched by the collision and stays put.
    assert_eq!(state_of(&h.session, Ordinal::Secondary).await, State::OpenConfirm);
}

/// Regression test for routing across collision promotion: drives the
/// FSM through real event pumps (not direct `raise_event` calls), forces
/// the *secondary* leg to be the collision winner, then delivers a
/// post-Established KEEPALIVE and UPDATE over the winner's own channel —
/// the one its pump was spawned against back when it still lived in the
/// Secondary slot. `Session::make_primary` swaps it into the Primary
/// slot on establishment; the pump must keep following it there instead
/// of going on addressing the now-stale or now-empty Secondary slot.
#[tokio::test]
async fn test_secondary_promotion_routes_through_own_pump() {
    let mut h = pumped_harness(AllowedMode::Both);

    for tx in [&h.tx_primary, &h.tx_secondary] {
        send_and_settle(tx, Event::BgpStart).await;
        send_and_settle(tx, Event::BgpStart).await;
        send_and_settle(tx, Event::TcpConnectionOpen).await;
    }
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::OpenSent);
    assert_eq!(state_of(&h.session, Ordinal::Secondary).await, State::OpenSent);

    // Primary's OPEN is processed first, reaching OpenConfirm...
    send_and_settle(&h.tx_primary, Event::ReceiveOpen(peer_open(180))).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::OpenConfirm);

    // ...then Secondary's OPEN arrives with Primary already in
    // OpenConfirm. local id 0x01010101 < peer id 0x02020202 still makes
    // Primary the loser, so Secondary — the second to process its OPEN —
    // is the collision winner this time (the reverse of
    // `test_collision_primary_loses`, where Secondary reached
    // OpenConfirm first and Primary lost).
    send_and_settle(&h.tx_secondary, Event::ReceiveOpen(peer_open(180))).await;
    assert_eq!(state_of(&h.session, Ordinal::Secondary).await, State::OpenConfirm);

    // Secondary receives KEEPALIVE and establishes; `establish` calls
    // `make_primary`, swapping it into the Primary slot (and swapping the
    // demoted ex-Primary down into the Secondary slot — `make_primary`
    // never empties a slot by itself, it only exchanges the two).
    send_and_settle(&h.tx_secondary, Event::ReceiveKeepalive).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Established);
    while h.routeing_rx.try_recv().is_ok() {}

    // The winner now lives in the Primary slot, but its pump is still
    // reading from `tx_secondary` — deliver a post-Established KEEPALIVE
    // over that same channel, exactly as its real socket reader would.
    send_and_settle(&h.tx_secondary, Event::ReceiveKeepalive).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Established);

    // And an UPDATE the same way — it must reach the Established
    // Connection's `recv_traffic` action (forwarded to the routeing
    // engine, Hold timer re-armed), not be dropped onto a stale or empty
    // Secondary slot the way a fixed-ordinal pump would leave it.
    let update = bgp::BGPUpdateMessage { body: vec![1, 2, 3] };
    send_and_settle(&h.tx_secondary, Event::ReceiveUpdate(update)).await;

    let RoutEngineMessage::SessionUpdate(_, got) = h.routeing_rx.try_recv().unwrap() else {
        panic!("expected a SessionUpdate to have reached the routeing engine");
    };
    assert_eq!(got.body, vec![1, 2, 3]);

    let session = h.session.lock().await;
    let conn = session.connection(Ordinal::Primary).unwrap();
    assert_eq!(conn.state, State::Established);
    assert!(conn.hold_timer.is_some());
}

/// Scenario 3: peer refuses the TCP connect; `failed` leaves Connect in
/// place, and the ConnectRetryTimer firing later drives `retry`.
#[tokio::test]
async fn test_peer_refuses_then_retries() {
    let h = harness(AllowedMode::ConnectOnly);

    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Connect);

    raise_event(&h.session, Ordinal::Primary, Event::TcpConnectionOpenFailed).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Connect);
    assert!(h.primary_io.calls().await.contains(&IoCall::Close));

    raise_event(&h.session, Ordinal::Primary, Event::ConnectRetryTimerExpired).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Connect);
    let calls = h.primary_io.calls().await;
    assert_eq!(calls.iter().filter(|c| matches!(c, IoCall::Connect(_))).count(), 2);
}

/// Scenario 4: the peer drops an Established session; the Connection
/// goes to Stopping and a reportable session event is emitted.
#[tokio::test]
async fn test_established_peer_drop() {
    let h = harness(AllowedMode::ConnectOnly);
    drive_to_established(&h).await;
    let mut rx = h.routeing_rx;
    while rx.try_recv().is_ok() {}

    raise_event(&h.session, Ordinal::Primary, Event::TcpConnectionClosed).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Stopping);

    let RoutEngineMessage::SessionEvent(_, ev) = rx.try_recv().unwrap() else {
        panic!("expected a SessionEvent");
    };
    assert_eq!(ev.kind, ExceptKind::TcpDropped);
    assert!(ev.stopped);

    raise_event(&h.session, Ordinal::Primary, Event::HoldTimerExpired).await;
    assert!(h.session.lock().await.connection(Ordinal::Primary).is_none());
}

/// Scenario 5: administrative disable mid-OpenSent drains both
/// Connections through a NOTIFICATION/courtesy-HoldTimer round trip and
/// out of existence.
#[tokio::test]
async fn test_administrative_disable_mid_opensent() {
    let h = harness(AllowedMode::Both);
    for ordinal in [Ordinal::Primary, Ordinal::Secondary] {
        raise_event(&h.session, ordinal, Event::BgpStart).await;
        raise_event(&h.session, ordinal, Event::BgpStart).await;
        raise_event(&h.session, ordinal, Event::TcpConnectionOpen).await;
    }
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::OpenSent);
    assert_eq!(state_of(&h.session, Ordinal::Secondary).await, State::OpenSent);

    let shutdown = bgp::BGPNotificationMessage::new(
        bgp::ErrorCode::Cease,
        bgp::CeaseSubCode::AdministrativeShutdown as u8,
    )
    .unwrap();
    throw(
        &h.session,
        Ordinal::Primary,
        ExceptKind::Disabled,
        Some(bgp::ErrorCode::Cease),
        Some(shutdown),
    )
    .await;

    // An intended-Stopping target isn't held back waiting for drain the
    // way a courtesy fallback to Idle/Active is — Primary is already in
    // Stopping, mid courtesy HoldTimer, by the time `throw` returns.
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Stopping);
    assert!(h
        .primary_io
        .calls()
        .await
        .iter()
        .any(|c| matches!(c, IoCall::WriteNotification(_))));

    // The sibling was handed its own Discard/BGP_Stop on its own channel
    // rather than mutated directly; deliver it the way its event pump
    // would.
    raise_event(&h.session, Ordinal::Secondary, Event::BgpStop).await;
    assert_eq!(state_of(&h.session, Ordinal::Secondary).await, State::Stopping);
    assert!(h
        .secondary_io
        .calls()
        .await
        .iter()
        .any(|c| matches!(c, IoCall::WriteNotification(_))));

    raise_event(&h.session, Ordinal::Primary, Event::HoldTimerExpired).await;
    raise_event(&h.session, Ordinal::Secondary, Event::HoldTimerExpired).await;
    let session = h.session.lock().await;
    assert!(session.connection(Ordinal::Primary).is_none());
    assert!(session.connection(Ordinal::Secondary).is_none());
}

async fn drive_to_established(h: &Harness) {
    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    raise_event(&h.session, Ordinal::Primary, Event::TcpConnectionOpen).await;
    raise_event(&h.session, Ordinal::Primary, Event::ReceiveOpen(peer_open(180))).await;
    raise_event(&h.session, Ordinal::Primary, Event::ReceiveKeepalive).await;
    assert_eq!(state_of(&h.session, Ordinal::Primary).await, State::Established);
}

/// §8 invariant: at most one Connection reaches Established, and the
/// Session mirrors negotiated Hold=0 as "never arm the timers".
#[tokio::test]
async fn test_zero_hold_time_disables_timers() {
    let h = harness(AllowedMode::ConnectOnly);
    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    raise_event(&h.session, Ordinal::Primary, Event::TcpConnectionOpen).await;
    raise_event(&h.session, Ordinal::Primary, Event::ReceiveOpen(peer_open(0))).await;

    let session = h.session.lock().await;
    let conn = session.connection(Ordinal::Primary).unwrap();
    assert_eq!(conn.hold_interval, 0);
    assert_eq!(conn.keepalive_interval, 0);
    assert!(conn.hold_timer.is_none());
    assert!(conn.keepalive_timer.is_none());
}

/// §8 invariant: `fsm_active` always returns to zero once `raise_event`
/// returns, even across the deferred re-entry chain a NOTIFICATION send
/// triggers.
#[tokio::test]
async fn test_fsm_active_returns_to_zero() {
    let h = harness(AllowedMode::ConnectOnly);
    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    raise_event(&h.session, Ordinal::Primary, Event::BgpStart).await;
    raise_event(&h.session, Ordinal::Primary, Event::TcpConnectionOpen).await;
    raise_event(&h.session, Ordinal::Primary, Event::ReceiveOpen(peer_open(180))).await;
    raise_event(&h.session, Ordinal::Primary, Event::ReceiveKeepalive).await;

    let session = h.session.lock().await;
    assert_eq!(session.connection(Ordinal::Primary).unwrap().fsm_active, 0);
}
