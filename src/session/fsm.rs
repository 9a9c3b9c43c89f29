use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::bgp;
use super::exception::{catch_exception, post};
use super::session::Session;
use super::timers::{Timer, COURTESY_HOLD, STOPPING_HOLD};
use super::types::{AdminState, Event, ExceptKind, Ordinal, SessionEvent, State};

/// The single entry point every external stimulus (timer fire, I/O
/// completion, administrative command) calls. Takes the session mutex,
/// dispatches to completion (including any deferred re-entry), and
/// reports a session-level event on the way out (§4.1).
pub async fn raise_event(session: &Arc<Mutex<Session>>, ordinal: Ordinal, event: Event) {
    let mut guard = session.lock().await;
    let Some(conn) = guard.connection(ordinal) else {
        log::debug!("{:?}: {:?} dropped, no connection in that slot", ordinal, event);
        return;
    };
    log::debug!("{}: FSM received {:?}", conn.log_target, event);
    dispatch(&mut guard, ordinal, event).await;
}

async fn dispatch(session: &mut Session, mut ordinal: Ordinal, mut event: Event) {
    loop {
        if let Some(conn) = session.connection_mut(ordinal) {
            conn.fsm_active += 1;
        } else {
            return;
        }

        let prev_state = match session.connection(ordinal) {
            Some(c) => c.state,
            None => return,
        };

        let (next_state, new_ordinal) = step(session, ordinal, prev_state, event).await;
        ordinal = new_ordinal;

        let to_report = if let Some(conn) = session.connection_mut(ordinal) {
            conn.fsm_active -= 1;
            if next_state != prev_state {
                log::info!("{}: FSM {:?} -> {:?}", conn.log_target, prev_state, next_state);
                conn.state = next_state;
            }
            conn.pending_exception.take()
        } else {
            None
        };

        if let Some(exc) = to_report {
            if exc.kind.reportable() && exc.kind != ExceptKind::Retry {
                let peer = session.peer_address;
                log::debug!("{:?}: reporting {:?} to routeing engine (stopped={})", ordinal, exc.kind, next_state == State::Stopping);
                session
                    .routeing
                    .session_event(
                        peer,
                        SessionEvent {
                            kind: exc.kind,
                            notification: exc.notification,
                            ordinal,
                            stopped: next_state == State::Stopping,
                        },
                    )
                    .await;
            }
        }

        if next_state != prev_state {
            on_state_change(session, ordinal, prev_state, next_state).await;
        }
        recompute_accept_enabled(session);

        let deferred = match session.connection_mut(ordinal) {
            Some(conn) if conn.fsm_active == 0 => conn.deferred_event.take(),
            _ => None,
        };
        match deferred {
            Some(ev) => {
                log::debug!("{:?}: draining deferred event {:?}", ordinal, ev);
                event = ev;
                continue;
            }
            None => return,
        }
    }
}

/// The (state, event) action table. Returns the next state and the
/// ordinal the Connection now lives at — unchanged for every action
/// except `establish`, which promotes the winner to primary.
async fn step(session: &mut Session, ordinal: Ordinal, state: State, event: Event) -> (State, Ordinal) {
    use Event::*;
    use State::*;

    match (state, event) {
        (Initial, BgpStart) => (enter(session, ordinal).await, ordinal),
        (Idle, BgpStart) => (start(session, ordinal).await, ordinal),

        (Connect, TcpConnectionOpen) | (Active, TcpConnectionOpen) => {
            (send_open(session, ordinal).await, ordinal)
        }
        (Connect, TcpConnectionOpenFailed) | (Active, TcpConnectionOpenFailed) => {
            (failed(session, ordinal).await, ordinal)
        }
        (Connect, ConnectRetryTimerExpired) | (Active, ConnectRetryTimerExpired) => {
            (retry(session, ordinal).await, ordinal)
        }

        (OpenSent, ReceiveOpen(open)) => (recv_open(session, ordinal, open).await, ordinal),
        (OpenSent, ReceiveKeepalive) | (OpenSent, ReceiveUpdate(_)) => {
            (fsm_error(session, ordinal, state).await, ordinal)
        }
        (Established, ReceiveOpen(_)) => (fsm_error(session, ordinal, state).await, ordinal),

        (OpenSent, TcpConnectionClosed) | (OpenConfirm, TcpConnectionClosed) | (Established, TcpConnectionClosed) => {
            (closed(session, ordinal, state).await, ordinal)
        }
        (OpenSent, HoldTimerExpired)
        | (OpenConfirm, HoldTimerExpired)
        | (Established, HoldTimerExpired) => (expire(session, ordinal, state).await, ordinal),

        (OpenConfirm, ReceiveKeepalive) => establish(session, ordinal).await,
        (OpenConfirm, KeepaliveTimerExpired) | (Established, KeepaliveTimerExpired) => {
            (send_kal(session, ordinal).await, ordinal)
        }
        (Established, ReceiveUpdate(update)) => (recv_traffic(session, ordinal, Some(update)).await, ordinal),
        (Established, ReceiveKeepalive) => (recv_traffic(session, ordinal, None).await, ordinal),

        (_, ReceiveNotification(notif)) => (recv_notification(session, ordinal, state, notif).await, ordinal),
        (_, TcpFatalError) => (fatal(session, ordinal, state).await, ordinal),
        (_, BgpStop) => (stop(session, ordinal, state).await, ordinal),

        (Stopping, SentNotification) => (sent_notification(session, ordinal).await, ordinal),
        (Stopping, HoldTimerExpired)
        | (Stopping, TcpConnectionClosed)
        | (Stopping, TcpConnectionOpenFailed) => (exit(session, ordinal).await, ordinal),

        (s, SentNotification) if matches!(s, OpenSent | OpenConfirm | Established) => {
            (sent_notification_open(session, ordinal, s).await, ordinal)
        }

        (Null, _) | (_, Null) => (state, ordinal),

        _ => (invalid(session, ordinal).await, ordinal),
    }
}

// --- §4.2 start / send-open / retry -----------------------------------

async fn enter(session: &mut Session, ordinal: Ordinal) -> State {
    let interval = session
        .connection(ordinal)
        .map(|c| c.idle_hold_interval.max(super::timers::IDLE_HOLD_INITIAL))
        .unwrap_or(super::timers::IDLE_HOLD_INITIAL);
    if let Some(conn) = session.connection_mut(ordinal) {
        conn.idle_hold_interval = interval;
        log::debug!("{}: arming IdleHoldTimer for {}s", conn.log_target, interval);
        conn.hold_timer = Some(Timer::arm(interval, true, conn.tx.clone(), Event::BgpStart));
    }
    State::Idle
}

async fn start(session: &mut Session, ordinal: Ordinal) -> State {
    match ordinal {
        Ordinal::Primary => {
            let addr = SocketAddr::new(session.peer_address, session.port);
            let io = match session.connection(ordinal) {
                Some(c) => c.io.clone(),
                None => return State::Connect,
            };
            log::debug!("{:?}: dialing {}", ordinal, addr);
            let result = io.connect(addr).await;
            if let Some(conn) = session.connection_mut(ordinal) {
                conn.remote_addr = Some(addr);
                if let Err(err) = result {
                    let class = super::io::classify_io_error(&err, true);
                    log::warn!("{}: connect to {} failed: {}", conn.log_target, addr, err);
                    conn.deferred_event = Some(match class {
                        super::io::IoErrorClass::Hard => Event::TcpFatalError,
                        _ => Event::TcpConnectionOpenFailed,
                    });
                }
            }
            State::Connect
        }
        Ordinal::Secondary => {
            log::debug!("{:?}: Idle to Active, accept enabled", ordinal);
            session.accept_enabled = true;
            State::Active
        }
    }
}

async fn send_open(session: &mut Session, ordinal: Ordinal) -> State {
    let io = match session.connection(ordinal) {
        Some(c) => c.io.clone(),
        None => return State::OpenSent,
    };
    io.enable_read().await;

    let msg = bgp::BGPOpenMessage::new(
        session.open_template.asn,
        session.open_template.router_id,
        session.open_template.hold_time,
        session.open_template.opt_params.clone(),
    )
    .expect("open message always builds");

    let result = io.write_open(msg).await;
    if let Err(err) = result {
        let class = super::io::classify_io_error(&err, false);
        if let Some(conn) = session.connection_mut(ordinal) {
            log::warn!("{}: write OPEN failed: {}", conn.log_target, err);
            conn.deferred_event = Some(match class {
                super::io::IoErrorClass::Hard => Event::TcpFatalError,
                _ => Event::TcpConnectionClosed,
            });
        }
    } else if let Some(conn) = session.connection(ordinal) {
        log::debug!("{}: sent OPEN", conn.log_target);
    }
    State::OpenSent
}

async fn failed(session: &mut Session, ordinal: Ordinal) -> State {
    let current = match session.connection(ordinal) {
        Some(c) => c.state,
        None => return State::Connect,
    };
    if let Some(conn) = session.connection(ordinal) {
        log::debug!("{}: TCP open failed, closing and arming ConnectRetryTimer", conn.log_target);
        conn.io.close().await;
    }
    let retry_interval = session.connect_retry;
    if let Some(conn) = session.connection_mut(ordinal) {
        conn.hold_timer = Some(Timer::arm(
            retry_interval,
            true,
            conn.tx.clone(),
            Event::ConnectRetryTimerExpired,
        ));
    }
    current
}

async fn retry(session: &mut Session, ordinal: Ordinal) -> State {
    if let Some(conn) = session.connection(ordinal) {
        log::debug!("{}: ConnectRetryTimer expired, retrying", conn.log_target);
        conn.io.close().await;
    }
    post(session, ordinal, ExceptKind::Retry, None, None);
    start(session, ordinal).await
}

// --- §4.4 collision resolution / establishment ------------------------

fn collision_notification() -> bgp::BGPNotificationMessage {
    bgp::BGPNotificationMessage::new(
        bgp::ErrorCode::Cease,
        bgp::CeaseSubCode::ConnectionCollisionResolution as u8,
    )
    .expect("notification message always builds")
}

async fn recv_open(session: &mut Session, ordinal: Ordinal, open: bgp::BGPOpenMessage) -> State {
    let local_hold = session.open_template.hold_time;
    let peer_hold = open.hold_time;
    let negotiated_hold = local_hold.min(peer_hold);
    let negotiated_keepalive = if negotiated_hold == 0 { 0 } else { negotiated_hold / 3 };

    let sibling = ordinal.other();
    let sibling_in_open_confirm = session
        .connection(sibling)
        .map(|c| c.state == State::OpenConfirm)
        .unwrap_or(false);

    if let Some(conn) = session.connection_mut(ordinal) {
        conn.open_recv = Some(open.clone());
        conn.hold_interval = negotiated_hold;
        conn.keepalive_interval = negotiated_keepalive;
    }

    if sibling_in_open_confirm {
        let local_id = session.open_template.router_id;
        let peer_id = open.router_id;
        let loser = if local_id < peer_id { Ordinal::Primary } else { Ordinal::Secondary };
        log::info!("{:?}: collision with {:?}, loser is {:?}", ordinal, sibling, loser);

        if ordinal == loser {
            post(
                session,
                ordinal,
                ExceptKind::Collision,
                Some(bgp::ErrorCode::Cease),
                Some(collision_notification()),
            );
            return catch_exception(session, ordinal, State::Idle).await;
        }

        post(
            session,
            sibling,
            ExceptKind::Collision,
            Some(bgp::ErrorCode::Cease),
            Some(collision_notification()),
        );
        if let Some(sib) = session.connection(sibling) {
            log::debug!("{}: discarding loser of collision", sib.log_target);
            let tx = sib.tx.clone();
            let _ = tx.send(Event::BgpStop).await;
        }
    }

    send_keepalive_ack(session, ordinal).await
}

async fn send_keepalive_ack(session: &mut Session, ordinal: Ordinal) -> State {
    let io = match session.connection(ordinal) {
        Some(c) => c.io.clone(),
        None => return State::OpenConfirm,
    };
    if let Err(err) = io.write_keepalive().await {
        let class = super::io::classify_io_error(&err, false);
        if let Some(conn) = session.connection_mut(ordinal) {
            log::warn!("{}: write KEEPALIVE failed: {}", conn.log_target, err);
            conn.deferred_event = Some(match class {
                super::io::IoErrorClass::Hard => Event::TcpFatalError,
                _ => Event::TcpConnectionClosed,
            });
        }
    }
    State::OpenConfirm
}

async fn establish(session: &mut Session, ordinal: Ordinal) -> (State, Ordinal) {
    let sibling = ordinal.other();
    if session.connection(sibling).is_some() {
        post(
            session,
            sibling,
            ExceptKind::Discard,
            Some(bgp::ErrorCode::Cease),
            Some(collision_notification()),
        );
        if let Some(sib) = session.connection(sibling) {
            log::debug!("{}: discarding sibling of newly-established connection", sib.log_target);
            let tx = sib.tx.clone();
            let _ = tx.send(Event::BgpStop).await;
        }
    }

    let was_secondary = ordinal == Ordinal::Secondary;
    session.make_primary(ordinal);
    if was_secondary {
        log::info!("{:?}: collision winner promoted to primary slot", Ordinal::Primary);
    }
    if let Some(conn) = session.connection(Ordinal::Primary) {
        session.hold = conn.hold_interval;
        session.keepalive = conn.keepalive_interval;
        log::info!(
            "{}: Established (hold={}s, keepalive={}s)",
            conn.log_target,
            session.hold,
            session.keepalive
        );
    }
    session.admin_state = AdminState::Established;
    post(session, Ordinal::Primary, ExceptKind::Established, None, None);

    (State::Established, Ordinal::Primary)
}

async fn send_kal(session: &mut Session, ordinal: Ordinal) -> State {
    let current = match session.connection(ordinal) {
        Some(c) => c.state,
        None => return State::OpenConfirm,
    };
    let io = session.connection(ordinal).unwrap().io.clone();
    if let Err(err) = io.write_keepalive().await {
        let class = super::io::classify_io_error(&err, false);
        if let Some(conn) = session.connection_mut(ordinal) {
            log::warn!("{}: write KEEPALIVE failed: {}", conn.log_target, err);
            conn.deferred_event = Some(match class {
                super::io::IoErrorClass::Hard => Event::TcpFatalError,
                _ => Event::TcpConnectionClosed,
            });
        }
    }
    let interval = session.connection(ordinal).map(|c| c.keepalive_interval).unwrap_or(0);
    if interval != 0 {
        if let Some(conn) = session.connection_mut(ordinal) {
            log::debug!("{}: KeepaliveTimer fired, sent KEEPALIVE, re-arming for {}s", conn.log_target, interval);
            conn.keepalive_timer = Some(Timer::arm(interval, true, conn.tx.clone(), Event::KeepaliveTimerExpired));
        }
    }
    current
}

async fn recv_traffic(session: &mut Session, ordinal: Ordinal, update: Option<bgp::BGPUpdateMessage>) -> State {
    if let Some(update) = update {
        let peer = session.peer_address;
        log::debug!("{:?}: received UPDATE, {} bytes to routeing engine", ordinal, update.body.len());
        session.routeing.session_update(peer, update).await;
    } else {
        log::debug!("{:?}: received KEEPALIVE", ordinal);
    }
    let interval = session.connection(ordinal).map(|c| c.hold_interval).unwrap_or(0);
    if interval != 0 {
        if let Some(conn) = session.connection_mut(ordinal) {
            conn.hold_timer = Some(Timer::arm(interval, false, conn.tx.clone(), Event::HoldTimerExpired));
        }
    }
    State::Established
}

// --- §4.3 exception-raising actions ------------------------------------

async fn fsm_error(session: &mut Session, ordinal: Ordinal, state: State) -> State {
    log::warn!("{:?}: FSM error in {:?}, sending NOTIFICATION", ordinal, state);
    let notif = bgp::BGPNotificationMessage::new(
        bgp::ErrorCode::FiniteStateMachine,
        bgp::FsmSubCode::Unspecific as u8,
    )
    .expect("notification message always builds");
    post(session, ordinal, ExceptKind::FsmError, Some(bgp::ErrorCode::FiniteStateMachine), Some(notif));
    let tentative = if state == State::Established { State::Stopping } else { State::Idle };
    catch_exception(session, ordinal, tentative).await
}

async fn closed(session: &mut Session, ordinal: Ordinal, state: State) -> State {
    log::info!("{:?}: TCP connection closed in {:?}", ordinal, state);
    post(session, ordinal, ExceptKind::TcpDropped, None, None);
    let tentative = if state == State::Established { State::Stopping } else { State::Idle };
    catch_exception(session, ordinal, tentative).await
}

async fn fatal(session: &mut Session, ordinal: Ordinal, state: State) -> State {
    log::warn!("{:?}: fatal TCP error in {:?}", ordinal, state);
    post(session, ordinal, ExceptKind::TcpError, None, None);
    let tentative = if state == State::Established { State::Stopping } else { State::Idle };
    catch_exception(session, ordinal, tentative).await
}

async fn expire(session: &mut Session, ordinal: Ordinal, state: State) -> State {
    let pending = session.connection(ordinal).map(|c| c.notification_pending).unwrap_or(false);
    if pending {
        log::debug!("{:?}: notification drain timer expired in {:?}", ordinal, state);
        if let Some(conn) = session.connection(ordinal) {
            conn.io.close().await;
        }
        if let Some(conn) = session.connection_mut(ordinal) {
            conn.notification_pending = false;
        }
        return if state == State::Established { State::Stopping } else { State::Idle };
    }

    log::info!("{:?}: HoldTimer expired in {:?}", ordinal, state);
    let notif = bgp::BGPNotificationMessage::new(
        bgp::ErrorCode::HoldTimerExpired,
        bgp::HoldTimerSubCode::Unspecific as u8,
    )
    .expect("notification message always builds");
    post(session, ordinal, ExceptKind::Expired, Some(bgp::ErrorCode::HoldTimerExpired), Some(notif));
    let tentative = if state == State::Established { State::Stopping } else { State::Idle };
    catch_exception(session, ordinal, tentative).await
}

async fn recv_notification(
    session: &mut Session,
    ordinal: Ordinal,
    state: State,
    notif: bgp::BGPNotificationMessage,
) -> State {
    log::info!("{:?}: received NOTIFICATION ({:?}) in {:?}", ordinal, notif.error_code, state);
    post(session, ordinal, ExceptKind::NomRecv, None, None);
    let tentative = if state == State::Established { State::Stopping } else { State::Idle };
    catch_exception(session, ordinal, tentative).await
}

async fn stop(session: &mut Session, ordinal: Ordinal, _state: State) -> State {
    let kind = session
        .connection(ordinal)
        .and_then(|c| c.pending_exception.as_ref())
        .map(|e| e.kind)
        .unwrap_or(ExceptKind::Disabled);
    log::debug!("{:?}: BGP_Stop ({:?})", ordinal, kind);
    let tentative = match kind {
        ExceptKind::Collision => State::Idle,
        _ => State::Stopping,
    };
    catch_exception(session, ordinal, tentative).await
}

async fn invalid(session: &mut Session, ordinal: Ordinal) -> State {
    log::warn!("{:?}: event not valid in current state", ordinal);
    let notif = bgp::BGPNotificationMessage::new(
        bgp::ErrorCode::FiniteStateMachine,
        bgp::FsmSubCode::Unspecific as u8,
    )
    .expect("notification message always builds");
    post(session, ordinal, ExceptKind::Invalid, Some(bgp::ErrorCode::FiniteStateMachine), Some(notif));
    catch_exception(session, ordinal, State::Stopping).await
}

// --- §4.5 NOTIFICATION send sub-protocol completions -------------------

async fn sent_notification_open(session: &mut Session, ordinal: Ordinal, state: State) -> State {
    if let Some(conn) = session.connection_mut(ordinal) {
        log::debug!("{}: NOTIFICATION flushed, arming courtesy hold for {}s", conn.log_target, COURTESY_HOLD);
        conn.notification_pending = true;
        conn.hold_timer = Some(Timer::arm(COURTESY_HOLD, false, conn.tx.clone(), Event::HoldTimerExpired));
    }
    state
}

async fn sent_notification(session: &mut Session, ordinal: Ordinal) -> State {
    if let Some(conn) = session.connection_mut(ordinal) {
        log::debug!("{}: NOTIFICATION flushed, arming stopping hold for {}s", conn.log_target, STOPPING_HOLD);
        conn.notification_pending = true;
        conn.hold_timer = Some(Timer::arm(STOPPING_HOLD, false, conn.tx.clone(), Event::HoldTimerExpired));
    }
    State::Stopping
}

async fn exit(session: &mut Session, ordinal: Ordinal) -> State {
    if let Some(conn) = session.connection(ordinal) {
        log::info!("{}: exiting Stopping, tearing down connection", conn.log_target);
        conn.io.close().await;
    }
    session.connections[ordinal.index()] = None;
    State::Stopping
}

// --- state-entry side effects -------------------------------------------

async fn on_state_change(session: &mut Session, ordinal: Ordinal, prev: State, next: State) {
    if prev == State::Established && next != State::Established && session.admin_state == AdminState::Established {
        session.admin_state = AdminState::Enabled;
    }

    match next {
        State::Idle if prev != State::Initial => idle_fallback(session, ordinal).await,
        State::OpenSent if prev != State::OpenSent => {
            let open_hold = session.open_hold;
            if let Some(conn) = session.connection_mut(ordinal) {
                if open_hold != 0 {
                    log::debug!("{}: arming OpenHoldTimer for {}s", conn.log_target, open_hold);
                    conn.hold_timer = Some(Timer::arm(open_hold, false, conn.tx.clone(), Event::HoldTimerExpired));
                } else {
                    log::debug!("{}: OpenHoldTimer disabled (0)", conn.log_target);
                    conn.hold_timer = None;
                }
            }
        }
        State::OpenConfirm if prev != State::OpenConfirm => {
            if let Some(conn) = session.connection_mut(ordinal) {
                let hold = conn.hold_interval;
                let keepalive = conn.keepalive_interval;
                log::debug!("{}: negotiated hold={}s keepalive={}s", conn.log_target, hold, keepalive);
                conn.hold_timer = if hold != 0 {
                    Some(Timer::arm(hold, false, conn.tx.clone(), Event::HoldTimerExpired))
                } else {
                    None
                };
                conn.keepalive_timer = if keepalive != 0 {
                    Some(Timer::arm(keepalive, true, conn.tx.clone(), Event::KeepaliveTimerExpired))
                } else {
                    None
                };
            }
        }
        _ => {}
    }
}

/// Falling back to Idle from Open*/Connect/Active: back off the
/// IdleHoldTimer, or go comatose if the sibling is still mid-negotiation
/// so both legs restart together (§5).
async fn idle_fallback(session: &mut Session, ordinal: Ordinal) {
    let sibling = ordinal.other();
    let sibling_active = session
        .connection(sibling)
        .map(|c| matches!(c.state, State::OpenSent | State::OpenConfirm))
        .unwrap_or(false);

    if sibling_active {
        if let Some(conn) = session.connection_mut(ordinal) {
            log::debug!("{}: falling back to Idle, sibling still negotiating — going comatose", conn.log_target);
            conn.comatose = true;
            conn.hold_timer = None;
        }
        return;
    }

    let backed_off = session
        .connection(ordinal)
        .map(|c| super::timers::backoff_idle_hold(c.idle_hold_interval))
        .unwrap_or(super::timers::IDLE_HOLD_MIN);
    if let Some(conn) = session.connection_mut(ordinal) {
        log::debug!("{}: falling back to Idle, backing off IdleHoldTimer to {}s", conn.log_target, backed_off);
        conn.comatose = false;
        conn.idle_hold_interval = backed_off;
        conn.hold_timer = Some(Timer::arm(backed_off, true, conn.tx.clone(), Event::BgpStart));
    }

    let sibling_comatose = session.connection(sibling).map(|c| c.comatose).unwrap_or(false);
    if sibling_comatose {
        let interval = session.connection(sibling).unwrap().idle_hold_interval;
        if let Some(sib) = session.connection_mut(sibling) {
            log::debug!("{}: waking comatose sibling, restarting at {}s", sib.log_target, interval);
            sib.comatose = false;
            sib.hold_timer = Some(Timer::arm(interval, true, sib.tx.clone(), Event::BgpStart));
        }
    }
}

fn recompute_accept_enabled(session: &mut Session) {
    session.accept_enabled = session
        .connection(Ordinal::Secondary)
        .map(|c| matches!(c.state, State::Active | State::OpenSent))
        .unwrap_or(false);
}
