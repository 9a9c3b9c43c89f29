use std::sync::Arc;
use tokio::sync::Mutex;

use crate::bgp;
use super::io::{ConnectionIo, WriteOutcome};
use super::session::Session;
use super::timers::Timer;
use super::types::{Event, Exception, ExceptKind, Ordinal, State};

/// Sets the pending-exception slot on `ordinal`'s Connection. If the
/// Connection is not in a state where NOTIFICATION traffic is legal, the
/// notification payload is dropped immediately rather than carried
/// forward (§4.3).
pub fn post(
    session: &mut Session,
    ordinal: Ordinal,
    kind: ExceptKind,
    error_code: Option<bgp::ErrorCode>,
    notification: Option<bgp::BGPNotificationMessage>,
) {
    let Some(conn) = session.connection_mut(ordinal) else {
        return;
    };
    let notification_legal = matches!(
        conn.state,
        State::OpenSent | State::OpenConfirm | State::Established
    );
    if notification.is_some() && !notification_legal {
        log::debug!("{}: dropping NOTIFICATION payload, not legal in {:?}", conn.log_target, conn.state);
    }
    let notification = if notification_legal { notification } else { None };
    log::debug!("{}: exception posted: {:?}", conn.log_target, kind);
    conn.pending_exception = Some(Exception {
        kind,
        error_code,
        notification,
    });
}

/// `post`, then raises the generic shutdown event on that Connection —
/// used from outside the normal per-event flow (administrative disable,
/// sibling discard).
pub async fn throw(
    session: &Arc<Mutex<Session>>,
    ordinal: Ordinal,
    kind: ExceptKind,
    error_code: Option<bgp::ErrorCode>,
    notification: Option<bgp::BGPNotificationMessage>,
) {
    {
        let mut s = session.lock().await;
        log::debug!("{:?}: throw({:?})", ordinal, kind);
        post(&mut s, ordinal, kind, error_code, notification);
    }
    super::fsm::raise_event(session, ordinal, Event::BgpStop).await;
}

/// Called from inside an action, already holding the session lock.
/// Performs the NOTIFICATION-send and sibling-discard cleanup, returning
/// the (possibly overridden) next state (§4.3).
pub async fn catch_exception(session: &mut Session, ordinal: Ordinal, next_state: State) -> State {
    let (kind, error_code, notification) = {
        let Some(conn) = session.connection(ordinal) else {
            return next_state;
        };
        match &conn.pending_exception {
            Some(exc) => (exc.kind, exc.error_code, exc.notification.clone()),
            None => (ExceptKind::Invalid, None, None),
        }
    };

    let next_state = match notification.clone() {
        Some(notif) if kind != ExceptKind::NomRecv => {
            begin_send_notification(session, ordinal, next_state, notif).await
        }
        _ => {
            if let Some(conn) = session.connection(ordinal) {
                log::debug!("{}: closing, no NOTIFICATION to send ({:?})", conn.log_target, kind);
                conn.io.close().await;
            }
            next_state
        }
    };

    // The sibling never saw this exception directly; hand it the same
    // NOTIFICATION (if any) and stop it too, by pushing onto its own
    // channel rather than reaching into its dispatch state from here —
    // it may not be mid-dispatch at all right now (§4.3, §9).
    if next_state == State::Stopping && kind != ExceptKind::Discard {
        let sibling = ordinal.other();
        if session.connection(sibling).is_some() {
            post(session, sibling, ExceptKind::Discard, error_code, notification);
            let sib = session.connection(sibling).unwrap();
            log::debug!("{}: cascading stop from sibling's exception", sib.log_target);
            let tx = sib.tx.clone();
            let _ = tx.send(Event::BgpStop).await;
        }
    }

    next_state
}

/// §4.5: partial close, flush, write NOTIFICATION, and decide whether to
/// stay put (waiting for drain) or move on.
async fn begin_send_notification(
    session: &mut Session,
    ordinal: Ordinal,
    intended_next_state: State,
    notification: bgp::BGPNotificationMessage,
) -> State {
    let current_state = match session.connection(ordinal) {
        Some(c) => c.state,
        None => return intended_next_state,
    };
    let next_state = if intended_next_state != State::Stopping {
        current_state
    } else {
        intended_next_state
    };

    let io: Arc<dyn ConnectionIo> = match session.connection(ordinal) {
        Some(c) => c.io.clone(),
        None => return next_state,
    };
    io.disable_read().await;

    log::info!(
        "{:?}: sending NOTIFICATION ({:?}/{})",
        ordinal,
        notification.error_code,
        notification.error_subcode
    );
    let outcome = io
        .write_notification(notification)
        .await
        .unwrap_or(WriteOutcome::Failed);

    let Some(conn) = session.connection_mut(ordinal) else {
        return next_state;
    };
    match outcome {
        WriteOutcome::Flushed => {
            log::debug!("{}: NOTIFICATION flushed immediately", conn.log_target);
            conn.deferred_event = Some(Event::SentNotification);
        }
        WriteOutcome::Queued => {
            let interval = if next_state == State::Stopping {
                super::timers::STOPPING_HOLD
            } else {
                super::timers::COURTESY_HOLD
            };
            log::debug!("{}: NOTIFICATION queued, waiting up to {}s for drain", conn.log_target, interval);
            conn.notification_pending = true;
            conn.hold_timer = Some(Timer::arm(
                interval,
                false,
                conn.tx.clone(),
                Event::HoldTimerExpired,
            ));
        }
        WriteOutcome::Failed => {
            log::warn!("{}: NOTIFICATION write failed", conn.log_target);
            conn.deferred_event = Some(Event::TcpFatalError);
        }
    }

    next_state
}
