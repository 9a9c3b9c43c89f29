use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

mod bgp;
mod config;
mod error;
mod session;

use session::{
    ChannelRouteingEngine, Connection, ConnectionIo, Event, Ordinal, OrdinalCell, RoutEngineMessage,
    Session, TcpIoDriver,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    #[arg(short, long, value_parser, default_value = "bgpfsmd.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::parse();
    let cfg = config::read_config(&opt.config).context(format!(
        "Failed to read config file {}",
        opt.config.display()
    ))?;

    let local_ip: IpAddr = cfg
        .localips
        .as_ref()
        .and_then(|ips| ips.first().copied())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let local_rid = u32::from(cfg.rid);

    let (route_tx, route_rx) = mpsc::channel::<RoutEngineMessage>(256);
    let routeing = Arc::new(ChannelRouteingEngine::new(route_tx));
    tokio::spawn(log_routeing_messages(route_rx));

    let mut sessions: HashMap<IpAddr, Arc<Mutex<Session>>> = HashMap::new();
    let mut accept_any = false;

    for neighbor in &cfg.neighbors {
        let template = session::OpenTemplate {
            asn: cfg.asn,
            router_id: local_rid,
            hold_time: config::BGP_DEFAULT_HOLD_TIME,
            opt_params: vec![],
        };
        let session = Arc::new(Mutex::new(Session::new(
            neighbor.ip,
            neighbor.port,
            neighbor.allowed_mode,
            neighbor.idle_hold,
            neighbor.connect_retry,
            neighbor.open_hold,
            template,
            routeing.clone(),
        )));

        if neighbor.allowed_mode != config::AllowedMode::AcceptOnly {
            tokio::spawn(dial_primary(
                session.clone(),
                neighbor.ip,
                neighbor.port,
                neighbor.connect_retry,
                neighbor.idle_hold,
            ));
        } else {
            // Secondary-only peers still arm the IdleHoldTimer that flips
            // `accept_enabled` on, but never dial out; give it a dummy
            // primary-less Session by driving BGP_Start on the secondary
            // slot directly once a connection is accepted. Nothing to do
            // here until the listener sees an inbound socket.
        }

        if neighbor.allowed_mode != config::AllowedMode::ConnectOnly {
            accept_any = true;
        }

        sessions.insert(neighbor.ip, session);
    }

    if accept_any {
        tokio::spawn(accept_loop(local_ip, cfg.port, sessions));
    }

    loop {
        sleep(Duration::from_secs(1)).await;
    }
}

async fn log_routeing_messages(mut rx: mpsc::Receiver<RoutEngineMessage>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            RoutEngineMessage::SessionEvent(peer, event) => {
                log::info!("{}: {:?} (stopped={})", peer, event.kind, event.stopped);
            }
            RoutEngineMessage::SessionUpdate(peer, update) => {
                log::debug!("{}: UPDATE, {} bytes", peer, update.body.len());
            }
        }
    }
}

/// Dials the peer until the TCP handshake succeeds, then hands the
/// resulting stream to the primary Connection slot. Retries here are the
/// external network-level retry the FSM's own ConnectRetryTimer assumes
/// already happened by the time a `TcpIoDriver` exists (see `io.rs`).
async fn dial_primary(
    session: Arc<Mutex<Session>>,
    remote: IpAddr,
    port: u16,
    connect_retry: u16,
    idle_hold: u16,
) {
    let addr = SocketAddr::new(remote, port);
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let driver = Arc::new(TcpIoDriver::new(stream));
                let cell = attach_connection(&session, Ordinal::Primary, remote, driver.clone(), idle_hold).await;
                spawn_reader(session.clone(), cell, driver);
                return;
            }
            Err(err) => {
                log::warn!("connect to {} failed: {}", addr, err);
                sleep(Duration::from_secs(connect_retry.max(1) as u64)).await;
            }
        }
    }
}

/// Listens for inbound BGP connections and hands each one that matches a
/// configured, accept-allowed peer to that peer's secondary Connection
/// slot. Unmatched or already-occupied peers are dropped (mirrors the
/// teacher's `speaker::connection::add_incoming` shape).
async fn accept_loop(local_ip: IpAddr, port: u16, sessions: HashMap<IpAddr, Arc<Mutex<Session>>>) {
    let bind_addr = SocketAddr::new(local_ip, port);
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(err) => {
            log::error!("failed to bind BGP listener on {}: {}", bind_addr, err);
            return;
        }
    };

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("accept failed: {}", err);
                continue;
            }
        };
        let remote_ip = peer_addr.ip();

        let Some(session) = sessions.get(&remote_ip) else {
            log::warn!("rejecting connection from unconfigured peer {}", remote_ip);
            drop(stream);
            continue;
        };

        let already_attached = {
            let s = session.lock().await;
            s.allowed_modes == config::AllowedMode::ConnectOnly || s.connection(Ordinal::Secondary).is_some()
        };
        if already_attached {
            log::info!("rejecting duplicate/disallowed connection from {}", remote_ip);
            drop(stream);
            continue;
        }

        let idle_hold = session.lock().await.idle_hold;
        let driver = Arc::new(TcpIoDriver::new(stream));
        let cell = attach_connection(session, Ordinal::Secondary, remote_ip, driver.clone(), idle_hold).await;
        spawn_reader(session.clone(), cell, driver);
    }
}

/// Installs a Connection in the given slot and raises the initial
/// `BGP_Start`, the way `session::enable_session` does for both legs at
/// once — split per-leg here since the primary and secondary IO sources
/// (outbound dial, inbound accept) resolve independently and at
/// different times. Returns the Connection's `ordinal_cell` so the
/// caller's socket reader can be spawned against the same live slot the
/// event pump uses, rather than a fixed `ordinal` neither would notice a
/// later collision promotion change.
async fn attach_connection(
    session: &Arc<Mutex<Session>>,
    ordinal: Ordinal,
    peer: IpAddr,
    io: Arc<dyn ConnectionIo>,
    idle_hold: u16,
) -> Arc<OrdinalCell> {
    let (tx, rx) = mpsc::channel(64);
    let cell = {
        let mut s = session.lock().await;
        s.admin_state = session::AdminState::Enabled;
        let conn = Connection::new(ordinal, peer, io, tx.clone(), idle_hold);
        let cell = conn.ordinal_cell.clone();
        s.connections[ordinal.index()] = Some(conn);
        cell
    };

    session::spawn_event_pump(session.clone(), cell.clone(), rx);
    let _ = tx.send(Event::BgpStart).await;
    cell
}

/// Turns wire messages (and read failures) into FSM events for one leg.
/// Re-reads `ordinal_cell` before every `raise_event` call for the same
/// reason `session::spawn_event_pump` does — a promotion can move this
/// leg to the other slot while the reader is blocked in `read_next`.
fn spawn_reader(session: Arc<Mutex<Session>>, ordinal_cell: Arc<OrdinalCell>, driver: Arc<TcpIoDriver>) {
    tokio::spawn(async move {
        loop {
            match driver.read_next().await {
                Some(Ok(message)) => {
                    if let Some(event) = message_to_event(message) {
                        let ordinal = ordinal_cell.get();
                        session::raise_event(&session, ordinal, event).await;
                    }
                }
                Some(Err(err)) => {
                    let ordinal = ordinal_cell.get();
                    log::info!("read error on {:?}: {}", ordinal, err);
                    session::raise_event(&session, ordinal, Event::TcpConnectionClosed).await;
                    return;
                }
                None => {
                    let ordinal = ordinal_cell.get();
                    session::raise_event(&session, ordinal, Event::TcpConnectionClosed).await;
                    return;
                }
            }
        }
    });
}

fn message_to_event(message: bgp::Message) -> Option<Event> {
    match message.body {
        bgp::BGPMessageBody::Open(open) => Some(Event::ReceiveOpen(open)),
        bgp::BGPMessageBody::Keepalive(_) => Some(Event::ReceiveKeepalive),
        bgp::BGPMessageBody::Update(update) => Some(Event::ReceiveUpdate(update)),
        bgp::BGPMessageBody::Notification(notif) => Some(Event::ReceiveNotification(notif)),
    }
}
