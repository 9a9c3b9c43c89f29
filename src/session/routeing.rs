use async_trait::async_trait;
use std::net::IpAddr;
use tokio::sync::mpsc;

use crate::bgp;
use super::types::SessionEvent;

/// Northbound contract to the Routeing Engine (§6). Mirrors the shape of
/// the teacher's `speaker::RibEvent`/`Update` channel pair, generalized to
/// the two calls this spec names.
#[async_trait]
pub trait RouteingEngine: Send + Sync {
    async fn session_event(&self, peer: IpAddr, event: SessionEvent);
    async fn session_update(&self, peer: IpAddr, update: bgp::BGPUpdateMessage);
}

#[derive(Debug)]
pub enum RoutEngineMessage {
    SessionEvent(IpAddr, SessionEvent),
    SessionUpdate(IpAddr, bgp::BGPUpdateMessage),
}

/// Default `RouteingEngine`: forwards both calls onto an mpsc channel, the
/// way `speaker::RibEvent` decouples the neighbor FSM from RIB processing.
pub struct ChannelRouteingEngine {
    tx: mpsc::Sender<RoutEngineMessage>,
}

impl ChannelRouteingEngine {
    pub fn new(tx: mpsc::Sender<RoutEngineMessage>) -> Self {
        ChannelRouteingEngine { tx }
    }
}

#[async_trait]
impl RouteingEngine for ChannelRouteingEngine {
    async fn session_event(&self, peer: IpAddr, event: SessionEvent) {
        if self
            .tx
            .send(RoutEngineMessage::SessionEvent(peer, event))
            .await
            .is_err()
        {
            log::warn!("routeing engine channel closed, dropping session_event for {}", peer);
        }
    }

    async fn session_update(&self, peer: IpAddr, update: bgp::BGPUpdateMessage) {
        if self
            .tx
            .send(RoutEngineMessage::SessionUpdate(peer, update))
            .await
            .is_err()
        {
            log::warn!("routeing engine channel closed, dropping session_update for {}", peer);
        }
    }
}
