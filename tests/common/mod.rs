//! Shared test harness: a relay core wired to a recording link
//!
//! The core is driven by injected transport events, exactly as the driver
//! task would deliver them. Because the production transport confirms every
//! local disconnect with a `Disconnected` event, tests echo those back via
//! [`Harness::settle_disconnects`].

#![allow(dead_code)] // not every test binary uses every helper

use bytes::Bytes;
use std::sync::{Arc, Mutex};

use kcp_relay::registry::SessionRegistry;
use kcp_relay::uid::UidAllocator;
use kcp_relay::wire::{ClientMessage, ConnectionId, ServerMessage, SessionInfo, Token};
use kcp_relay::{Channel, PendingCaches, RelayCore, SessionLink, TransportEvent};

#[derive(Default)]
pub struct LinkLog {
    pub sent: Vec<(ConnectionId, Channel, Bytes)>,
    pub disconnects: Vec<ConnectionId>,
}

/// Recording [`SessionLink`]; clones share the log
#[derive(Clone, Default)]
pub struct MockLink {
    log: Arc<Mutex<LinkLog>>,
}

impl SessionLink for MockLink {
    fn send(&self, conn: ConnectionId, channel: Channel, data: Bytes) {
        self.log.lock().unwrap().sent.push((conn, channel, data));
    }

    fn disconnect(&self, conn: ConnectionId) {
        self.log.lock().unwrap().disconnects.push(conn);
    }
}

impl MockLink {
    /// Every frame sent, in global order
    pub fn all_frames(&self) -> Vec<(ConnectionId, Bytes)> {
        self.log
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(to, _, data)| (*to, data.clone()))
            .collect()
    }

    /// Every frame sent to `conn`, in order
    pub fn frames_to(&self, conn: ConnectionId) -> Vec<Bytes> {
        self.log
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(to, _, _)| *to == conn)
            .map(|(_, _, data)| data.clone())
            .collect()
    }

    pub fn last_frame_to(&self, conn: ConnectionId) -> Option<Bytes> {
        self.frames_to(conn).pop()
    }

    pub fn decoded_frames_to(&self, conn: ConnectionId) -> Vec<ServerMessage> {
        self.frames_to(conn)
            .iter()
            .filter_map(ServerMessage::decode)
            .collect()
    }

    pub fn disconnects(&self) -> Vec<ConnectionId> {
        self.log.lock().unwrap().disconnects.clone()
    }

    /// Disconnects recorded since the last call
    pub fn drain_disconnects(&self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.log.lock().unwrap().disconnects)
    }

    pub fn clear(&self) {
        let mut log = self.log.lock().unwrap();
        log.sent.clear();
        log.disconnects.clear();
    }
}

pub struct Harness {
    pub core: RelayCore<MockLink>,
    pub link: MockLink,
    pub registry: Arc<SessionRegistry>,
    pub caches: Arc<PendingCaches>,
    pub uids: Arc<UidAllocator>,
}

impl Harness {
    pub fn new() -> Self {
        let link = MockLink::default();
        let registry = Arc::new(SessionRegistry::new());
        let caches = Arc::new(PendingCaches::new());
        let uids = Arc::new(UidAllocator::new());
        let core = RelayCore::new(link.clone(), registry.clone(), caches.clone(), uids.clone());
        Self {
            core,
            link,
            registry,
            caches,
            uids,
        }
    }

    pub async fn connect(&mut self, conn: ConnectionId) {
        self.core.handle_event(TransportEvent::Connected(conn)).await;
    }

    pub async fn reliable(&mut self, conn: ConnectionId, frame: &[u8]) {
        self.core
            .handle_event(TransportEvent::Data(
                conn,
                Channel::Reliable,
                Bytes::copy_from_slice(frame),
            ))
            .await;
    }

    pub async fn unreliable(&mut self, conn: ConnectionId, frame: &[u8]) {
        self.core
            .handle_event(TransportEvent::Data(
                conn,
                Channel::Unreliable,
                Bytes::copy_from_slice(frame),
            ))
            .await;
    }

    pub async fn disconnected(&mut self, conn: ConnectionId) {
        self.core
            .handle_event(TransportEvent::Disconnected(conn))
            .await;
    }

    /// Echo pending link disconnects back as transport events, as the
    /// production driver does after tearing the connection down.
    pub async fn settle_disconnects(&mut self) {
        loop {
            let pending = self.link.drain_disconnects();
            if pending.is_empty() {
                return;
            }
            for conn in pending {
                self.disconnected(conn).await;
            }
        }
    }

    /// HTTP `POST /session/allocate` effect
    pub async fn allocate_token(&self, name: &str, max_members: u32) -> Token {
        self.caches
            .create
            .add(SessionInfo::new(name, max_members))
            .await
    }

    /// HTTP `POST /session/join` effect
    pub async fn join_token(&self, session_id: u64) -> Token {
        self.caches.join.add(session_id).await
    }

    /// HTTP `POST /session/modify` effect
    pub async fn modify_token(&self, name: &str, max_members: u32) -> Token {
        self.caches
            .modify
            .add(SessionInfo::new(name, max_members))
            .await
    }

    /// Connect `conn` and make it a host; returns the auth success frame
    pub async fn host(&mut self, conn: ConnectionId, name: &str, max_members: u32) {
        let token = self.allocate_token(name, max_members).await;
        self.connect(conn).await;
        self.reliable(conn, &auth_frame(&token)).await;
    }

    /// Connect `conn` and join it to `session_id`
    pub async fn join(&mut self, conn: ConnectionId, session_id: u64) {
        let token = self.join_token(session_id).await;
        self.connect(conn).await;
        self.reliable(conn, &join_frame(&token)).await;
    }
}

pub fn auth_frame(token: &Token) -> Vec<u8> {
    ClientMessage::AuthSession(*token).encode().to_vec()
}

pub fn join_frame(token: &Token) -> Vec<u8> {
    ClientMessage::JoinSession(*token).encode().to_vec()
}

pub fn modify_frame(token: &Token) -> Vec<u8> {
    ClientMessage::ModifySession(*token).encode().to_vec()
}

/// Pending-store lifetime, re-exported for the expiry scenarios
pub use kcp_relay::pending::PENDING_LIFETIME;
