//! Relay core: per-connection authorization and payload routing
//!
//! Consumes transport events in order, drives the per-connection state
//! machine (`Pending → Host | Client → closed`), and forwards payloads
//! between a host and its clients while keeping transport-level connection
//! ids hidden from both sides.

use crate::metrics::global_metrics;
use crate::pending::{PendingStore, TokenStore};
use crate::registry::SessionRegistry;
use crate::session::{JoinOutcome, Session};
use crate::transport::{Channel, SessionLink, TransportEvent};
use crate::uid::UidAllocator;
use crate::wire::{
    payload_recipient, rewrite_payload_sender, ClientMessage, ConnectionId, DisconnectReason,
    LocalId, ServerMessage, SessionId, SessionInfo, HOST_LOCAL_ID,
};

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// The three token caches deposited by the HTTP control plane and consumed
/// over KCP
pub struct PendingCaches {
    pub create: TokenStore<SessionInfo>,
    pub join: TokenStore<SessionId>,
    pub modify: TokenStore<SessionInfo>,
}

impl PendingCaches {
    pub fn new() -> Self {
        Self {
            create: TokenStore::new(),
            join: TokenStore::new(),
            modify: TokenStore::new(),
        }
    }
}

impl Default for PendingCaches {
    fn default() -> Self {
        Self::new()
    }
}

/// Authorization state of one live connection
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnState {
    /// Connected, token not yet presented
    Pending,
    /// Authenticated session owner
    Host { session_id: SessionId },
    /// Authenticated session member
    Client {
        host_connection_id: ConnectionId,
        local_id: LocalId,
    },
}

/// The relay core. One instance per server; owns the connection state map
/// and is driven by a single event stream, so no handler ever races another.
pub struct RelayCore<L: SessionLink> {
    link: L,
    registry: Arc<SessionRegistry>,
    caches: Arc<PendingCaches>,
    uids: Arc<UidAllocator>,
    states: HashMap<ConnectionId, ConnState>,
    pending_conns: PendingStore<ConnectionId, ()>,
    // Connections told to go away; their events are ignored until the
    // transport confirms the disconnect.
    closing: HashSet<ConnectionId>,
}

impl<L: SessionLink> RelayCore<L> {
    pub fn new(
        link: L,
        registry: Arc<SessionRegistry>,
        caches: Arc<PendingCaches>,
        uids: Arc<UidAllocator>,
    ) -> Self {
        Self {
            link,
            registry,
            caches,
            uids,
            states: HashMap::new(),
            pending_conns: PendingStore::new(),
            closing: HashSet::new(),
        }
    }

    /// Run until the transport closes its event stream or `shutdown` fires.
    /// On shutdown every live connection is drained with `ServerShutdown`.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: CancellationToken,
    ) {
        let mut gc = tokio::time::interval(Duration::from_secs(1));
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.shutdown_drain().await;
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = gc.tick() => self.gc_tick().await,
            }
        }
        info!("relay core stopped");
    }

    /// Dispatch one transport event. Public so tests can drive the core
    /// without a socket.
    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(conn) => self.on_connected(conn).await,
            TransportEvent::Data(conn, channel, frame) => {
                self.on_data(conn, channel, frame).await
            }
            TransportEvent::Disconnected(conn) => self.on_disconnected(conn).await,
            TransportEvent::Error(conn, error) => {
                error!(conn, error = %error, "transport error");
                self.close(conn, DisconnectReason::ServerSideError);
            }
        }
    }

    async fn on_connected(&mut self, conn: ConnectionId) {
        if self.states.contains_key(&conn) {
            error!(conn, "duplicate connect event ignored");
            return;
        }
        self.states.insert(conn, ConnState::Pending);
        self.pending_conns.insert(conn, ()).await;
        global_metrics().connection_accepted();
        debug!(conn, "connection pending authorization");
    }

    async fn on_data(&mut self, conn: ConnectionId, channel: Channel, frame: Bytes) {
        if self.closing.contains(&conn) {
            trace!(conn, "frame from closing connection dropped");
            return;
        }
        if !self.states.contains_key(&conn) {
            trace!(conn, "frame from unknown connection dropped");
            return;
        }
        if channel == Channel::Unreliable {
            self.close(conn, DisconnectReason::UnreliableCommunicationNotAllowed);
            return;
        }
        let message = match ClientMessage::decode(&frame) {
            Ok(message) => message,
            Err(reason) => {
                self.close(conn, reason);
                return;
            }
        };
        // The state was checked above; clone is cheap and releases the map.
        let state = self.states[&conn].clone();
        match message {
            ClientMessage::AuthSession(token) => match state {
                ConnState::Pending => self.auth_session(conn, token).await,
                _ => self.close(conn, DisconnectReason::UnAuthorizedAction),
            },
            ClientMessage::JoinSession(token) => match state {
                ConnState::Pending => self.join_session(conn, token).await,
                _ => self.close(conn, DisconnectReason::UnAuthorizedAction),
            },
            ClientMessage::ModifySession(token) => match state {
                ConnState::Host { .. } => self.modify_session(conn, token).await,
                _ => self.close(conn, DisconnectReason::UnAuthorizedAction),
            },
            ClientMessage::Payload(body) => match state {
                ConnState::Host { session_id } => {
                    self.route_from_host(conn, session_id, body).await
                }
                ConnState::Client {
                    host_connection_id,
                    local_id,
                } => self.route_from_client(conn, host_connection_id, local_id, body),
                ConnState::Pending => self.close(conn, DisconnectReason::UnAuthorizedAction),
            },
            ClientMessage::DisconnectClient(target) => match state {
                ConnState::Host { .. } => self.disconnect_client(conn, target).await,
                _ => self.close(conn, DisconnectReason::UnAuthorizedAction),
            },
        }
    }

    async fn auth_session(&mut self, conn: ConnectionId, token: crate::wire::Token) {
        let Some(info) = self.caches.create.try_extract(&token).await else {
            self.close(conn, DisconnectReason::InvalidAuthToken);
            return;
        };
        let Some(session_id) = self.uids.get().await else {
            error!(conn, "session id space exhausted");
            self.close(conn, DisconnectReason::ServerSideError);
            return;
        };
        let session = Arc::new(Session::new(session_id, conn, info));
        if let Err(e) = self.registry.try_add_session(session).await {
            error!(conn, session = session_id, error = %e, "session registration failed");
            self.uids.release(session_id).await;
            self.close(conn, DisconnectReason::ServerSideError);
            return;
        }
        self.pending_conns.try_extract(&conn).await;
        self.states.insert(conn, ConnState::Host { session_id });
        global_metrics().session_created();
        self.link.send(
            conn,
            Channel::Reliable,
            ServerMessage::Success(Some(HOST_LOCAL_ID)).encode(),
        );
        info!(conn, session = session_id, "session created");
    }

    async fn join_session(&mut self, conn: ConnectionId, token: crate::wire::Token) {
        let Some(session_id) = self.caches.join.try_extract(&token).await else {
            self.close(conn, DisconnectReason::InvalidAuthToken);
            return;
        };
        let Some(session) = self.registry.session_by_id(session_id).await else {
            self.close(conn, DisconnectReason::InvalidSessionId);
            return;
        };
        match session.try_join(conn).await {
            JoinOutcome::Joined(local_id) => {
                let host = session.host_connection_id();
                if let Err(e) = self.registry.try_add_client(conn, host).await {
                    error!(conn, session = session_id, error = %e, "client registration failed");
                    session.remove_member(conn).await;
                    self.close(conn, DisconnectReason::ServerSideError);
                    return;
                }
                self.pending_conns.try_extract(&conn).await;
                self.states.insert(
                    conn,
                    ConnState::Client {
                        host_connection_id: host,
                        local_id,
                    },
                );
                // The host hears about the member before the member may
                // speak: its notification is enqueued ahead of the success
                // that unlocks the client.
                self.link.send(
                    host,
                    Channel::Reliable,
                    ServerMessage::ClientConnected(conn, local_id).encode(),
                );
                self.link.send(
                    conn,
                    Channel::Reliable,
                    ServerMessage::Success(Some(local_id)).encode(),
                );
                info!(conn, session = session_id, local = local_id, "client joined");
            }
            JoinOutcome::Full(current) => {
                debug!(conn, session = session_id, current, "session full");
                self.close(conn, DisconnectReason::SessionFull);
            }
            JoinOutcome::Closed => self.close(conn, DisconnectReason::InvalidSessionId),
            JoinOutcome::AlreadyMember => {
                error!(conn, session = session_id, "pending connection already seated");
                self.close(conn, DisconnectReason::ServerSideError);
            }
        }
    }

    async fn modify_session(&mut self, conn: ConnectionId, token: crate::wire::Token) {
        let Some(info) = self.caches.modify.try_extract(&token).await else {
            self.close(conn, DisconnectReason::InvalidAuthToken);
            return;
        };
        let Some(session) = self.registry.session_by_host(conn).await else {
            error!(conn, "host state without a hosted session");
            self.close(conn, DisconnectReason::ServerSideError);
            return;
        };
        session.modify_info(info).await;
        self.link.send(
            conn,
            Channel::Reliable,
            ServerMessage::Success(None).encode(),
        );
        debug!(conn, session = session.session_id(), "session modified");
    }

    /// Host → client: recipient is looked up in the session; a missing seat
    /// means the client already left, which is not the host's problem.
    async fn route_from_host(&mut self, conn: ConnectionId, session_id: SessionId, body: Bytes) {
        let recipient = payload_recipient(&body);
        if recipient == HOST_LOCAL_ID {
            self.close(conn, DisconnectReason::UnAuthorizedAction);
            return;
        }
        let Some(session) = self.registry.session_by_host(conn).await else {
            error!(conn, session = session_id, "host state without a hosted session");
            self.close(conn, DisconnectReason::ServerSideError);
            return;
        };
        let Some(destination) = session.connection_for(recipient).await else {
            trace!(conn, recipient, "payload for departed member dropped");
            return;
        };
        let rewritten = rewrite_payload_sender(&body, HOST_LOCAL_ID);
        global_metrics().payload_relayed();
        self.link.send(
            destination,
            Channel::Reliable,
            ServerMessage::PayloadRelay(rewritten).encode(),
        );
    }

    /// Client → host: the only legal recipient is local id 1. The first four
    /// bytes become the sender's local id so the host knows who is talking.
    fn route_from_client(
        &mut self,
        conn: ConnectionId,
        host: ConnectionId,
        local_id: LocalId,
        body: Bytes,
    ) {
        let recipient = payload_recipient(&body);
        if recipient != HOST_LOCAL_ID {
            self.close(conn, DisconnectReason::UnAuthorizedAction);
            return;
        }
        let rewritten = rewrite_payload_sender(&body, local_id);
        global_metrics().payload_relayed();
        self.link.send(
            host,
            Channel::Reliable,
            ServerMessage::PayloadRelay(rewritten).encode(),
        );
    }

    /// Host asked to drop one of its members, named by the opaque handle it
    /// received in `ClientConnected`
    async fn disconnect_client(&mut self, conn: ConnectionId, target: ConnectionId) {
        let Some(session) = self.registry.session_by_host(conn).await else {
            error!(conn, "host state without a hosted session");
            self.close(conn, DisconnectReason::ServerSideError);
            return;
        };
        if !session.contains_connection(target).await {
            debug!(conn, target, "disconnect request for non-member ignored");
            return;
        }
        self.close(target, DisconnectReason::HostTriggeredDisconnection);
    }

    async fn on_disconnected(&mut self, conn: ConnectionId) {
        self.closing.remove(&conn);
        self.pending_conns.try_extract(&conn).await;
        // A repeated disconnect finds no state and is a no-op.
        let Some(state) = self.states.remove(&conn) else {
            trace!(conn, "disconnect for unknown connection ignored");
            return;
        };
        global_metrics().connection_closed();
        match state {
            ConnState::Pending => {
                debug!(conn, "pending connection closed");
            }
            ConnState::Client {
                host_connection_id, ..
            } => {
                self.registry.remove_client(conn).await;
                if let Some(session) = self.registry.session_by_host(host_connection_id).await {
                    if session.remove_member(conn).await.is_some() {
                        self.link.send(
                            host_connection_id,
                            Channel::Reliable,
                            ServerMessage::ClientDisconnected(conn).encode(),
                        );
                    }
                }
                debug!(conn, host = host_connection_id, "client left");
            }
            ConnState::Host { session_id } => {
                self.teardown_session(conn, session_id).await;
            }
        }
    }

    /// Host is gone: tear the whole session down and give its id back
    async fn teardown_session(&mut self, host: ConnectionId, session_id: SessionId) {
        let session = match self.registry.try_remove_session(host).await {
            Ok(session) => session,
            Err(e) => {
                error!(conn = host, session = session_id, error = %e, "teardown found broken indexes");
                return;
            }
        };
        // Snapshot under the session lock, close outside it.
        let members = session.begin_teardown().await;
        for member in members {
            self.registry.remove_client(member).await;
            self.close(member, DisconnectReason::HostShutdown);
        }
        self.uids.release(session_id).await;
        global_metrics().session_destroyed();
        info!(session = session_id, "session destroyed");
    }

    /// One GC tick: age all four pending stores and apply expiry effects
    pub async fn gc_tick(&mut self) {
        for (_, _) in self.caches.create.sweep().await {
            global_metrics().pending_expired();
            debug!("create token expired");
        }
        for (_, session_id) in self.caches.join.sweep().await {
            global_metrics().pending_expired();
            debug!(session = session_id, "join token expired");
        }
        for (_, _) in self.caches.modify.sweep().await {
            global_metrics().pending_expired();
            debug!("modify token expired");
        }
        for (conn, ()) in self.pending_conns.sweep().await {
            global_metrics().pending_expired();
            warn!(conn, "authorization deadline passed");
            self.close(conn, DisconnectReason::TimeOut);
        }
    }

    /// Drain every live connection with `ServerShutdown`
    pub async fn shutdown_drain(&mut self) {
        let live: Vec<ConnectionId> = self.states.keys().copied().collect();
        info!(connections = live.len(), "draining for shutdown");
        for conn in live {
            self.close(conn, DisconnectReason::ServerShutdown);
        }
    }

    /// Send the reason and ask the transport to drop the connection. State
    /// cleanup happens when the `Disconnected` event comes back.
    fn close(&mut self, conn: ConnectionId, reason: DisconnectReason) {
        if !self.closing.insert(conn) {
            return;
        }
        debug!(conn, reason = %reason, "closing connection");
        self.link.send(
            conn,
            Channel::Reliable,
            ServerMessage::Disconnection(reason).encode(),
        );
        self.link.disconnect(conn);
    }
}
