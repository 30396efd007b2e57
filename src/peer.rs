//! Client-side peer adapter interface
//!
//! The relay hides transport identities, so a participant only ever sees
//! local ids. [`PeerEvents`] is the capability set a protocol adapter
//! exposes to the layer above it; [`PeerAdapter`] translates raw server
//! frames into those calls and keeps the handle bookkeeping needed to name
//! a peer in a `DisconnectClient` request.

use crate::wire::{ConnectionId, DisconnectReason, LocalId, ServerMessage, PAYLOAD_HEADER_LEN};
use bytes::{Buf, Bytes};
use std::collections::HashMap;

/// Events a session participant observes
pub trait PeerEvents {
    /// Application payload from `sender` (1 when the sender is the host)
    fn payload(&mut self, sender: LocalId, data: Bytes);
    /// A peer took a seat (hosts only; clients never hear about each other)
    fn peer_connected(&mut self, local_id: LocalId);
    /// A peer left its seat
    fn peer_disconnected(&mut self, local_id: LocalId);
    /// The server ended the session; drop all per-session state
    fn cleanup(&mut self);
}

/// Translates server frames into [`PeerEvents`] calls
pub struct PeerAdapter<E: PeerEvents> {
    events: E,
    /// Opaque server handles, learned from `ClientConnected`
    handles: HashMap<ConnectionId, LocalId>,
    local_id: Option<LocalId>,
}

impl<E: PeerEvents> PeerAdapter<E> {
    pub fn new(events: E) -> Self {
        Self {
            events,
            handles: HashMap::new(),
            local_id: None,
        }
    }

    /// Our own seat, once `Success` arrived
    pub fn local_id(&self) -> Option<LocalId> {
        self.local_id
    }

    /// Server handle for a peer, as needed by `DisconnectClient`
    pub fn handle_for(&self, local_id: LocalId) -> Option<ConnectionId> {
        self.handles
            .iter()
            .find(|(_, &local)| local == local_id)
            .map(|(&handle, _)| handle)
    }

    /// Feed one raw server frame. Returns the disconnect reason when the
    /// server ended the connection, `None` otherwise. Undecodable frames are
    /// ignored.
    pub fn handle_frame(&mut self, frame: &Bytes) -> Option<DisconnectReason> {
        match ServerMessage::decode(frame)? {
            ServerMessage::Disconnection(reason) => {
                self.handles.clear();
                self.local_id = None;
                self.events.cleanup();
                Some(reason)
            }
            ServerMessage::ClientConnected(handle, local_id) => {
                self.handles.insert(handle, local_id);
                self.events.peer_connected(local_id);
                None
            }
            ServerMessage::ClientDisconnected(handle) => {
                if let Some(local_id) = self.handles.remove(&handle) {
                    self.events.peer_disconnected(local_id);
                }
                None
            }
            ServerMessage::PayloadRelay(body) => {
                let mut sender = body.slice(0..4);
                let sender = sender.get_u32_le();
                self.events.payload(sender, body.slice(PAYLOAD_HEADER_LEN..));
                None
            }
            ServerMessage::Success(local_id) => {
                if let Some(local_id) = local_id {
                    self.local_id = Some(local_id);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_payload_body;

    #[derive(Default)]
    struct Recorded {
        payloads: Vec<(LocalId, Vec<u8>)>,
        connected: Vec<LocalId>,
        disconnected: Vec<LocalId>,
        cleanups: usize,
    }

    impl PeerEvents for Recorded {
        fn payload(&mut self, sender: LocalId, data: Bytes) {
            self.payloads.push((sender, data.to_vec()));
        }
        fn peer_connected(&mut self, local_id: LocalId) {
            self.connected.push(local_id);
        }
        fn peer_disconnected(&mut self, local_id: LocalId) {
            self.disconnected.push(local_id);
        }
        fn cleanup(&mut self) {
            self.cleanups += 1;
        }
    }

    #[test]
    fn success_records_own_seat() {
        let mut adapter = PeerAdapter::new(Recorded::default());
        assert_eq!(adapter.local_id(), None);
        adapter.handle_frame(&ServerMessage::Success(Some(2)).encode());
        assert_eq!(adapter.local_id(), Some(2));
    }

    #[test]
    fn connect_then_disconnect_maps_handles_to_seats() {
        let mut adapter = PeerAdapter::new(Recorded::default());
        adapter.handle_frame(&ServerMessage::ClientConnected(77, 2).encode());
        assert_eq!(adapter.handle_for(2), Some(77));
        adapter.handle_frame(&ServerMessage::ClientDisconnected(77).encode());
        assert_eq!(adapter.handle_for(2), None);
        assert_eq!(adapter.events.connected, vec![2]);
        assert_eq!(adapter.events.disconnected, vec![2]);
    }

    #[test]
    fn payload_strips_the_routing_header() {
        let mut adapter = PeerAdapter::new(Recorded::default());
        let body = encode_payload_body(3, 0, 0, b"hi");
        adapter.handle_frame(&ServerMessage::PayloadRelay(body).encode());
        assert_eq!(adapter.events.payloads, vec![(3, b"hi".to_vec())]);
    }

    #[test]
    fn disconnection_cleans_up_and_reports_the_reason() {
        let mut adapter = PeerAdapter::new(Recorded::default());
        adapter.handle_frame(&ServerMessage::ClientConnected(77, 2).encode());
        let reason =
            adapter.handle_frame(&ServerMessage::Disconnection(DisconnectReason::HostShutdown).encode());
        assert_eq!(reason, Some(DisconnectReason::HostShutdown));
        assert_eq!(adapter.events.cleanups, 1);
        assert_eq!(adapter.handle_for(2), None);
    }
}
