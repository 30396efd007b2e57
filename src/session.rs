//! One relay session: a host plus the clients sharing its message space

use crate::wire::{ConnectionId, LocalId, SessionId, SessionInfo, SessionPreview, HOST_LOCAL_ID};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Outcome of a join attempt
#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Admitted with this local id
    Joined(LocalId),
    /// At capacity; carries the membership count observed
    Full(u32),
    /// The session is tearing down
    Closed,
    /// The connection already holds a seat; a bookkeeping breach
    AlreadyMember,
}

struct Members {
    info: SessionInfo,
    conn_to_local: HashMap<ConnectionId, LocalId>,
    local_to_conn: HashMap<LocalId, ConnectionId>,
    // Local ids are never reused within a session, so departures leave gaps.
    next_local_id: LocalId,
    tombstone: bool,
}

impl Members {
    fn count(&self) -> u32 {
        self.conn_to_local.len() as u32
    }

    fn insert_pair(&mut self, conn: ConnectionId, local: LocalId) {
        self.conn_to_local.insert(conn, local);
        self.local_to_conn.insert(local, conn);
    }
}

/// A session room. The host's identity is fixed at creation; membership and
/// the name/capacity pair change under the per-session lock.
pub struct Session {
    session_id: SessionId,
    host_connection_id: ConnectionId,
    members: Mutex<Members>,
}

impl Session {
    /// Create a session with its host seated at local id 1
    pub fn new(session_id: SessionId, host_connection_id: ConnectionId, info: SessionInfo) -> Self {
        let mut members = Members {
            info,
            conn_to_local: HashMap::new(),
            local_to_conn: HashMap::new(),
            next_local_id: HOST_LOCAL_ID + 1,
            tombstone: false,
        };
        members.insert_pair(host_connection_id, HOST_LOCAL_ID);
        Self {
            session_id,
            host_connection_id,
            members: Mutex::new(members),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn host_connection_id(&self) -> ConnectionId {
        self.host_connection_id
    }

    /// Whether the session is at capacity, along with the current count
    pub async fn is_full(&self) -> (bool, u32) {
        let members = self.members.lock().await;
        let current = members.count();
        (current >= members.info.max_members, current)
    }

    /// Admit `conn` if there is room and the session is still alive
    pub async fn try_join(&self, conn: ConnectionId) -> JoinOutcome {
        let mut members = self.members.lock().await;
        if members.tombstone {
            return JoinOutcome::Closed;
        }
        if members.conn_to_local.contains_key(&conn) {
            return JoinOutcome::AlreadyMember;
        }
        let current = members.count();
        if current >= members.info.max_members {
            return JoinOutcome::Full(current);
        }
        let local = members.next_local_id;
        members.next_local_id += 1;
        members.insert_pair(conn, local);
        JoinOutcome::Joined(local)
    }

    /// Remove a client seat, returning its local id. The host seat is only
    /// removed by teardown; asking for it here is a no-op.
    pub async fn remove_member(&self, conn: ConnectionId) -> Option<LocalId> {
        let mut members = self.members.lock().await;
        if members.tombstone || conn == self.host_connection_id {
            return None;
        }
        let local = members.conn_to_local.remove(&conn)?;
        members.local_to_conn.remove(&local);
        Some(local)
    }

    /// Connection seated at `local`, if any; `None` once torn down so late
    /// payloads fall on the floor
    pub async fn connection_for(&self, local: LocalId) -> Option<ConnectionId> {
        let members = self.members.lock().await;
        if members.tombstone {
            return None;
        }
        members.local_to_conn.get(&local).copied()
    }

    /// Local id seated by `conn`, if any
    pub async fn local_for(&self, conn: ConnectionId) -> Option<LocalId> {
        let members = self.members.lock().await;
        if members.tombstone {
            return None;
        }
        members.conn_to_local.get(&conn).copied()
    }

    pub async fn contains_connection(&self, conn: ConnectionId) -> bool {
        self.members.lock().await.conn_to_local.contains_key(&conn)
    }

    pub async fn member_count(&self) -> u32 {
        self.members.lock().await.count()
    }

    /// Replace name and capacity atomically. Shrinking below the current
    /// membership evicts nobody; joins resume once the count drops under the
    /// new cap.
    pub async fn modify_info(&self, info: SessionInfo) {
        self.members.lock().await.info = info;
    }

    /// Snapshot for listing
    pub async fn to_preview(&self) -> SessionPreview {
        let members = self.members.lock().await;
        SessionPreview {
            session_id: self.session_id,
            name: members.info.name.clone(),
            max_members: members.info.max_members,
            current_members: members.count(),
        }
    }

    /// Mark the session dead and return the client seats to close. The host
    /// seat stays in the table; the tombstone makes every later lookup miss.
    pub async fn begin_teardown(&self) -> Vec<ConnectionId> {
        let mut members = self.members.lock().await;
        members.tombstone = true;
        members
            .conn_to_local
            .keys()
            .copied()
            .filter(|conn| *conn != self.host_connection_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(1, 100, SessionInfo::new("lobby", 3))
    }

    #[tokio::test]
    async fn host_is_seated_at_one() {
        let session = session();
        assert_eq!(session.local_for(100).await, Some(1));
        assert_eq!(session.connection_for(1).await, Some(100));
        assert_eq!(session.member_count().await, 1);
    }

    #[tokio::test]
    async fn joins_count_toward_capacity() {
        let session = session();
        assert_eq!(session.try_join(200).await, JoinOutcome::Joined(2));
        assert_eq!(session.try_join(300).await, JoinOutcome::Joined(3));
        assert_eq!(session.try_join(400).await, JoinOutcome::Full(3));
        let (full, current) = session.is_full().await;
        assert!(full);
        assert_eq!(current, 3);
    }

    #[tokio::test]
    async fn local_ids_are_never_reused() {
        let session = session();
        assert_eq!(session.try_join(200).await, JoinOutcome::Joined(2));
        assert_eq!(session.remove_member(200).await, Some(2));
        assert_eq!(session.try_join(201).await, JoinOutcome::Joined(3));
        assert_eq!(session.connection_for(2).await, None);
        assert_eq!(session.connection_for(3).await, Some(201));
    }

    #[tokio::test]
    async fn double_join_is_flagged() {
        let session = session();
        assert_eq!(session.try_join(200).await, JoinOutcome::Joined(2));
        assert_eq!(session.try_join(200).await, JoinOutcome::AlreadyMember);
    }

    #[tokio::test]
    async fn host_seat_cannot_be_removed() {
        let session = session();
        assert_eq!(session.remove_member(100).await, None);
        assert_eq!(session.local_for(100).await, Some(1));
    }

    #[tokio::test]
    async fn shrinking_capacity_evicts_nobody() {
        let session = session();
        session.try_join(200).await;
        session.try_join(300).await;
        session.modify_info(SessionInfo::new("tiny", 2)).await;
        assert_eq!(session.member_count().await, 3);
        assert_eq!(session.try_join(400).await, JoinOutcome::Full(3));
        session.remove_member(200).await;
        session.remove_member(300).await;
        assert_eq!(session.try_join(400).await, JoinOutcome::Joined(4));
    }

    #[tokio::test]
    async fn teardown_snapshots_clients_and_blocks_lookups() {
        let session = session();
        session.try_join(200).await;
        session.try_join(300).await;
        let mut members = session.begin_teardown().await;
        members.sort_unstable();
        assert_eq!(members, vec![200, 300]);
        assert_eq!(session.connection_for(2).await, None);
        assert_eq!(session.try_join(400).await, JoinOutcome::Closed);
        assert_eq!(session.remove_member(300).await, None);
    }

    #[tokio::test]
    async fn preview_reflects_membership() {
        let session = session();
        session.try_join(200).await;
        let preview = session.to_preview().await;
        assert_eq!(preview.session_id, 1);
        assert_eq!(preview.name, "lobby");
        assert_eq!(preview.max_members, 3);
        assert_eq!(preview.current_members, 2);
    }
}
