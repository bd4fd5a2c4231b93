use dashmap::DashMap;
use huddle_protocol::{ConnectionId, MemberInfo, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound channel to one connected endpoint.
pub type OutboundSender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("connection {0} is already a member of a session")]
    AlreadyJoined(ConnectionId),
    #[error("connection {0} is not a member of any session")]
    NotFound(ConnectionId),
}

/// A member's routing handle: roster entry plus its outbound channel.
#[derive(Debug, Clone)]
pub struct MemberHandle {
    pub info: MemberInfo,
    pub tx: OutboundSender,
}

/// A member record as seen by `lookup`.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub info: MemberInfo,
    pub session_id: String,
}

/// Result of an accepted join. `existing` and `recipients` are snapshotted
/// under the same session guard as the insertion, so a concurrently joining
/// peer shows up in exactly one of roster-or-broadcast, never both.
#[derive(Debug)]
pub struct JoinOutcome {
    pub session_id: String,
    pub member: MemberInfo,
    pub existing: Vec<MemberInfo>,
    pub recipients: Vec<MemberHandle>,
}

/// Result of a leave: the removed member and who is left to notify.
#[derive(Debug)]
pub struct LeaveOutcome {
    pub session_id: String,
    pub member: MemberInfo,
    pub recipients: Vec<MemberHandle>,
}

#[derive(Default)]
struct Session {
    // Join order, which is also the roster order returned to new members.
    members: Vec<MemberHandle>,
}

impl Session {
    fn position(&self, connection_id: &ConnectionId) -> Option<usize> {
        self.members
            .iter()
            .position(|m| &m.info.connection_id == connection_id)
    }
}

/// Owned session/presence registry.
///
/// Sessions are created lazily on first join and removed once their member
/// set empties. All mutation for a given session serializes on its map
/// entry; operations on different sessions never block each other. Guards
/// are never held across an await point.
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    /// connection id -> session id, for leave/lookup without a session hint.
    index: DashMap<ConnectionId, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Add a connection to a session.
    ///
    /// Fails with `AlreadyJoined` (and no side effects) if the connection is
    /// already a member of any session.
    pub fn join(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        display_name: &str,
        tx: OutboundSender,
    ) -> Result<JoinOutcome, RegistryError> {
        use dashmap::mapref::entry::Entry;

        // Lock order is index then sessions, everywhere.
        let index_entry = match self.index.entry(connection_id.clone()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::AlreadyJoined(connection_id));
            }
            Entry::Vacant(vacant) => vacant,
        };

        let info = MemberInfo::new(connection_id, display_name);
        let mut session = self.sessions.entry(session_id.to_string()).or_default();

        let existing: Vec<MemberInfo> = session.members.iter().map(|m| m.info.clone()).collect();
        let recipients: Vec<MemberHandle> = session.members.clone();
        session.members.push(MemberHandle {
            info: info.clone(),
            tx,
        });
        drop(session);

        index_entry.insert(session_id.to_string());
        debug!(
            session_id,
            connection_id = %info.connection_id,
            members = existing.len() + 1,
            "member joined"
        );

        Ok(JoinOutcome {
            session_id: session_id.to_string(),
            member: info,
            existing,
            recipients,
        })
    }

    /// Remove a connection from its session, deleting the session when it
    /// empties. Idempotent: a second leave reports `NotFound`.
    pub fn leave(&self, connection_id: &ConnectionId) -> Result<LeaveOutcome, RegistryError> {
        let (_, session_id) = self
            .index
            .remove(connection_id)
            .ok_or_else(|| RegistryError::NotFound(connection_id.clone()))?;

        let mut removed = None;
        let mut recipients = Vec::new();
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if let Some(position) = session.position(connection_id) {
                removed = Some(session.members.remove(position));
            }
            recipients = session.members.clone();
        }
        // Drop empty sessions without holding the entry guard from above.
        self.sessions
            .remove_if(&session_id, |_, session| session.members.is_empty());

        let removed = removed.ok_or_else(|| RegistryError::NotFound(connection_id.clone()))?;
        debug!(
            session_id,
            connection_id = %connection_id,
            remaining = recipients.len(),
            "member left"
        );

        Ok(LeaveOutcome {
            session_id,
            member: removed.info,
            recipients,
        })
    }

    /// Look up the member record for a connection.
    pub fn lookup(&self, connection_id: &ConnectionId) -> Result<Member, RegistryError> {
        let session_id = self
            .index
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(connection_id.clone()))?;
        let session = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| RegistryError::NotFound(connection_id.clone()))?;
        let position = session
            .position(connection_id)
            .ok_or_else(|| RegistryError::NotFound(connection_id.clone()))?;
        Ok(Member {
            info: session.members[position].info.clone(),
            session_id: session_id.clone(),
        })
    }

    /// Ids of the current members of a session, in join order. `None` once
    /// the session no longer exists (including after it emptied).
    pub fn members_of(&self, session_id: &str) -> Option<Vec<ConnectionId>> {
        self.sessions.get(session_id).map(|session| {
            session
                .members
                .iter()
                .map(|m| m.info.connection_id.clone())
                .collect()
        })
    }

    /// Outbound channel for a member, if it currently belongs to `session_id`.
    pub fn outbound(&self, session_id: &str, connection_id: &ConnectionId) -> Option<OutboundSender> {
        let session = self.sessions.get(session_id)?;
        let position = session.position(connection_id)?;
        Some(session.members[position].tx.clone())
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
