//! Process-wide session registry.
//!
//! Maps session ids to live connections so a reply can find its way
//! back to the socket that originated a request, even when the reply
//! traveled through another process. The registry exclusively owns
//! the mapping; connections themselves are shared handles.

use dashmap::DashMap;
use wire_proto::FrameKind;

use crate::conn::Conn;
use crate::error::NetError;

/// One client-facing or service-facing session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub conn: Conn,
}

impl Session {
    pub fn new(id: String, conn: Conn) -> Self {
        Self { id, conn }
    }
}

/// Session-id → connection map.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, replacing any previous one with that id.
    pub fn add(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Removes and returns a session; called when its connection's
    /// read loop exits.
    pub fn remove(&self, ssid: &str) -> Option<Session> {
        self.sessions.remove(ssid).map(|(_, session)| session)
    }

    /// The connection behind a session, if it is still registered.
    pub fn get(&self, ssid: &str) -> Option<Conn> {
        self.sessions.get(ssid).map(|entry| entry.conn.clone())
    }

    /// Queues a frame on the session's connection.
    pub fn send_to(&self, ssid: &str, kind: FrameKind, payload: Vec<u8>) -> Result<(), NetError> {
        let conn = self
            .get(ssid)
            .ok_or_else(|| NetError::UnknownSession(ssid.to_string()))?;
        conn.write(kind, payload)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Closes every registered connection; shutdown path.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.conn.close();
        }
        self.sessions.clear();
    }
}
