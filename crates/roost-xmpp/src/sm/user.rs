//! Per-user state: sessions, cached roster, existence flag.

use jid::BareJid;

use super::roster::Roster;
use super::session::Session;

/// State for one local user, keyed by bare JID.
///
/// A user record is created when the first packet arrives for the user or
/// a session is established, and reclaimed once no session references it.
/// All mutation happens under the session manager's per-user lock.
pub struct User {
    pub jid: BareJid,
    pub sessions: Vec<Session>,

    /// Roster, loaded from storage on first use.
    pub roster: Option<Roster>,

    /// Cached result of the storage existence check.
    pub exists: Option<bool>,
}

impl User {
    pub fn new(jid: BareJid) -> User {
        User {
            jid,
            sessions: Vec::new(),
            roster: None,
            exists: None,
        }
    }

    pub fn session(&self, resource: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.resource() == resource)
    }

    pub fn session_mut(&mut self, resource: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.resource() == resource)
    }

    pub fn remove_session(&mut self, resource: &str) -> Option<Session> {
        let index = self.sessions.iter().position(|s| s.resource() == resource)?;
        Some(self.sessions.remove(index))
    }

    /// The primary session: highest non-negative priority among available
    /// sessions, latest-connected breaking ties.
    pub fn primary(&self) -> Option<&Session> {
        self.sessions
            .iter()
            .filter(|s| s.available && s.priority >= 0)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.connected_at.cmp(&b.connected_at))
            })
    }

    /// Sessions that have announced available presence.
    pub fn available_sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter(|s| s.available)
    }
}
