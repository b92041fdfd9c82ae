//! The session manager's module pipeline.
//!
//! Modules implement user-visible behavior by hooking the event phases the
//! session manager fires: server-addressed stanzas, local delivery, offline
//! handling, authentication and registration, and per-session IN/OUT/END
//! chains that modules join at session start.
//!
//! ## Implemented modules
//!
//! - `roster`: roster queries and the presence subscription state machine.
//! - `presence`: presence storage, broadcast, and probe handling.
//! - `offline`: the offline message spool with expiry handling.
//! - `auth`: digest authentication over the legacy auth namespace.
//! - `register`: in-band account creation and password changes.
//! - `disco`: service discovery and the legacy browse tree.
//! - `private`: per-user private XML storage.
//! - `vcard`: vcard-temp storage and public card queries.

pub mod auth;
pub mod disco;
pub mod offline;
pub mod presence;
pub mod private;
pub mod register;
pub mod roster;
pub mod vcard;

use std::sync::Arc;

use async_trait::async_trait;
use jid::BareJid;
use minidom::Element;

use super::session::Session;
use super::user::User;
use super::SessionManager;
use crate::error::XmppError;
use crate::stanza::Packet;

/// What a module did with the event it was offered.
pub enum ModOutcome {
    /// Applied but wants the chain to continue.
    Pass(Packet),
    /// Consumed; the chain stops.
    Handled,
    /// Did not apply; same chain behavior as pass.
    Ignore(Packet),
}

impl ModOutcome {
    /// The packet to keep feeding the chain, if the chain continues.
    pub fn into_packet(self) -> Option<Packet> {
        match self {
            ModOutcome::Pass(packet) | ModOutcome::Ignore(packet) => Some(packet),
            ModOutcome::Handled => None,
        }
    }
}

/// Event context handed to user-scoped module hooks.
///
/// The user record is held under its per-user lock for the whole chain;
/// anything a module wants routed is queued on the outbox and delivered
/// after the lock is released, which keeps self-addressed traffic from
/// re-entering the lock.
pub struct ModCtx<'a> {
    pub sm: &'a SessionManager,
    pub user: &'a mut User,

    /// Resource of the session this event concerns, for session events.
    pub resource: Option<String>,

    /// Packets to route once the user lock is dropped.
    pub outbox: &'a mut Vec<Packet>,
}

impl ModCtx<'_> {
    /// The session this event concerns.
    pub fn session(&mut self) -> Option<&mut Session> {
        let resource = self.resource.clone()?;
        self.user.session_mut(&resource)
    }

    pub fn session_ref(&self) -> Option<&Session> {
        let resource = self.resource.as_deref()?;
        self.user.session(resource)
    }

    /// Queue a stanza for routing.
    pub fn send(&mut self, elem: Element) {
        match Packet::from_element(elem) {
            Ok(packet) => self.outbox.push(packet),
            Err(err) => tracing::warn!(error = %err, "module produced unroutable stanza"),
        }
    }

    /// Queue a stanza for the client behind one of this user's sessions.
    pub fn send_to_session(&mut self, resource: &str, elem: Element) {
        let wrapped = match self.user.session(resource) {
            Some(session) => session.wrap_for_client(elem),
            None => return,
        };
        self.send(wrapped);
    }

    /// Queue a stanza for the session this event concerns.
    pub fn send_to_client(&mut self, elem: Element) {
        if let Some(resource) = self.resource.clone() {
            self.send_to_session(&resource, elem);
        }
    }
}

/// A session-manager module.
///
/// Every hook defaults to not applying, so modules implement only the
/// phases they care about. Hooks that run under the user lock receive a
/// [`ModCtx`]; the pre-session hooks (`server`, `auth`, `register`) get
/// the session manager and an outbox directly.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Feature vars contributed to the server's disco#info answer.
    fn features(&self) -> &'static [&'static str] {
        &[]
    }

    /// A stanza addressed to the server's own JID.
    async fn server(
        &self,
        _sm: &SessionManager,
        packet: Packet,
        _outbox: &mut Vec<Packet>,
    ) -> ModOutcome {
        ModOutcome::Ignore(packet)
    }

    /// A pre-session authentication exchange (route `type="auth"`).
    async fn auth(
        &self,
        _sm: &SessionManager,
        packet: Packet,
        _outbox: &mut Vec<Packet>,
    ) -> ModOutcome {
        ModOutcome::Ignore(packet)
    }

    /// Veto point before a registration create is processed. Any module
    /// returning false refuses the attempt.
    async fn pre_register(&self, _sm: &SessionManager, _packet: &Packet) -> bool {
        true
    }

    /// A pre-session registration exchange.
    async fn register(
        &self,
        _sm: &SessionManager,
        packet: Packet,
        _outbox: &mut Vec<Packet>,
    ) -> ModOutcome {
        ModOutcome::Ignore(packet)
    }

    /// A credential changed; `None` means the account is being removed.
    async fn password_change(
        &self,
        _sm: &SessionManager,
        _owner: &BareJid,
        _password: Option<&str>,
    ) -> Result<(), XmppError> {
        Ok(())
    }

    /// A stanza about to be delivered to a local user.
    async fn deliver(&self, _cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        ModOutcome::Ignore(packet)
    }

    /// A stanza for a user with no available session.
    async fn offline(&self, _cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        ModOutcome::Ignore(packet)
    }

    /// A new session is being established; modules join its IN/OUT/END
    /// chains here by pushing `this` onto the session's hook lists.
    async fn session_start(&self, _this: Arc<dyn Module>, _cx: &mut ModCtx<'_>) {}

    /// A stanza entering the session, about to be written to the client.
    async fn session_in(&self, _cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        ModOutcome::Ignore(packet)
    }

    /// A stanza the client sent through this session.
    async fn session_out(&self, _cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        ModOutcome::Ignore(packet)
    }

    /// The session is closing.
    async fn session_end(&self, _cx: &mut ModCtx<'_>) {}

    /// The user is being removed.
    async fn delete_user(&self, _cx: &mut ModCtx<'_>) {}

    /// Process teardown.
    async fn shutdown(&self, _sm: &SessionManager) {}
}
