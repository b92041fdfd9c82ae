//! The session manager: the component bound to the local user domains.
//!
//! Keeps per-user records and per-resource sessions, and drives the module
//! pipeline that implements user-visible behavior. Traffic reaches it two
//! ways: `<route/>` envelopes from client connectors (session
//! establishment, pre-session auth, and session traffic) and plain stanzas
//! addressed to local users or to the server itself.
//!
//! Concurrency: each user record sits behind its own async mutex, giving
//! every chain touching one user exclusive access. Packets produced while
//! the lock is held are queued on an outbox and routed after release, so
//! self-addressed traffic cannot re-enter the lock.

pub mod modules;
pub mod roster;
pub mod session;
pub mod user;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::StanzaError;
use crate::ns;
use crate::router::{HandlerOutcome, HandlerPhase, Instance, PacketHandler, Router};
use crate::stanza::{self, Packet, PacketClass};
use crate::xdb::XdbCache;

use modules::{ModCtx, Module};
use roster::Roster;
use session::Session;
use user::User;

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SmConfig {
    /// Domains this manager serves.
    pub hosts: Vec<String>,

    /// Name announced in service discovery.
    pub server_name: String,

    /// Message types stored offline; everything else bounces.
    pub store_offline: Vec<String>,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost".to_string()],
            server_name: "roost".to_string(),
            store_offline: ["normal", "chat", "headline", "groupchat", "error"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl SmConfig {
    /// Whether a message of the given `type` may be spooled offline.
    pub fn stores_offline(&self, message_type: Option<&str>) -> bool {
        let message_type = message_type.unwrap_or("normal");
        self.store_offline.iter().any(|t| t == message_type)
    }
}

struct SmInner {
    config: SmConfig,
    router: Router,
    xdb: XdbCache,
    users: DashMap<String, Arc<Mutex<User>>>,
    modules: Vec<Arc<dyn Module>>,
}

/// Cheaply cloneable handle to the session manager.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SmInner>,
}

impl SessionManager {
    pub fn new(
        router: Router,
        xdb: XdbCache,
        config: SmConfig,
        modules: Vec<Arc<dyn Module>>,
    ) -> SessionManager {
        SessionManager {
            inner: Arc::new(SmInner {
                config,
                router,
                xdb,
                users: DashMap::new(),
                modules,
            }),
        }
    }

    /// Register this manager as the instance's terminal handler.
    pub fn attach(&self, instance: &Instance) {
        instance.register_handler(
            HandlerPhase::Deliver,
            Arc::new(SmHandler { sm: self.clone() }),
        );
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn xdb(&self) -> &XdbCache {
        &self.inner.xdb
    }

    pub fn config(&self) -> &SmConfig {
        &self.inner.config
    }

    pub fn is_local_host(&self, domain: &str) -> bool {
        self.inner
            .config
            .hosts
            .iter()
            .any(|host| host.eq_ignore_ascii_case(domain))
    }

    /// Feature vars for the server disco#info answer, across all modules.
    pub fn features(&self) -> Vec<&'static str> {
        let mut features: Vec<&'static str> = self
            .inner
            .modules
            .iter()
            .flat_map(|module| module.features().iter().copied())
            .collect();
        features.sort_unstable();
        features.dedup();
        features
    }

    fn user_entry(&self, bare: &BareJid) -> Arc<Mutex<User>> {
        self.inner
            .users
            .entry(bare.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(User::new(bare.clone()))))
            .clone()
    }

    /// Whether the user has a stored credential record. Cached per record.
    pub async fn user_exists(&self, user: &mut User) -> bool {
        if let Some(exists) = user.exists {
            return exists;
        }
        let owner = Jid::from(user.jid.clone());
        let exists = self
            .inner
            .xdb
            .get(&owner, ns::AUTH)
            .await
            .ok()
            .flatten()
            .is_some();
        user.exists = Some(exists);
        exists
    }

    /// Load the roster from storage into the user record, once.
    pub async fn load_roster(&self, user: &mut User) {
        if user.roster.is_some() {
            return;
        }
        let owner = Jid::from(user.jid.clone());
        let stored = self.inner.xdb.get(&owner, ns::ROSTER).await.ok().flatten();
        user.roster = Some(
            stored
                .map(|elem| Roster::from_element(&elem))
                .unwrap_or_default(),
        );
    }

    /// Write the cached roster back to storage.
    pub async fn save_roster(&self, user: &User) {
        if let Some(ref roster) = user.roster {
            let owner = Jid::from(user.jid.clone());
            if let Err(err) = self
                .inner
                .xdb
                .set(&owner, ns::ROSTER, Some(roster.to_storage_element()))
                .await
            {
                warn!(user = %user.jid, error = %err, "roster save failed");
            }
        }
    }

    /// Route everything queued while a user lock was held.
    async fn flush(&self, outbox: Vec<Packet>) {
        for packet in outbox {
            self.inner.router.deliver(packet).await;
        }
    }

    async fn bounce(&self, packet: Packet, err: StanzaError) {
        if let Some(bounce) = packet.into_bounce(err) {
            self.inner.router.deliver(bounce).await;
        }
    }

    /// Fire every module's shutdown hook.
    pub async fn shutdown(&self) {
        info!("session manager shutting down");
        for module in &self.inner.modules {
            module.shutdown(self).await;
        }
    }

    /// Notify modules of a credential change (`None` removes the account).
    pub async fn fire_password_change(&self, owner: &BareJid, password: Option<&str>) {
        for module in &self.inner.modules {
            if let Err(err) = module.password_change(self, owner, password).await {
                warn!(module = module.name(), error = %err, "password change hook failed");
            }
        }
    }

    /// Remove a user: fire delete hooks, drop sessions, erase the record.
    pub async fn delete_user(&self, bare: &BareJid) {
        let entry = self.user_entry(bare);
        let mut outbox = Vec::new();
        {
            let mut user = entry.lock().await;
            let resources: Vec<String> = user
                .sessions
                .iter()
                .map(|s| s.resource().to_string())
                .collect();
            for resource in resources {
                self.end_session_locked(&mut user, &resource, &mut outbox, false)
                    .await;
            }
            let mut cx = ModCtx {
                sm: self,
                user: &mut user,
                resource: None,
                outbox: &mut outbox,
            };
            for module in &self.inner.modules {
                module.delete_user(&mut cx).await;
            }
        }
        self.inner.users.remove(&bare.to_string());
        self.fire_password_change(bare, None).await;
        self.flush(outbox).await;
    }

    // ---- route envelope handling ------------------------------------

    async fn handle_route(&self, packet: Packet) {
        match packet.elem.attr("type") {
            Some("session") => self.route_session(packet).await,
            Some("error") => self.route_error(packet).await,
            Some("auth") => self.route_auth(packet).await,
            _ => self.route_traffic(packet).await,
        }
    }

    /// `<route type="session"/>`: a connector wants a session established.
    async fn route_session(&self, packet: Packet) {
        let full = match packet.to.clone().try_into_full() {
            Ok(full) => full,
            Err(_) => {
                debug!(to = %packet.to, "session request without resource, dropping");
                return;
            }
        };
        let conn = match packet.from.clone() {
            Some(conn) => conn,
            None => return,
        };

        let resource = full.resource().as_str().to_string();
        let mut outbox = Vec::new();
        {
            let entry = self.user_entry(&full.to_bare());
            let mut user = entry.lock().await;

            // a second session on the same resource replaces the first
            if user.session(&resource).is_some() {
                info!(jid = %full, "session replaced, kicking previous");
                self.end_session_locked(&mut user, &resource, &mut outbox, true)
                    .await;
            }

            user.sessions.push(Session::new(full.clone(), conn.clone()));

            // acknowledge before anything the modules may emit
            outbox.push(session_ack(&full, &conn));

            let mut cx = ModCtx {
                sm: self,
                user: &mut user,
                resource: Some(resource.clone()),
                outbox: &mut outbox,
            };
            for module in &self.inner.modules {
                module.session_start(Arc::clone(module), &mut cx).await;
            }
            info!(jid = %full, "session established");
        }
        self.flush(outbox).await;
    }

    /// `<route type="error"/>`: the connector lost the client connection.
    async fn route_error(&self, packet: Packet) {
        let full = match packet.to.clone().try_into_full() {
            Ok(full) => full,
            Err(_) => return,
        };
        let resource = full.resource().as_str().to_string();
        let bare = full.to_bare();
        let mut outbox = Vec::new();
        {
            let entry = self.user_entry(&bare);
            let mut user = entry.lock().await;
            self.end_session_locked(&mut user, &resource, &mut outbox, false)
                .await;
            if user.sessions.is_empty() {
                self.inner.users.remove(&bare.to_string());
            }
        }
        self.flush(outbox).await;
    }

    /// Close a session: END hooks, optional conflict notice, removal.
    async fn end_session_locked(
        &self,
        user: &mut User,
        resource: &str,
        outbox: &mut Vec<Packet>,
        notify_conflict: bool,
    ) {
        let hooks = match user.session(resource) {
            Some(session) => session.end_hooks.clone(),
            None => return,
        };
        {
            let mut cx = ModCtx {
                sm: self,
                user: &mut *user,
                resource: Some(resource.to_string()),
                outbox: &mut *outbox,
            };
            for hook in hooks {
                hook.session_end(&mut cx).await;
            }
        }
        if let Some(session) = user.remove_session(resource) {
            if notify_conflict {
                let error = Element::builder("route", ns::SERVER)
                    .attr("type", "error")
                    .attr("error", "conflict")
                    .attr("to", session.route_to.to_string())
                    .attr("from", session.full.to_string())
                    .build();
                if let Ok(packet) = Packet::from_element(error) {
                    outbox.push(packet);
                }
            }
            info!(jid = %session.full, "session closed");
        }
    }

    /// `<route type="auth"/>`: pre-session auth or registration iq.
    async fn route_auth(&self, packet: Packet) {
        let is_register = packet
            .elem
            .children()
            .next()
            .and_then(|iq| iq.children().next())
            .map(|query| query.ns() == ns::REGISTER)
            .unwrap_or(false);

        let mut outbox = Vec::new();

        // a registration set runs the veto pass before anything commits
        let inner_type = packet
            .elem
            .children()
            .next()
            .and_then(|iq| iq.attr("type"))
            .map(str::to_owned);
        if is_register && inner_type.as_deref() == Some("set") {
            for module in &self.inner.modules {
                if !module.pre_register(self, &packet).await {
                    debug!(module = module.name(), "registration vetoed");
                    if let Some(reply) = auth_error_reply(packet, StanzaError::NOT_ALLOWED) {
                        self.inner.router.deliver(reply).await;
                    }
                    return;
                }
            }
        }

        let mut current = Some(packet);
        for module in &self.inner.modules {
            let packet = match current.take() {
                Some(packet) => packet,
                None => break,
            };
            let outcome = if is_register {
                module.register(self, packet, &mut outbox).await
            } else {
                module.auth(self, packet, &mut outbox).await
            };
            current = outcome.into_packet();
        }

        if let Some(packet) = current {
            // nothing claimed the exchange: answer inside the envelope
            if let Some(reply) = auth_error_reply(packet, StanzaError::NOT_IMPLEMENTED) {
                outbox.push(reply);
            }
        }
        self.flush(outbox).await;
    }

    /// A plain `<route/>`: session traffic from the client.
    async fn route_traffic(&self, packet: Packet) {
        let full = match packet.to.clone().try_into_full() {
            Ok(full) => full,
            Err(_) => return,
        };
        let mut inner = match packet.elem.children().next().cloned() {
            Some(inner) => inner,
            None => return,
        };
        let resource = full.resource().as_str().to_string();

        let mut outbox = Vec::new();
        {
            let entry = self.user_entry(&full.to_bare());
            let mut user = entry.lock().await;
            if user.session(&resource).is_none() {
                debug!(jid = %full, "traffic for unknown session, dropping");
                return;
            }

            // stanzas leave the session as the session's own JID
            inner.set_attr("from", full.to_string());
            let to = match inner.attr("to") {
                Some(to) => match to.parse::<Jid>() {
                    Ok(to) => to,
                    Err(_) => {
                        debug!(jid = %full, "session stanza with unparsable to, dropping");
                        return;
                    }
                },
                None => Jid::from(full.to_bare()),
            };
            let class = match stanza::classify(&inner) {
                Some(class) => class,
                None => {
                    debug!(jid = %full, elem = %inner.name(), "unroutable session stanza");
                    return;
                }
            };
            let current = Packet {
                class,
                to,
                from: Some(Jid::from(full.clone())),
                elem: inner,
            };

            let hooks = user.session(&resource).unwrap().out_hooks.clone();
            let mut cx = ModCtx {
                sm: self,
                user: &mut user,
                resource: Some(resource.clone()),
                outbox: &mut outbox,
            };
            let mut current = Some(current);
            for hook in hooks {
                let packet = match current.take() {
                    Some(packet) => packet,
                    None => break,
                };
                current = hook.session_out(&mut cx, packet).await.into_packet();
            }

            if let Some(packet) = current {
                if packet.elem.attr("to").is_some() {
                    outbox.push(packet);
                } else {
                    trace!(jid = %full, "unaddressed session stanza not routed");
                }
            }
        }
        self.flush(outbox).await;
    }

    // ---- local delivery ---------------------------------------------

    async fn deliver_local(&self, packet: Packet) {
        let host = packet.host().to_string();
        if !self.is_local_host(&host) {
            self.bounce(packet, StanzaError::UNAVAILABLE).await;
            return;
        }
        if packet.to.node().is_none() {
            self.server_packet(packet).await;
        } else {
            self.user_packet(packet).await;
        }
    }

    /// A stanza addressed to the server's own JID.
    async fn server_packet(&self, packet: Packet) {
        let mut outbox = Vec::new();
        let mut current = Some(packet);
        for module in &self.inner.modules {
            let packet = match current.take() {
                Some(packet) => packet,
                None => break,
            };
            current = module.server(self, packet, &mut outbox).await.into_packet();
        }
        self.flush(outbox).await;

        if let Some(packet) = current {
            match packet.class {
                PacketClass::Iq
                    if matches!(packet.stanza_type(), None | Some("get") | Some("set")) =>
                {
                    self.bounce(packet, StanzaError::NOT_IMPLEMENTED).await;
                }
                _ => trace!(class = ?packet.class, "unhandled server stanza dropped"),
            }
        }
    }

    /// A stanza addressed to a local user.
    async fn user_packet(&self, packet: Packet) {
        let bare = packet.to.to_bare();
        let entry = self.user_entry(&bare);
        let mut outbox = Vec::new();
        let mut fallback: Option<(Packet, StanzaError)> = None;

        {
            let mut user = entry.lock().await;
            let exists = !user.sessions.is_empty() || self.user_exists(&mut user).await;
            if !exists {
                match packet.class {
                    PacketClass::Message | PacketClass::Iq => {
                        fallback = Some((packet, StanzaError::NOT_FOUND));
                    }
                    _ => trace!(to = %bare, "stanza for unknown user dropped"),
                }
                if user.sessions.is_empty() {
                    drop(user);
                    self.inner.users.remove(&bare.to_string());
                }
            } else {
                let current = {
                    let mut cx = ModCtx {
                        sm: self,
                        user: &mut user,
                        resource: None,
                        outbox: &mut outbox,
                    };
                    let mut current = Some(packet);
                    for module in &self.inner.modules {
                        let packet = match current.take() {
                            Some(packet) => packet,
                            None => break,
                        };
                        current = module.deliver(&mut cx, packet).await.into_packet();
                    }
                    current
                };

                if let Some(packet) = current {
                    fallback = self
                        .deliver_unclaimed(&mut user, packet, &mut outbox)
                        .await;
                }
            }
        }

        self.flush(outbox).await;
        if let Some((packet, err)) = fallback {
            self.bounce(packet, err).await;
        }
    }

    /// Default routing for user stanzas no deliver-phase module claimed.
    async fn deliver_unclaimed(
        &self,
        user: &mut User,
        packet: Packet,
        outbox: &mut Vec<Packet>,
    ) -> Option<(Packet, StanzaError)> {
        let explicit = packet
            .to
            .resource()
            .map(|r| r.as_str().to_string())
            .filter(|resource| user.session(resource).is_some());

        match packet.class {
            PacketClass::Message => {
                let target = explicit.or_else(|| {
                    user.primary().map(|session| session.resource().to_string())
                });
                match target {
                    Some(resource) => {
                        self.session_in(user, &resource, packet, outbox).await;
                        None
                    }
                    None => {
                        // offline chain: store or bounce
                        let mut cx = ModCtx {
                            sm: self,
                            user: &mut *user,
                            resource: None,
                            outbox: &mut *outbox,
                        };
                        let mut current = Some(packet);
                        for module in &self.inner.modules {
                            let packet = match current.take() {
                                Some(packet) => packet,
                                None => break,
                            };
                            current = module.offline(&mut cx, packet).await.into_packet();
                        }
                        current.map(|packet| (packet, StanzaError::RECIPIENT_UNAVAILABLE))
                    }
                }
            }
            PacketClass::Iq => match explicit {
                Some(resource) => {
                    self.session_in(user, &resource, packet, outbox).await;
                    None
                }
                None => Some((packet, StanzaError::UNAVAILABLE)),
            },
            PacketClass::Presence | PacketClass::S10n => {
                if let Some(resource) = explicit {
                    self.session_in(user, &resource, packet, outbox).await;
                } else {
                    trace!(to = %packet.to, "unclaimed presence dropped");
                }
                None
            }
            _ => None,
        }
    }

    /// Run a session's IN chain and queue the survivor for the client.
    pub(crate) async fn session_in(
        &self,
        user: &mut User,
        resource: &str,
        packet: Packet,
        outbox: &mut Vec<Packet>,
    ) {
        let hooks = match user.session(resource) {
            Some(session) => session.in_hooks.clone(),
            None => return,
        };
        let mut cx = ModCtx {
            sm: self,
            user: &mut *user,
            resource: Some(resource.to_string()),
            outbox: &mut *outbox,
        };
        let mut current = Some(packet);
        for hook in hooks {
            let packet = match current.take() {
                Some(packet) => packet,
                None => break,
            };
            current = hook.session_in(&mut cx, packet).await.into_packet();
        }
        if let Some(packet) = current {
            cx.send_to_session(resource, packet.elem);
        }
    }

    /// Re-hook a restored session (process handover): the session is
    /// recreated with its last known presence and modules rejoin it.
    pub async fn deserialize_session(
        &self,
        full: FullJid,
        route_to: Jid,
        presence: Option<Element>,
    ) {
        let resource = full.resource().as_str().to_string();
        let mut outbox = Vec::new();
        {
            let entry = self.user_entry(&full.to_bare());
            let mut user = entry.lock().await;
            let mut restored = Session::new(full.clone(), route_to);
            if let Some(presence) = presence {
                restored.priority = session::parse_priority(&presence);
                restored.available = presence.attr("type").is_none();
                restored.presence = Some(presence);
            }
            user.sessions.push(restored);
            let mut cx = ModCtx {
                sm: self,
                user: &mut user,
                resource: Some(resource),
                outbox: &mut outbox,
            };
            for module in &self.inner.modules {
                module.session_start(Arc::clone(module), &mut cx).await;
            }
            info!(jid = %full, "session restored");
        }
        self.flush(outbox).await;
    }
}

/// The session acknowledgment sent back to the connector.
fn session_ack(full: &FullJid, conn: &Jid) -> Packet {
    let elem = Element::builder("route", ns::SERVER)
        .attr("type", "session")
        .attr("to", conn.to_string())
        .attr("from", full.to_string())
        .build();
    Packet::from_element(elem).expect("route ack is routable")
}

/// Wrap an iq error back into the auth route envelope.
fn auth_error_reply(packet: Packet, err: StanzaError) -> Option<Packet> {
    let conn = packet.from?;
    let user = packet.to;
    let inner = packet.elem.children().next().cloned()?;
    let error = stanza::error_reply(inner, err);
    let reply = Element::builder("route", ns::SERVER)
        .attr("type", "auth")
        .attr("to", conn.to_string())
        .attr("from", user.to_string())
        .append(error)
        .build();
    Packet::from_element(reply).ok()
}

/// Terminal router handler for the session manager instance.
struct SmHandler {
    sm: SessionManager,
}

#[async_trait]
impl PacketHandler for SmHandler {
    async fn handle(&self, packet: Packet) -> HandlerOutcome {
        match packet.class {
            PacketClass::Route => {
                self.sm.handle_route(packet).await;
                HandlerOutcome::Done
            }
            PacketClass::Xdb | PacketClass::Log => HandlerOutcome::Pass(packet),
            _ => {
                self.sm.deliver_local(packet).await;
                HandlerOutcome::Done
            }
        }
    }
}
