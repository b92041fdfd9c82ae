//! In-band account creation and password changes.
//!
//! The interactive form surface lives in the connectors; this module owns
//! the credential lifecycle: create on a pre-session `set`, change the
//! password for an authenticated session, remove on `<remove/>`.

use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, info};

use crate::error::StanzaError;
use crate::ns;
use crate::sm::modules::{ModCtx, ModOutcome, Module};
use crate::sm::SessionManager;
use crate::stanza::{self, Packet, PacketClass};

#[derive(Default)]
pub struct RegisterModule;

impl RegisterModule {
    pub fn new() -> Arc<RegisterModule> {
        Arc::new(RegisterModule::default())
    }

    fn wrap_auth_route(conn: &Jid, user: &Jid, inner: Element) -> Option<Packet> {
        let elem = Element::builder("route", ns::SERVER)
            .attr("type", "auth")
            .attr("to", conn.to_string())
            .attr("from", user.to_string())
            .append(inner)
            .build();
        Packet::from_element(elem).ok()
    }

    /// Resolve the account a pre-session request concerns: the route's
    /// node if present, otherwise the `<username/>` field plus the host.
    fn owner_of(user: &Jid, query: &Element) -> Option<BareJid> {
        if user.node().is_some() {
            return Some(user.to_bare());
        }
        let username = query.get_child("username", ns::REGISTER)?.text();
        let username = username.trim().to_lowercase();
        if username.is_empty() {
            return None;
        }
        format!("{}@{}", username, user.domain()).parse().ok()
    }

    /// Persist the registration record alongside the credential.
    async fn store_record(sm: &SessionManager, owner: &BareJid) {
        let record = Element::builder("query", ns::REGISTER)
            .append(
                Element::builder("username", ns::REGISTER)
                    .append(
                        owner
                            .node()
                            .map(|node| node.as_str().to_string())
                            .unwrap_or_default(),
                    )
                    .build(),
            )
            .attr("stamp", stanza::timestamp())
            .build();
        let owner = Jid::from(owner.clone());
        if let Err(err) = sm.xdb().set(&owner, ns::REGISTER, Some(record)).await {
            debug!(error = %err, "registration record save failed");
        }
    }
}

#[async_trait]
impl Module for RegisterModule {
    fn name(&self) -> &'static str {
        "register"
    }

    fn features(&self) -> &'static [&'static str] {
        &[ns::REGISTER]
    }

    /// Pre-session registration exchange from a connector.
    async fn register(
        &self,
        sm: &SessionManager,
        packet: Packet,
        outbox: &mut Vec<Packet>,
    ) -> ModOutcome {
        let conn = match packet.from.clone() {
            Some(conn) => conn,
            None => return ModOutcome::Ignore(packet),
        };
        let user = packet.to.clone();
        let iq = match packet.elem.children().next() {
            Some(iq) if iq.name() == "iq" => iq.clone(),
            _ => return ModOutcome::Ignore(packet),
        };
        let query = match iq.get_child("query", ns::REGISTER) {
            Some(query) => query.clone(),
            None => return ModOutcome::Ignore(packet),
        };

        match iq.attr("type") {
            Some("get") => {
                let fields = Element::builder("query", ns::REGISTER)
                    .append(
                        Element::builder("instructions", ns::REGISTER)
                            .append("Choose a username and password.".to_string())
                            .build(),
                    )
                    .append(Element::builder("username", ns::REGISTER).build())
                    .append(Element::builder("password", ns::REGISTER).build())
                    .build();
                let mut result = stanza::iq_result(iq);
                result.append_child(fields);
                if let Some(reply) = Self::wrap_auth_route(&conn, &user, result) {
                    outbox.push(reply);
                }
                ModOutcome::Handled
            }
            Some("set") => {
                let owner = match Self::owner_of(&user, &query) {
                    Some(owner) => owner,
                    None => {
                        let reply = stanza::error_reply(iq, StanzaError::NOT_ACCEPTABLE);
                        if let Some(reply) = Self::wrap_auth_route(&conn, &user, reply) {
                            outbox.push(reply);
                        }
                        return ModOutcome::Handled;
                    }
                };

                if query.has_child("remove", ns::REGISTER) {
                    info!(user = %owner, "account removal requested");
                    sm.delete_user(&owner).await;
                    let reply = stanza::iq_result(iq);
                    if let Some(reply) = Self::wrap_auth_route(&conn, &user, reply) {
                        outbox.push(reply);
                    }
                    return ModOutcome::Handled;
                }

                let password = query
                    .get_child("password", ns::REGISTER)
                    .map(|field| field.text());
                let password = match password {
                    Some(ref password) if !password.is_empty() => password.as_str(),
                    _ => {
                        let reply = stanza::error_reply(iq, StanzaError::NOT_ACCEPTABLE);
                        if let Some(reply) = Self::wrap_auth_route(&conn, &user, reply) {
                            outbox.push(reply);
                        }
                        return ModOutcome::Handled;
                    }
                };

                // a taken username refuses a second pre-session create
                let exists = sm
                    .xdb()
                    .get(&Jid::from(owner.clone()), ns::AUTH)
                    .await
                    .ok()
                    .flatten()
                    .is_some();
                if exists {
                    let reply = stanza::error_reply(iq, StanzaError::CONFLICT);
                    if let Some(reply) = Self::wrap_auth_route(&conn, &user, reply) {
                        outbox.push(reply);
                    }
                    return ModOutcome::Handled;
                }

                sm.fire_password_change(&owner, Some(password)).await;
                Self::store_record(sm, &owner).await;
                info!(user = %owner, "account registered");

                let reply = stanza::iq_result(iq);
                if let Some(reply) = Self::wrap_auth_route(&conn, &user, reply) {
                    outbox.push(reply);
                }
                ModOutcome::Handled
            }
            _ => ModOutcome::Ignore(packet),
        }
    }

    async fn session_start(&self, this: Arc<dyn Module>, cx: &mut ModCtx<'_>) {
        if let Some(session) = cx.session() {
            session.out_hooks.push(this);
        }
    }

    /// In-session password change: an iq set in the register namespace
    /// from an authenticated session.
    async fn session_out(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if packet.class != PacketClass::Iq
            || packet.elem.attr("to").is_some()
            || packet.stanza_type() != Some("set")
        {
            return ModOutcome::Ignore(packet);
        }
        let query = match packet.elem.get_child("query", ns::REGISTER) {
            Some(query) => query.clone(),
            None => return ModOutcome::Ignore(packet),
        };
        let password = query
            .get_child("password", ns::REGISTER)
            .map(|field| field.text());
        let owner = cx.user.jid.clone();

        match password {
            Some(ref password) if !password.is_empty() => {
                cx.sm.fire_password_change(&owner, Some(password)).await;
                info!(user = %owner, "password changed");
                cx.send_to_client(stanza::iq_result(packet.elem));
            }
            _ => {
                cx.send_to_client(stanza::error_reply(
                    packet.elem,
                    StanzaError::NOT_ACCEPTABLE,
                ));
            }
        }
        ModOutcome::Handled
    }
}
