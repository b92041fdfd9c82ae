//! Digest authentication over the legacy auth namespace.
//!
//! Only the digest mechanism is offered: the client hashes the stream id
//! concatenated with the password. Cleartext passwords are neither
//! advertised nor accepted.

use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::Element;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::error::{StanzaError, XmppError};
use crate::ns;
use crate::sm::modules::{ModOutcome, Module};
use crate::sm::SessionManager;
use crate::stanza::{self, Packet};

/// Lowercase hex SHA1 of `seed || secret`, as used by both the component
/// handshake and digest authentication.
pub fn digest_hex(seed: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(seed.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Implements `jabber:iq:auth` get/set exchanges.
#[derive(Default)]
pub struct AuthModule;

impl AuthModule {
    pub fn new() -> Arc<AuthModule> {
        Arc::new(AuthModule::default())
    }

    /// Load the stored password for a user, if any.
    async fn stored_password(sm: &SessionManager, owner: &Jid) -> Option<String> {
        let record = sm.xdb().get(owner, ns::AUTH).await.ok().flatten()?;
        let text = record.text();
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
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
}

#[async_trait]
impl Module for AuthModule {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn auth(
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
        if !iq.has_child("query", ns::AUTH) {
            return ModOutcome::Ignore(packet);
        }

        match iq.attr("type") {
            Some("get") => {
                // advertise the digest mechanism only
                let node = user
                    .node()
                    .map(|node| node.as_str().to_string())
                    .unwrap_or_default();
                let query = Element::builder("query", ns::AUTH)
                    .append(
                        Element::builder("username", ns::AUTH)
                            .append(node)
                            .build(),
                    )
                    .append(Element::builder("digest", ns::AUTH).build())
                    .append(Element::builder("resource", ns::AUTH).build())
                    .build();
                let mut result = stanza::iq_result(iq);
                result.append_child(query);
                if let Some(reply) = Self::wrap_auth_route(&conn, &user, result) {
                    outbox.push(reply);
                }
                ModOutcome::Handled
            }
            Some("set") => {
                let query = iq.get_child("query", ns::AUTH).expect("checked above");
                let digest = query.get_child("digest", ns::AUTH);
                let supplied = digest.map(|d| d.text().trim().to_lowercase());
                let stream_id = digest.and_then(|d| d.attr("sid")).unwrap_or_default();

                let authorized = match (supplied, Self::stored_password(sm, &user).await) {
                    (Some(supplied), Some(password)) if !supplied.is_empty() => {
                        supplied == digest_hex(stream_id, &password)
                    }
                    _ => false,
                };

                let reply = if authorized {
                    info!(user = %user, "authentication succeeded");
                    stanza::iq_result(iq)
                } else {
                    debug!(user = %user, "authentication failed");
                    stanza::error_reply(iq, StanzaError::NOT_AUTHORIZED)
                };
                if let Some(reply) = Self::wrap_auth_route(&conn, &user, reply) {
                    outbox.push(reply);
                }
                ModOutcome::Handled
            }
            _ => ModOutcome::Ignore(packet),
        }
    }

    /// Persist credential changes; a `None` password removes the record.
    async fn password_change(
        &self,
        sm: &SessionManager,
        owner: &BareJid,
        password: Option<&str>,
    ) -> Result<(), XmppError> {
        let owner = Jid::from(owner.clone());
        let record = password.map(|password| {
            Element::builder("password", ns::AUTH)
                .append(password.to_string())
                .build()
        });
        sm.xdb().set(&owner, ns::AUTH, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_digest_vector() {
        // SHA1("abcfoo"), forty lowercase hex chars
        let digest = digest_hex("abc", "foo");
        assert_eq!(digest.len(), 40);
        assert_eq!(digest, "980a079c8faf270a4a4dc5898515c3be50401924");
        assert!(digest.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
