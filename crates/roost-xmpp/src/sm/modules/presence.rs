//! Presence storage, broadcast, and probe handling.

use std::sync::Arc;

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use tracing::trace;

use crate::sm::modules::{ModCtx, ModOutcome, Module};
use crate::sm::session::parse_priority;
use crate::stanza::{Packet, PacketClass};

/// Implements the presence side of RFC 3921: storing each session's
/// current presence, broadcasting to subscribers, and answering probes.
#[derive(Default)]
pub struct PresenceModule;

impl PresenceModule {
    pub fn new() -> Arc<PresenceModule> {
        Arc::new(PresenceModule::default())
    }

    /// Broadcast a presence stanza to everyone subscribed to the user.
    async fn broadcast(cx: &mut ModCtx<'_>, presence: &Element) {
        cx.sm.load_roster(cx.user).await;
        let subscribers: Vec<Jid> = cx
            .user
            .roster
            .as_ref()
            .expect("roster loaded")
            .presence_subscribers()
            .map(|item| Jid::from(item.jid.clone()))
            .collect();
        for peer in subscribers {
            let mut copy = presence.clone();
            copy.set_attr("to", peer.to_string());
            cx.send(copy);
        }
    }

    /// Undirected presence from one of the user's sessions.
    async fn out_broadcast(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        let going_available = packet.stanza_type().is_none();
        let going_unavailable = packet.stanza_type() == Some("unavailable");
        if !going_available && !going_unavailable {
            // probes and subscription stanzas are someone else's business
            return ModOutcome::Ignore(packet);
        }

        let priority = parse_priority(&packet.elem);
        let first_available = {
            let session = match cx.session() {
                Some(session) => session,
                None => return ModOutcome::Ignore(packet),
            };
            let was_broadcasting = session.available && session.priority >= 0;
            if going_available {
                session.available = true;
                session.priority = priority;
                session.presence = Some(packet.elem.clone());
            } else {
                session.available = false;
                session.presence = None;
            }
            going_available && !was_broadcasting && priority >= 0
        };

        Self::broadcast(cx, &packet.elem).await;

        if first_available {
            // ask the peers we subscribe to for their presence
            let user_jid = Jid::from(cx.user.jid.clone());
            let peers: Vec<Jid> = cx
                .user
                .roster
                .as_ref()
                .expect("roster loaded")
                .presence_subscriptions()
                .map(|item| Jid::from(item.jid.clone()))
                .collect();
            for peer in peers {
                cx.send(crate::stanza::presence_new(
                    Some("probe"),
                    &peer,
                    &user_jid,
                    None,
                ));
            }
        }
        ModOutcome::Handled
    }

    /// Inbound presence addressed to the user's bare JID.
    async fn in_presence(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        match packet.stanza_type() {
            Some("probe") => {
                let peer = match packet.from.as_ref() {
                    Some(from) => from.to_bare(),
                    None => return ModOutcome::Ignore(packet),
                };
                cx.sm.load_roster(cx.user).await;
                let authorized = cx
                    .user
                    .roster
                    .as_ref()
                    .expect("roster loaded")
                    .item(&peer)
                    .map(|item| item.subscription.has_from())
                    .unwrap_or(false);
                if !authorized {
                    trace!(peer = %peer, "unauthorized presence probe dropped");
                    return ModOutcome::Handled;
                }
                let replies: Vec<Element> = cx
                    .user
                    .available_sessions()
                    .filter_map(|session| {
                        session.presence.as_ref().map(|presence| {
                            let mut copy = presence.clone();
                            copy.set_attr("to", peer.to_string());
                            copy.set_attr("from", session.full.to_string());
                            copy
                        })
                    })
                    .collect();
                for reply in replies {
                    cx.send(reply);
                }
                ModOutcome::Handled
            }
            None | Some("unavailable") => {
                // fan presence of a peer out to every available session
                let targets: Vec<String> = cx
                    .user
                    .available_sessions()
                    .map(|session| session.resource().to_string())
                    .collect();
                for resource in targets {
                    cx.send_to_session(&resource, packet.elem.clone());
                }
                ModOutcome::Handled
            }
            _ => ModOutcome::Ignore(packet),
        }
    }
}

#[async_trait]
impl Module for PresenceModule {
    fn name(&self) -> &'static str {
        "presence"
    }

    async fn session_start(&self, this: Arc<dyn Module>, cx: &mut ModCtx<'_>) {
        if let Some(session) = cx.session() {
            session.out_hooks.push(Arc::clone(&this));
            session.end_hooks.push(this);
        }
    }

    async fn session_out(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if packet.class == PacketClass::Presence && packet.elem.attr("to").is_none() {
            self.out_broadcast(cx, packet).await
        } else {
            ModOutcome::Ignore(packet)
        }
    }

    async fn session_end(&self, cx: &mut ModCtx<'_>) {
        // an available session leaving is an unavailable broadcast
        let last_presence = cx
            .session()
            .filter(|session| session.available)
            .map(|session| session.full.clone());
        if let Some(full) = last_presence {
            let unavailable = Element::builder("presence", crate::ns::SERVER)
                .attr("type", "unavailable")
                .attr("from", full.to_string())
                .build();
            Self::broadcast(cx, &unavailable).await;
        }
    }

    async fn deliver(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if packet.class == PacketClass::Presence {
            self.in_presence(cx, packet).await
        } else {
            ModOutcome::Ignore(packet)
        }
    }
}
