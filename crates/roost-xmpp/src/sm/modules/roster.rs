//! Roster queries, roster pushes, and the subscription state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, trace};

use crate::ns;
use crate::sm::modules::{ModCtx, ModOutcome, Module};
use crate::sm::roster::{Ask, RosterItem, Subscription};
use crate::stanza::{self, Packet, PacketClass};

/// Implements `jabber:iq:roster` and presence subscription handling.
#[derive(Default)]
pub struct RosterModule {
    push_seq: AtomicU64,
}

impl RosterModule {
    pub fn new() -> Arc<RosterModule> {
        Arc::new(RosterModule::default())
    }

    /// Push one changed item to every roster-capable session.
    fn push_item(&self, cx: &mut ModCtx<'_>, item: &RosterItem, removed: bool) {
        let mut pushed = item.to_push_element();
        if removed {
            pushed.set_attr("subscription", "remove");
            pushed.set_attr("ask", None::<String>);
        }
        let id = self.push_seq.fetch_add(1, Ordering::Relaxed);
        let bare = cx.user.jid.clone();
        let targets: Vec<String> = cx
            .user
            .sessions
            .iter()
            .filter(|session| session.roster_requested)
            .map(|session| session.resource().to_string())
            .collect();
        for resource in targets {
            let push = Element::builder("iq", ns::SERVER)
                .attr("type", "set")
                .attr("id", format!("roster-push-{}", id))
                .attr("from", bare.to_string())
                .append(
                    Element::builder("query", ns::ROSTER)
                        .append(pushed.clone())
                        .build(),
                )
                .build();
            cx.send_to_session(&resource, push);
        }
    }

    /// Roster iq from one of the user's own sessions.
    async fn out_iq(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        match packet.stanza_type() {
            Some("get") => {
                cx.sm.load_roster(cx.user).await;
                if let Some(session) = cx.session() {
                    session.roster_requested = true;
                }

                let (visible, pending) = {
                    let roster = cx.user.roster.as_ref().expect("roster just loaded");
                    let visible: Vec<Element> = roster
                        .items
                        .iter()
                        .filter(|item| item.visible())
                        .map(|item| item.to_push_element())
                        .collect();
                    // subscription requests queued while nobody was
                    // around to see them get redelivered below
                    let pending: Vec<(BareJid, String)> = roster
                        .items
                        .iter()
                        .filter_map(|item| {
                            item.pending_subscribe
                                .as_ref()
                                .map(|status| (item.jid.clone(), status.clone()))
                        })
                        .collect();
                    (visible, pending)
                };

                let mut query = Element::builder("query", ns::ROSTER);
                for item in visible {
                    query = query.append(item);
                }
                let mut result = stanza::iq_result(packet.elem);
                result.append_child(query.build());
                cx.send_to_client(result);
                let user_jid = Jid::from(cx.user.jid.clone());
                for (peer, status) in pending {
                    let status = if status.is_empty() {
                        None
                    } else {
                        Some(status.as_str())
                    };
                    let request = stanza::presence_new(
                        Some("subscribe"),
                        &user_jid,
                        &Jid::from(peer),
                        status,
                    );
                    cx.send_to_client(request);
                }
                ModOutcome::Handled
            }
            Some("set") => {
                cx.sm.load_roster(cx.user).await;
                let user_bare = cx.user.jid.clone();
                let user_jid = Jid::from(user_bare.clone());

                let items: Vec<Element> = packet
                    .elem
                    .get_child("query", ns::ROSTER)
                    .map(|query| query.children().cloned().collect())
                    .unwrap_or_default();

                for incoming in items {
                    let peer: BareJid = match incoming.attr("jid").and_then(|j| j.parse().ok()) {
                        Some(peer) => peer,
                        None => continue,
                    };
                    if peer == user_bare {
                        continue;
                    }

                    if incoming.attr("subscription") == Some("remove") {
                        let item = {
                            let roster = cx.user.roster.as_mut().expect("roster loaded");
                            match roster.item(&peer) {
                                Some(item) => item.clone(),
                                None => continue,
                            }
                        };
                        // cancel both directions before dropping the entry
                        if item.subscription.has_to() || item.ask == Some(Ask::Subscribe) {
                            cx.send(stanza::presence_new(
                                Some("unsubscribe"),
                                &Jid::from(peer.clone()),
                                &user_jid,
                                None,
                            ));
                        }
                        if item.subscription.has_from() {
                            cx.send(stanza::presence_new(
                                Some("unsubscribed"),
                                &Jid::from(peer.clone()),
                                &user_jid,
                                None,
                            ));
                        }
                        cx.user
                            .roster
                            .as_mut()
                            .expect("roster loaded")
                            .remove(&peer);
                        let mut removed = RosterItem::new(peer);
                        removed.subscription = Subscription::None;
                        self.push_item(cx, &removed, true);
                        continue;
                    }

                    let updated = {
                        let roster = cx.user.roster.as_mut().expect("roster loaded");
                        let item = roster.ensure_item(&peer);
                        item.name = incoming.attr("name").map(str::to_owned);
                        item.groups = incoming
                            .children()
                            .filter(|child| child.name() == "group")
                            .map(|child| child.text())
                            .collect();
                        item.hidden = false;
                        item.clone()
                    };
                    self.push_item(cx, &updated, false);
                }

                cx.send_to_client(stanza::iq_result(packet.elem));
                cx.sm.save_roster(cx.user).await;
                ModOutcome::Handled
            }
            // results are acks of our own pushes
            Some("result") => ModOutcome::Handled,
            _ => ModOutcome::Ignore(packet),
        }
    }

    /// Subscription stanza sent by one of the user's own sessions.
    async fn out_s10n(&self, cx: &mut ModCtx<'_>, mut packet: Packet) -> ModOutcome {
        let peer = packet.to.to_bare();
        let user_bare = cx.user.jid.clone();
        if peer == user_bare {
            return ModOutcome::Pass(packet);
        }

        cx.sm.load_roster(cx.user).await;
        let mut probe_peer = false;
        let mut drop_stanza = false;
        let changed = {
            let roster = cx.user.roster.as_mut().expect("roster loaded");
            let had_item = roster.item(&peer).is_some();
            match packet.stanza_type() {
                Some("subscribe") => {
                    let item = roster.ensure_item(&peer);
                    if item.subscription.has_to() || item.ask == Some(Ask::Subscribe) {
                        // repeated requests stay idempotent: one push, one
                        // outbound subscribe
                        drop_stanza = item.ask == Some(Ask::Subscribe);
                        None
                    } else {
                        item.ask = Some(Ask::Subscribe);
                        Some(item.clone())
                    }
                }
                Some("subscribed") => {
                    let item = roster.ensure_item(&peer);
                    item.add_from();
                    probe_peer = true;
                    Some(item.clone())
                }
                Some("unsubscribe") => {
                    let has_to = {
                        let item = roster.ensure_item(&peer);
                        item.subscription.has_to()
                    };
                    if has_to {
                        let item = roster.item_mut(&peer).expect("item just ensured");
                        item.ask = Some(Ask::Unsubscribe);
                        Some(item.clone())
                    } else {
                        if !had_item {
                            roster.remove(&peer);
                            drop_stanza = true;
                        }
                        None
                    }
                }
                Some("unsubscribed") => {
                    let (has_from, hidden) = {
                        let item = roster.ensure_item(&peer);
                        (item.subscription.has_from(), item.hidden)
                    };
                    if has_from {
                        let item = roster.item_mut(&peer).expect("item just ensured");
                        item.remove_from();
                        Some(item.clone())
                    } else if hidden {
                        roster.remove(&peer);
                        None
                    } else {
                        let item = roster.item_mut(&peer).expect("item just ensured");
                        item.pending_subscribe = None;
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(ref item) = changed {
            self.push_item(cx, item, false);
        }
        cx.sm.save_roster(cx.user).await;

        let user_jid = Jid::from(user_bare);
        if probe_peer {
            // deliver ourselves a probe on the peer's behalf, so the newly
            // granted subscriber learns our presence immediately
            cx.send(stanza::presence_new(
                Some("probe"),
                &user_jid,
                &Jid::from(peer),
                None,
            ));
        }

        if drop_stanza {
            return ModOutcome::Handled;
        }
        // subscription stanzas leave as the bare user, not the resource
        packet.set_from(user_jid);
        ModOutcome::Pass(packet)
    }

    /// Subscription stanza arriving from a peer.
    async fn in_s10n(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        let peer = match packet.from.as_ref() {
            Some(from) => from.to_bare(),
            None => return ModOutcome::Ignore(packet),
        };
        let user_bare = cx.user.jid.clone();
        if peer == user_bare {
            return ModOutcome::Pass(packet);
        }

        cx.sm.load_roster(cx.user).await;
        let user_jid = Jid::from(user_bare.clone());
        let peer_jid = Jid::from(peer.clone());

        let mut forward = false;
        let mut auto_reply: Option<&'static str> = None;
        let mut announce_presence = false;
        let mut push: Option<RosterItem> = None;

        {
            let roster = cx.user.roster.as_mut().expect("roster loaded");
            let had_item = roster.item(&peer).is_some();
            match packet.stanza_type() {
                Some("subscribe") => {
                    let item = roster.ensure_item(&peer);
                    if item.subscription.has_from() {
                        // already subscribed: answer for the user
                        auto_reply = Some("subscribed");
                        announce_presence = true;
                    } else {
                        let status = packet
                            .elem
                            .children()
                            .find(|child| child.name() == "status")
                            .map(|child| child.text())
                            .unwrap_or_default();
                        item.pending_subscribe = Some(status);
                        if !had_item {
                            item.hidden = true;
                        }
                        forward = true;
                    }
                }
                Some("subscribed") => {
                    let item = roster.ensure_item(&peer);
                    if !item.subscription.has_to() {
                        if item.add_to() {
                            push = Some(item.clone());
                        }
                        forward = true;
                    }
                }
                Some("unsubscribe") => {
                    auto_reply = Some("unsubscribed");
                    let (has_from, hidden) = {
                        let item = roster.ensure_item(&peer);
                        (item.subscription.has_from(), item.hidden)
                    };
                    if has_from {
                        roster
                            .item_mut(&peer)
                            .expect("item just ensured")
                            .remove_from();
                        if hidden {
                            roster.remove(&peer);
                        } else {
                            push = roster.item(&peer).cloned();
                        }
                        forward = true;
                    } else if !had_item {
                        roster.remove(&peer);
                    }
                }
                Some("unsubscribed") => {
                    let wants = {
                        let item = roster.ensure_item(&peer);
                        item.subscription.has_to() || item.ask.is_some()
                    };
                    if wants {
                        let item = roster.item_mut(&peer).expect("item just ensured");
                        item.remove_to();
                        push = Some(item.clone());
                        forward = true;
                    } else if !had_item {
                        roster.remove(&peer);
                    }
                }
                _ => {}
            }
        }

        if let Some(ref item) = push {
            self.push_item(cx, item, false);
        }
        cx.sm.save_roster(cx.user).await;

        if let Some(reply) = auto_reply {
            cx.send(stanza::presence_new(Some(reply), &peer_jid, &user_jid, None));
        }
        if announce_presence {
            // the peer is re-adding us; let them see current presence
            let presences: Vec<Element> = cx
                .user
                .available_sessions()
                .filter_map(|session| {
                    session.presence.as_ref().map(|presence| {
                        let mut presence = presence.clone();
                        presence.set_attr("to", peer_jid.to_string());
                        presence.set_attr("from", session.full.to_string());
                        presence
                    })
                })
                .collect();
            for presence in presences {
                cx.send(presence);
            }
        }

        if forward {
            // hand the request to the primary roster-capable session
            let target = cx
                .user
                .primary()
                .filter(|session| session.roster_requested)
                .map(|session| session.resource().to_string());
            match target {
                Some(resource) => {
                    trace!(peer = %peer, "forwarding subscription stanza to session");
                    cx.send_to_session(&resource, packet.elem);
                }
                None => debug!(peer = %peer, "no roster-capable session, request queued"),
            }
        }
        ModOutcome::Handled
    }
}

#[async_trait]
impl Module for RosterModule {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn features(&self) -> &'static [&'static str] {
        &[ns::ROSTER]
    }

    async fn session_start(&self, this: Arc<dyn Module>, cx: &mut ModCtx<'_>) {
        if let Some(session) = cx.session() {
            session.out_hooks.push(this);
        }
    }

    async fn session_out(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        match packet.class {
            PacketClass::Iq => {
                let addressed_to_self = match packet.elem.attr("to") {
                    None => true,
                    Some(to) => to
                        .parse::<Jid>()
                        .map(|to| to.to_bare() == cx.user.jid)
                        .unwrap_or(false),
                };
                if addressed_to_self && packet.elem.has_child("query", ns::ROSTER) {
                    self.out_iq(cx, packet).await
                } else {
                    ModOutcome::Ignore(packet)
                }
            }
            PacketClass::S10n => self.out_s10n(cx, packet).await,
            _ => ModOutcome::Ignore(packet),
        }
    }

    async fn deliver(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if packet.class == PacketClass::S10n {
            self.in_s10n(cx, packet).await
        } else {
            ModOutcome::Ignore(packet)
        }
    }
}
