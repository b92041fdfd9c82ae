//! Roster entries and the subscription lattice.
//!
//! Subscription state forms the lattice `none ≤ {to, from} ≤ both`. The
//! four transition helpers below are the only way state moves, so every
//! reachable `(subscription, ask)` pair stays inside the table.

use jid::BareJid;
use minidom::Element;

use crate::ns;

/// Subscription state between a user and a roster peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn as_str(self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }

    pub fn from_str(value: Option<&str>) -> Subscription {
        match value {
            Some("to") => Subscription::To,
            Some("from") => Subscription::From,
            Some("both") => Subscription::Both,
            _ => Subscription::None,
        }
    }

    /// The user subscribes to the peer's presence.
    pub fn has_to(self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }

    /// The peer subscribes to the user's presence.
    pub fn has_from(self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }
}

/// Pending outbound request noted on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ask {
    Subscribe,
    Unsubscribe,
}

impl Ask {
    pub fn as_str(self) -> &'static str {
        match self {
            Ask::Subscribe => "subscribe",
            Ask::Unsubscribe => "unsubscribe",
        }
    }
}

/// One roster entry as persisted and pushed.
#[derive(Debug, Clone)]
pub struct RosterItem {
    pub jid: BareJid,
    pub name: Option<String>,
    pub groups: Vec<String>,
    pub subscription: Subscription,
    pub ask: Option<Ask>,

    /// Status text of a queued inbound subscribe request, delivered when a
    /// roster-capable session appears. Empty string for a bare request.
    pub pending_subscribe: Option<String>,

    /// Entries created only to hold a pending request stay hidden from the
    /// client until the user acts on them.
    pub hidden: bool,
}

impl RosterItem {
    pub fn new(jid: BareJid) -> RosterItem {
        RosterItem {
            jid,
            name: None,
            groups: Vec::new(),
            subscription: Subscription::None,
            ask: None,
            pending_subscribe: None,
            hidden: false,
        }
    }

    /// Add the to-direction: the peer granted the user's subscription
    /// (inbound `subscribed`).
    pub fn add_to(&mut self) -> bool {
        self.ask = None;
        match self.subscription {
            Subscription::None => {
                self.subscription = Subscription::To;
                true
            }
            Subscription::From => {
                self.subscription = Subscription::Both;
                true
            }
            _ => false,
        }
    }

    /// Add the from-direction: the user granted the peer's subscription
    /// (outbound `subscribed`).
    pub fn add_from(&mut self) -> bool {
        self.pending_subscribe = None;
        self.hidden = false;
        match self.subscription {
            Subscription::None => {
                self.subscription = Subscription::From;
                true
            }
            Subscription::To => {
                self.subscription = Subscription::Both;
                true
            }
            _ => false,
        }
    }

    /// Remove the to-direction: the peer revoked the user's subscription
    /// (inbound `unsubscribed`).
    pub fn remove_to(&mut self) -> bool {
        self.ask = None;
        match self.subscription {
            Subscription::Both => {
                self.subscription = Subscription::From;
                true
            }
            Subscription::To => {
                self.subscription = Subscription::None;
                true
            }
            _ => false,
        }
    }

    /// Remove the from-direction: the user revoked the peer's subscription
    /// (outbound `unsubscribed`, or an inbound `unsubscribe`).
    pub fn remove_from(&mut self) -> bool {
        self.pending_subscribe = None;
        match self.subscription {
            Subscription::Both => {
                self.subscription = Subscription::To;
                true
            }
            Subscription::From => {
                self.subscription = Subscription::None;
                true
            }
            _ => false,
        }
    }

    /// Whether the entry appears in rosters sent to the client.
    pub fn visible(&self) -> bool {
        !self.hidden
            && (self.subscription != Subscription::None
                || self.ask.is_some()
                || self.name.is_some()
                || !self.groups.is_empty())
    }

    /// Client-facing item: hidden bookkeeping stripped.
    pub fn to_push_element(&self) -> Element {
        let mut builder = Element::builder("item", ns::ROSTER)
            .attr("jid", self.jid.to_string())
            .attr("subscription", self.subscription.as_str());
        if let Some(ref name) = self.name {
            builder = builder.attr("name", name.clone());
        }
        if let Some(ask) = self.ask {
            builder = builder.attr("ask", ask.as_str());
        }
        for group in &self.groups {
            builder = builder.append(
                Element::builder("group", ns::ROSTER)
                    .append(group.clone())
                    .build(),
            );
        }
        builder.build()
    }

    /// Storage form: push form plus the server-side flags.
    pub fn to_storage_element(&self) -> Element {
        let mut elem = self.to_push_element();
        if let Some(ref pending) = self.pending_subscribe {
            elem.set_attr("subscribe", pending.clone());
        }
        if self.hidden {
            elem.set_attr("hidden", "");
        }
        elem
    }

    pub fn from_element(elem: &Element) -> Option<RosterItem> {
        let jid: BareJid = elem.attr("jid")?.parse().ok()?;
        Some(RosterItem {
            jid,
            name: elem.attr("name").map(str::to_owned),
            groups: elem
                .children()
                .filter(|child| child.name() == "group")
                .map(|child| child.text())
                .collect(),
            subscription: Subscription::from_str(elem.attr("subscription")),
            ask: match elem.attr("ask") {
                Some("subscribe") => Some(Ask::Subscribe),
                Some("unsubscribe") => Some(Ask::Unsubscribe),
                _ => None,
            },
            pending_subscribe: elem.attr("subscribe").map(str::to_owned),
            hidden: elem.attr("hidden").is_some(),
        })
    }
}

/// A user's roster, cached on the user record once loaded.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub items: Vec<RosterItem>,
}

impl Roster {
    pub fn from_element(elem: &Element) -> Roster {
        Roster {
            items: elem
                .children()
                .filter(|child| child.name() == "item")
                .filter_map(RosterItem::from_element)
                .collect(),
        }
    }

    /// Storage form of the whole roster.
    pub fn to_storage_element(&self) -> Element {
        let mut builder = Element::builder("query", ns::ROSTER);
        for item in &self.items {
            builder = builder.append(item.to_storage_element());
        }
        builder.build()
    }

    pub fn item(&self, jid: &BareJid) -> Option<&RosterItem> {
        self.items.iter().find(|item| &item.jid == jid)
    }

    pub fn item_mut(&mut self, jid: &BareJid) -> Option<&mut RosterItem> {
        self.items.iter_mut().find(|item| &item.jid == jid)
    }

    /// Find or create the entry for a peer.
    pub fn ensure_item(&mut self, jid: &BareJid) -> &mut RosterItem {
        if let Some(index) = self.items.iter().position(|item| &item.jid == jid) {
            &mut self.items[index]
        } else {
            self.items.push(RosterItem::new(jid.clone()));
            self.items.last_mut().unwrap()
        }
    }

    pub fn remove(&mut self, jid: &BareJid) -> bool {
        let before = self.items.len();
        self.items.retain(|item| &item.jid != jid);
        self.items.len() < before
    }

    /// Peers subscribed to the user's presence.
    pub fn presence_subscribers(&self) -> impl Iterator<Item = &RosterItem> {
        self.items.iter().filter(|item| item.subscription.has_from())
    }

    /// Peers whose presence the user subscribes to.
    pub fn presence_subscriptions(&self) -> impl Iterator<Item = &RosterItem> {
        self.items.iter().filter(|item| item.subscription.has_to())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> BareJid {
        "b@h2".parse().unwrap()
    }

    #[test]
    fn test_subscription_lattice() {
        let mut item = RosterItem::new(peer());

        // none --add_to (inbound subscribed)--> to
        assert!(item.add_to());
        assert_eq!(item.subscription, Subscription::To);

        // to --add_from (outbound subscribed)--> both
        assert!(item.add_from());
        assert_eq!(item.subscription, Subscription::Both);

        // both --remove_to (inbound unsubscribed)--> from
        assert!(item.remove_to());
        assert_eq!(item.subscription, Subscription::From);

        // from --remove_from (outbound unsubscribed)--> none
        assert!(item.remove_from());
        assert_eq!(item.subscription, Subscription::None);

        // none --add_from--> from
        assert!(item.add_from());
        assert_eq!(item.subscription, Subscription::From);

        // from --add_to--> both
        assert!(item.add_to());
        assert_eq!(item.subscription, Subscription::Both);

        // both --remove_from--> to
        assert!(item.remove_from());
        assert_eq!(item.subscription, Subscription::To);

        // to --remove_to--> none
        assert!(item.remove_to());
        assert_eq!(item.subscription, Subscription::None);
    }

    #[test]
    fn test_transitions_clear_ask() {
        let mut item = RosterItem::new(peer());
        item.ask = Some(Ask::Subscribe);
        item.add_to();
        assert!(item.ask.is_none());

        item.ask = Some(Ask::Unsubscribe);
        item.remove_to();
        assert!(item.ask.is_none());
    }

    #[test]
    fn test_unchanged_transition_reports_false() {
        let mut item = RosterItem::new(peer());
        item.subscription = Subscription::Both;
        assert!(!item.add_to());
        assert!(!item.add_from());
        assert_eq!(item.subscription, Subscription::Both);
    }

    #[test]
    fn test_visibility_rules() {
        let mut item = RosterItem::new(peer());
        item.hidden = true;
        item.pending_subscribe = Some(String::new());
        assert!(!item.visible());

        let mut item = RosterItem::new(peer());
        item.subscription = Subscription::To;
        assert!(item.visible());

        // bare none entry with nothing else has no business in a push
        let item = RosterItem::new(peer());
        assert!(!item.visible());
    }

    #[test]
    fn test_storage_round_trip() {
        let mut roster = Roster::default();
        let item = roster.ensure_item(&peer());
        item.name = Some("Bea".into());
        item.groups.push("Friends".into());
        item.subscription = Subscription::To;
        item.ask = Some(Ask::Subscribe);
        item.pending_subscribe = Some("hello".into());
        item.hidden = true;

        let stored = roster.to_storage_element();
        let reloaded = Roster::from_element(&stored);
        let item = reloaded.item(&peer()).unwrap();
        assert_eq!(item.name.as_deref(), Some("Bea"));
        assert_eq!(item.groups, vec!["Friends".to_string()]);
        assert_eq!(item.subscription, Subscription::To);
        assert_eq!(item.ask, Some(Ask::Subscribe));
        assert_eq!(item.pending_subscribe.as_deref(), Some("hello"));
        assert!(item.hidden);
    }

    #[test]
    fn test_push_element_strips_server_flags() {
        let mut item = RosterItem::new(peer());
        item.pending_subscribe = Some("hi".into());
        item.hidden = true;
        let pushed = item.to_push_element();
        assert!(pushed.attr("subscribe").is_none());
        assert!(pushed.attr("hidden").is_none());
    }
}
