//! Service discovery and the legacy browse tree for the server JID.

use std::sync::Arc;

use async_trait::async_trait;
use jid::BareJid;
use minidom::Element;

use crate::ns;
use crate::sm::modules::{ModOutcome, Module};
use crate::sm::SessionManager;
use crate::stanza::{self, Packet, PacketClass};

/// One advertised service, shared by disco#items and browse.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub jid: String,
    pub name: Option<String>,
    pub category: String,
    pub service_type: String,
    /// Entries visible only to configured administrators.
    pub admin_only: bool,
}

/// Directory configuration the discovery surfaces answer from.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub entries: Vec<ServiceEntry>,
    pub admins: Vec<BareJid>,
}

impl Directory {
    fn is_admin(&self, requester: Option<&jid::Jid>) -> bool {
        match requester {
            Some(jid) => {
                let bare = jid.to_bare();
                self.admins.iter().any(|admin| admin == &bare)
            }
            None => false,
        }
    }

    fn visible_entries(&self, requester: Option<&jid::Jid>) -> Vec<&ServiceEntry> {
        let admin = self.is_admin(requester);
        self.entries
            .iter()
            .filter(|entry| admin || !entry.admin_only)
            .collect()
    }
}

/// Answers disco#info and disco#items on the server JID (XEP-0030).
pub struct DiscoModule {
    directory: Directory,
}

impl DiscoModule {
    pub fn new(directory: Directory) -> Arc<DiscoModule> {
        Arc::new(DiscoModule { directory })
    }
}

#[async_trait]
impl Module for DiscoModule {
    fn name(&self) -> &'static str {
        "disco"
    }

    fn features(&self) -> &'static [&'static str] {
        &[ns::DISCO_INFO, ns::DISCO_ITEMS]
    }

    async fn server(
        &self,
        sm: &SessionManager,
        packet: Packet,
        outbox: &mut Vec<Packet>,
    ) -> ModOutcome {
        if packet.class != PacketClass::Iq || packet.stanza_type() != Some("get") {
            return ModOutcome::Ignore(packet);
        }

        if packet.elem.has_child("query", ns::DISCO_INFO) {
            let mut query = Element::builder("query", ns::DISCO_INFO).append(
                Element::builder("identity", ns::DISCO_INFO)
                    .attr("category", "server")
                    .attr("type", "im")
                    .attr("name", sm.config().server_name.clone())
                    .build(),
            );
            for feature in sm.features() {
                query = query.append(
                    Element::builder("feature", ns::DISCO_INFO)
                        .attr("var", feature)
                        .build(),
                );
            }
            let mut result = stanza::iq_result(packet.elem);
            result.append_child(query.build());
            if let Ok(reply) = Packet::from_element(result) {
                outbox.push(reply);
            }
            return ModOutcome::Handled;
        }

        if packet.elem.has_child("query", ns::DISCO_ITEMS) {
            let requester = packet.from.clone();
            let mut query = Element::builder("query", ns::DISCO_ITEMS);
            for entry in self.directory.visible_entries(requester.as_ref()) {
                let mut item = Element::builder("item", ns::DISCO_ITEMS)
                    .attr("jid", entry.jid.clone());
                if let Some(ref name) = entry.name {
                    item = item.attr("name", name.clone());
                }
                query = query.append(item.build());
            }
            let mut result = stanza::iq_result(packet.elem);
            result.append_child(query.build());
            if let Ok(reply) = Packet::from_element(result) {
                outbox.push(reply);
            }
            return ModOutcome::Handled;
        }

        ModOutcome::Ignore(packet)
    }
}

/// Answers the legacy browse query (XEP-0011) with the configured tree.
pub struct BrowseModule {
    directory: Directory,
}

impl BrowseModule {
    pub fn new(directory: Directory) -> Arc<BrowseModule> {
        Arc::new(BrowseModule { directory })
    }
}

#[async_trait]
impl Module for BrowseModule {
    fn name(&self) -> &'static str {
        "browse"
    }

    fn features(&self) -> &'static [&'static str] {
        &[ns::BROWSE]
    }

    async fn server(
        &self,
        sm: &SessionManager,
        packet: Packet,
        outbox: &mut Vec<Packet>,
    ) -> ModOutcome {
        let browse_query = packet.elem.has_child("item", ns::BROWSE)
            || packet.elem.has_child("query", ns::BROWSE);
        if packet.class != PacketClass::Iq
            || packet.stanza_type() != Some("get")
            || !browse_query
        {
            return ModOutcome::Ignore(packet);
        }

        let requester = packet.from.clone();
        let mut root = Element::builder("item", ns::BROWSE)
            .attr("category", "server")
            .attr("type", "im")
            .attr("jid", packet.host().to_string())
            .attr("name", sm.config().server_name.clone());
        for entry in self.directory.visible_entries(requester.as_ref()) {
            let mut item = Element::builder("item", ns::BROWSE)
                .attr("category", entry.category.clone())
                .attr("type", entry.service_type.clone())
                .attr("jid", entry.jid.clone());
            if let Some(ref name) = entry.name {
                item = item.attr("name", name.clone());
            }
            root = root.append(item.build());
        }
        for feature in sm.features() {
            root = root.append(
                Element::builder("ns", ns::BROWSE)
                    .append(feature.to_string())
                    .build(),
            );
        }

        let mut result = stanza::iq_result(packet.elem);
        result.append_child(root.build());
        if let Ok(reply) = Packet::from_element(result) {
            outbox.push(reply);
        }
        ModOutcome::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Directory {
        Directory {
            entries: vec![
                ServiceEntry {
                    jid: "conference.h".into(),
                    name: Some("Chatrooms".into()),
                    category: "conference".into(),
                    service_type: "text".into(),
                    admin_only: false,
                },
                ServiceEntry {
                    jid: "admin.h".into(),
                    name: None,
                    category: "service".into(),
                    service_type: "admin".into(),
                    admin_only: true,
                },
            ],
            admins: vec!["boss@h".parse().unwrap()],
        }
    }

    #[test]
    fn test_acl_filters_admin_entries() {
        let directory = directory();
        let anon: jid::Jid = "someone@h".parse().unwrap();
        let admin: jid::Jid = "boss@h/desk".parse().unwrap();

        let visible = directory.visible_entries(Some(&anon));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].jid, "conference.h");

        let visible = directory.visible_entries(Some(&admin));
        assert_eq!(visible.len(), 2);

        assert_eq!(directory.visible_entries(None).len(), 1);
    }
}
