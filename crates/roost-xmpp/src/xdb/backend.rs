//! In-memory XDB storage component.
//!
//! Honors the `<xdb/>` wire contract: namespace-keyed XML fragments per
//! bare JID, `get`/`set` plus the `insert` and `check` actions with their
//! `match` selector. This is the reference backend for tests and small
//! deployments; a spool-backed store implements the same contract out of
//! process.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use minidom::{Element, Node};
use tracing::{debug, trace};

use crate::router::{HandlerOutcome, HandlerPhase, Instance, PacketHandler, Router};
use crate::stanza::{self, Packet, PacketClass};

/// Storage component keeping namespace-tagged trees in memory.
pub struct MemoryXdb {
    router: Router,
    store: DashMap<(String, String), Element>,
}

impl MemoryXdb {
    pub fn new(router: Router) -> Arc<MemoryXdb> {
        Arc::new(MemoryXdb {
            router,
            store: DashMap::new(),
        })
    }

    /// Register this store as the instance's terminal handler.
    pub fn attach(self: &Arc<Self>, instance: &Instance) {
        instance.register_handler(
            HandlerPhase::Deliver,
            Arc::clone(self) as Arc<dyn PacketHandler>,
        );
    }

    fn key(&self, packet: &Packet, namespace: &str) -> (String, String) {
        (
            packet.to.to_bare().to_string(),
            namespace.to_string(),
        )
    }

    /// Apply a request to the store. Returns true on success; the reply
    /// carries `type="result"` or `type="error"` accordingly.
    fn apply(&self, packet: &Packet, namespace: &str) -> bool {
        let key = self.key(packet, namespace);
        let elem = &packet.elem;

        match elem.attr("type") {
            Some("get") => true,
            Some("set") => match elem.attr("action") {
                None => {
                    let payload = elem.children().next().cloned();
                    match payload {
                        Some(root) => {
                            self.store.insert(key, root);
                        }
                        None => {
                            self.store.remove(&key);
                        }
                    }
                    true
                }
                Some("insert") => {
                    let matcher = elem.attr("match").or_else(|| elem.attr("matchpath"));
                    let mut root = self
                        .store
                        .remove(&key)
                        .map(|(_, root)| root)
                        .unwrap_or_else(|| Element::builder("xdb", namespace).build());
                    if let Some(matcher) = matcher {
                        remove_matching(&mut root, matcher);
                    }
                    for child in elem.children() {
                        root.append_child(child.clone());
                    }
                    self.store.insert(key, root);
                    true
                }
                Some("check") => {
                    let matcher = elem.attr("match").or_else(|| elem.attr("matchpath"));
                    let payload_text = elem
                        .children()
                        .next()
                        .map(|child| child.text())
                        .unwrap_or_default();
                    let stored = self.store.get(&key);
                    let selected_text = stored.as_ref().and_then(|root| match matcher {
                        Some(matcher) => select(root.value(), matcher).map(|node| node.text()),
                        None => Some(root.value().text()),
                    });
                    selected_text.as_deref() == Some(payload_text.as_str())
                }
                Some(other) => {
                    debug!(action = %other, "unsupported xdb action");
                    false
                }
            },
            _ => false,
        }
    }

}

#[async_trait]
impl PacketHandler for MemoryXdb {
    async fn handle(&self, packet: Packet) -> HandlerOutcome {
        if packet.class != PacketClass::Xdb {
            return HandlerOutcome::Pass(packet);
        }
        if matches!(packet.stanza_type(), Some("result") | Some("error")) {
            // replies are not ours to answer
            return HandlerOutcome::Done;
        }
        let namespace = match packet.elem.attr("ns") {
            Some(namespace) => namespace.to_string(),
            None => {
                debug!("xdb request without ns attribute");
                return match packet.into_bounce(crate::error::StanzaError::BAD_REQUEST) {
                    Some(bounce) => {
                        self.router.deliver(bounce).await;
                        HandlerOutcome::Done
                    }
                    None => HandlerOutcome::Done,
                };
            }
        };

        trace!(
            owner = %packet.to,
            ns = %namespace,
            xdb_type = ?packet.stanza_type(),
            "xdb request"
        );

        let ok = self.apply(&packet, &namespace);
        let data = if ok && packet.stanza_type() == Some("get") {
            self.store
                .get(&self.key(&packet, &namespace))
                .map(|stored| stored.value().clone())
        } else {
            None
        };

        let mut reply = packet.elem;
        if let Some(mut data) = data {
            data.set_attr("xdbns", None::<String>);
            reply.append_child(data);
        }
        stanza::swap_to_from(&mut reply);
        reply.set_attr("type", if ok { "result" } else { "error" });
        match Packet::from_element(reply) {
            Ok(reply) => self.router.deliver(reply).await,
            Err(err) => debug!(error = %err, "unroutable xdb reply dropped"),
        }
        HandlerOutcome::Done
    }
}

/// Select a node by a `match` path: `/`-separated child names, each
/// optionally constrained as `name?attr=value`.
fn select<'a>(root: &'a Element, matcher: &str) -> Option<&'a Element> {
    let mut current = root;
    for segment in matcher.split('/').filter(|s| !s.is_empty()) {
        let (name, constraint) = parse_segment(segment);
        current = current.children().find(|child| {
            child.name() == name
                && constraint
                    .map(|(attr, value)| child.attr(attr) == Some(value))
                    .unwrap_or(true)
        })?;
    }
    Some(current)
}

/// Remove every direct child of `root` matched by the selector's first
/// segment (deeper segments select, only the top level is hidden).
fn remove_matching(root: &mut Element, matcher: &str) {
    let first = match matcher.split('/').find(|s| !s.is_empty()) {
        Some(first) => first.to_string(),
        None => return,
    };
    let (name, constraint) = parse_segment(&first);
    let kept: Vec<Node> = root
        .take_nodes()
        .into_iter()
        .filter(|node| match node {
            Node::Element(child) => {
                !(child.name() == name
                    && constraint
                        .map(|(attr, value)| child.attr(attr) == Some(value))
                        .unwrap_or(true))
            }
            Node::Text(_) => true,
        })
        .collect();
    for node in kept {
        match node {
            Node::Element(child) => {
                root.append_child(child);
            }
            Node::Text(text) => root.append_text_node(text),
        }
    }
}

fn parse_segment(segment: &str) -> (&str, Option<(&str, &str)>) {
    match segment.split_once('?') {
        Some((name, constraint)) => match constraint.split_once('=') {
            Some((attr, value)) => (name, Some((attr, value))),
            None => (name, None),
        },
        None => (segment, None),
    }
}
