//! One authenticated resource of a local user.

use std::sync::Arc;
use std::time::Instant;

use jid::{FullJid, Jid};
use minidom::Element;

use super::modules::Module;
use crate::ns;

/// A live session: the state the session manager keeps per resource.
pub struct Session {
    /// Full JID of the resource.
    pub full: FullJid,

    /// Return address of the connector connection serving this session;
    /// traffic to the client is wrapped in a `<route/>` to this JID.
    pub route_to: Jid,

    /// Presence priority, clamped to the i8 range.
    pub priority: i8,

    /// The session's current `<presence/>`, once one was sent.
    pub presence: Option<Element>,

    /// Whether the session has broadcast available presence.
    pub available: bool,

    /// Set when the client fetched its roster; gates subscription pushes.
    pub roster_requested: bool,

    /// Connection order, breaking priority ties (latest wins).
    pub connected_at: Instant,

    /// Per-session module chains, filled by modules at session start.
    pub in_hooks: Vec<Arc<dyn Module>>,
    pub out_hooks: Vec<Arc<dyn Module>>,
    pub end_hooks: Vec<Arc<dyn Module>>,
}

impl Session {
    pub fn new(full: FullJid, route_to: Jid) -> Session {
        Session {
            full,
            route_to,
            priority: 0,
            presence: None,
            available: false,
            roster_requested: false,
            connected_at: Instant::now(),
            in_hooks: Vec::new(),
            out_hooks: Vec::new(),
            end_hooks: Vec::new(),
        }
    }

    pub fn resource(&self) -> &str {
        self.full.resource().as_str()
    }

    /// Wrap a stanza in the route envelope that carries it to the client.
    pub fn wrap_for_client(&self, elem: Element) -> Element {
        Element::builder("route", ns::SERVER)
            .attr("to", self.route_to.to_string())
            .attr("from", self.full.to_string())
            .append(elem)
            .build()
    }
}

/// Parse and clamp a `<priority/>` child: out-of-range values saturate,
/// a missing or unparsable priority is zero.
pub fn parse_priority(presence: &Element) -> i8 {
    presence
        .children()
        .find(|child| child.name() == "priority")
        .and_then(|child| child.text().trim().parse::<i64>().ok())
        .map(|value| value.clamp(i8::MIN as i64, i8::MAX as i64) as i8)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(priority: Option<&str>) -> Element {
        let mut builder = Element::builder("presence", ns::SERVER);
        if let Some(priority) = priority {
            builder = builder.append(
                Element::builder("priority", ns::SERVER)
                    .append(priority.to_string())
                    .build(),
            );
        }
        builder.build()
    }

    #[test]
    fn test_priority_clamp() {
        assert_eq!(parse_priority(&presence(Some("500"))), 127);
        assert_eq!(parse_priority(&presence(Some("-500"))), -128);
        assert_eq!(parse_priority(&presence(Some("1"))), 1);
        assert_eq!(parse_priority(&presence(Some("-1"))), -1);
        assert_eq!(parse_priority(&presence(None)), 0);
        assert_eq!(parse_priority(&presence(Some("junk"))), 0);
    }
}
