//! Stanza model: delivery packets, classification, and reply helpers.
//!
//! A [`Packet`] pairs a parsed XML element with its routing metadata. The
//! element tree is owned by the packet; handing a packet to a handler hands
//! the tree with it.

use jid::Jid;
use minidom::Element;

use crate::error::{StanzaError, XmppError};
use crate::ns;

/// Routing class of a delivery packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketClass {
    /// `<message/>`
    Message,
    /// `<presence/>` other than subscription management
    Presence,
    /// `<presence/>` with a subscription `type`
    S10n,
    /// `<iq/>`
    Iq,
    /// `<route/>` envelope between connectors and the session manager
    Route,
    /// `<xdb/>` storage request or reply
    Xdb,
    /// `<log/>` record
    Log,
}

/// A stanza plus routing metadata, as carried through the router.
#[derive(Debug, Clone)]
pub struct Packet {
    pub class: PacketClass,
    pub to: Jid,
    pub from: Option<Jid>,
    pub elem: Element,
}

impl Packet {
    /// Classify an element and extract its routing addresses.
    ///
    /// Every routed packet must carry a `to` with a non-empty domain;
    /// anything else is refused here, before it can enter the router.
    pub fn from_element(elem: Element) -> Result<Packet, XmppError> {
        let class = classify(&elem)
            .ok_or_else(|| XmppError::Stanza(format!("unroutable element <{}/>", elem.name())))?;
        let to = match elem.attr("to") {
            Some(to) => to.parse::<Jid>()?,
            None => return Err(XmppError::Stanza("missing to address".into())),
        };
        let from = match elem.attr("from") {
            Some(from) => Some(from.parse::<Jid>()?),
            None => None,
        };
        Ok(Packet {
            class,
            to,
            from,
            elem,
        })
    }

    /// Re-derive class and addresses after the element was rewritten.
    pub fn reset(self) -> Result<Packet, XmppError> {
        Packet::from_element(self.elem)
    }

    /// Destination domain at delivery time.
    pub fn host(&self) -> &str {
        self.to.domain().as_str()
    }

    /// Stanza `type` attribute, if any.
    pub fn stanza_type(&self) -> Option<&str> {
        self.elem.attr("type")
    }

    /// Whether this packet is already an error and must never be bounced.
    pub fn is_error(&self) -> bool {
        self.stanza_type() == Some("error")
    }

    /// Rewrite the destination, keeping attribute and field in sync.
    pub fn set_to(&mut self, to: Jid) {
        self.elem.set_attr("to", to.to_string());
        self.to = to;
    }

    /// Rewrite the source, keeping attribute and field in sync.
    pub fn set_from(&mut self, from: Jid) {
        self.elem.set_attr("from", from.to_string());
        self.from = Some(from);
    }

    /// Turn this packet into its delivery-failure bounce, or `None` when the
    /// packet was already an error (errors are dropped, never bounced).
    pub fn into_bounce(self, err: StanzaError) -> Option<Packet> {
        if self.is_error() || self.from.is_none() {
            return None;
        }
        let elem = error_reply(self.elem, err);
        Packet::from_element(elem).ok()
    }
}

/// Assign a routing class from the element name and `type` attribute.
pub fn classify(elem: &Element) -> Option<PacketClass> {
    Some(match elem.name() {
        "route" => PacketClass::Route,
        "xdb" => PacketClass::Xdb,
        "log" => PacketClass::Log,
        "message" => PacketClass::Message,
        "iq" => PacketClass::Iq,
        "presence" => match elem.attr("type") {
            Some("subscribe") | Some("subscribed") | Some("unsubscribe")
            | Some("unsubscribed") => PacketClass::S10n,
            _ => PacketClass::Presence,
        },
        _ => return None,
    })
}

/// Swap the `to` and `from` attributes in place.
pub fn swap_to_from(elem: &mut Element) {
    let to = elem.attr("to").map(str::to_owned);
    let from = elem.attr("from").map(str::to_owned);
    elem.set_attr("to", from);
    elem.set_attr("from", to);
}

/// Rewrite a stanza into its error reply: direction reversed,
/// `type="error"`, original payload kept, `<error/>` appended.
pub fn error_reply(mut elem: Element, err: StanzaError) -> Element {
    swap_to_from(&mut elem);
    elem.set_attr("type", "error");
    let stanza_ns = elem.ns();
    elem.append_child(err.to_element(&stanza_ns));
    elem
}

/// Rewrite an iq into an empty `type="result"` reply (direction reversed).
pub fn iq_result(mut elem: Element) -> Element {
    swap_to_from(&mut elem);
    elem.set_attr("type", "result");
    let name = elem.name().to_string();
    let namespace = elem.ns();
    let mut result = Element::builder(name, namespace).build();
    for (attr, value) in elem.attrs() {
        result.set_attr(attr, value);
    }
    result
}

/// Build a fresh `<presence/>` stanza.
pub fn presence_new(ptype: Option<&str>, to: &Jid, from: &Jid, status: Option<&str>) -> Element {
    let mut builder = Element::builder("presence", ns::SERVER)
        .attr("to", to.to_string())
        .attr("from", from.to_string());
    if let Some(ptype) = ptype {
        builder = builder.attr("type", ptype);
    }
    if let Some(status) = status {
        builder = builder.append(
            Element::builder("status", ns::SERVER)
                .append(status.to_string())
                .build(),
        );
    }
    builder.build()
}

/// Legacy timestamp format used by delay stamps and spool records.
pub fn timestamp() -> String {
    chrono::Utc::now().format("%Y%m%dT%H:%M:%S").to_string()
}

/// Stamp a stanza with a legacy delayed-delivery element.
pub fn delay_stamp(elem: &mut Element, from: Option<&str>, reason: &str) {
    let mut builder = Element::builder("x", ns::DELAY).attr("stamp", timestamp());
    if let Some(from) = from {
        builder = builder.attr("from", from);
    }
    elem.append_child(builder.append(reason.to_string()).build());
}

/// Minimal text escaping for raw markup we emit outside the tree writer.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
