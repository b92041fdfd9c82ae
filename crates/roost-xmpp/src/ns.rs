//! Namespace constants used across the router and session manager.

/// Stream framing namespace (`<stream:stream/>` and friends).
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// Client stanza namespace.
pub const CLIENT: &str = "jabber:client";

/// Server-to-server stanza namespace.
pub const SERVER: &str = "jabber:server";

/// External component namespace (XEP-0114).
pub const COMPONENT_ACCEPT: &str = "jabber:component:accept";

/// Server dialback namespace, conventionally bound to the `db` prefix.
pub const DIALBACK: &str = "jabber:server:dialback";

/// Stream error conditions (RFC 3920 §4.7).
pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Stanza error conditions (RFC 3920 §9.3).
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Legacy non-SASL authentication (XEP-0078).
pub const AUTH: &str = "jabber:iq:auth";

/// In-band registration (XEP-0077).
pub const REGISTER: &str = "jabber:iq:register";

/// Roster management (RFC 3921 §7).
pub const ROSTER: &str = "jabber:iq:roster";

/// Private XML storage (XEP-0049).
pub const PRIVATE: &str = "jabber:iq:private";

/// Legacy service browsing (XEP-0011).
pub const BROWSE: &str = "jabber:iq:browse";

/// vcard-temp (XEP-0054).
pub const VCARD: &str = "vcard-temp";

/// Offline message spool storage.
pub const OFFLINE: &str = "jabber:x:offline";

/// Message expiration hints (XEP-0023).
pub const EXPIRE: &str = "jabber:x:expire";

/// Legacy delayed delivery stamps (XEP-0091).
pub const DELAY: &str = "jabber:x:delay";

/// Service discovery, info queries (XEP-0030).
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

/// Service discovery, item queries (XEP-0030).
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

/// Storage namespace for stanzas a component connector failed to deliver.
pub const COMPONENT_SPOOL: &str = "roost:component:spool";
