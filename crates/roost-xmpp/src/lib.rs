//! Roost XMPP server library: stanza router, session manager, storage
//! cache, and component connectors.
//!
//! The pieces compose around the [`router::Router`]: every subsystem is
//! an instance with a handler chain, and instances talk to each other
//! only by delivering packets.
//!
//! - [`stanza`]: delivery packets and classification
//! - [`stream`]: incremental XML stream parsing with limits and reset
//! - [`router`]: packet classification, instance registry, handler chains
//! - [`xdb`]: namespace-keyed per-JID storage over request/reply packets
//! - [`sm`]: the session manager and its module pipeline
//! - [`comp`]: accept/connect component links (XEP-0114)
//! - [`beat`]: heartbeat scheduler for periodic sweeps

pub mod beat;
pub mod comp;
pub mod error;
pub mod logsink;
pub mod ns;
pub mod router;
pub mod sm;
pub mod stanza;
pub mod stream;
pub mod xdb;

pub use error::{StanzaError, StreamError, XmppError};
pub use router::{Router, RouterConfig};
pub use stanza::{Packet, PacketClass};
