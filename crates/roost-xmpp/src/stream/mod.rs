//! Incremental XML stream parsing for XMPP connections.
//!
//! Each connection owns an [`XmlReader`] that is fed raw bytes and yields
//! three kinds of events to the attached component:
//! - [`StreamEvent::Root`]: the opening `<stream:stream/>` header
//! - [`StreamEvent::Node`]: each completed top-level child of the stream
//! - [`StreamEvent::Close`]: the peer closed its half of the stream
//!
//! The reader enforces a per-node size limit and a nesting depth limit;
//! violations surface as stream errors. A [`XmlReader::reset`] reinitializes
//! parser state on the same connection, which is the hook a TLS layer uses
//! after STARTTLS.

use minidom::Element;
use rxml::{AttrMap, EventRead, FeedParser, NcName, Namespace};
use tracing::trace;

use crate::error::StreamError;
use crate::ns;

/// Default maximum size of a single top-level node, in bytes.
pub const DEFAULT_MAX_NODE_BYTES: usize = 100 * 1024;

/// Default maximum element nesting depth within a stream.
pub const DEFAULT_MAX_DEPTH: usize = 25;

/// Stream parsing limits.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Maximum serialized size of one top-level child.
    pub max_node_bytes: usize,

    /// Maximum nesting depth, counting the stream root as depth one.
    pub max_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_node_bytes: DEFAULT_MAX_NODE_BYTES,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// The parsed `<stream:stream/>` opening tag.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub lang: Option<String>,
    pub version: Option<String>,
}

impl StreamHeader {
    fn from_attrs(attrs: &AttrMap) -> StreamHeader {
        let mut header = StreamHeader {
            to: None,
            from: None,
            id: None,
            lang: None,
            version: None,
        };
        for ((namespace, name), value) in attrs.iter() {
            if namespace.is_none() {
                match name.as_str() {
                    "to" => header.to = Some(value.clone()),
                    "from" => header.from = Some(value.clone()),
                    "id" => header.id = Some(value.clone()),
                    "version" => header.version = Some(value.clone()),
                    _ => {}
                }
            } else if namespace.as_str() == XML_NS && name.as_str() == "lang" {
                header.lang = Some(value.clone());
            }
        }
        header
    }
}

/// Events emitted by an [`XmlReader`].
#[derive(Debug)]
pub enum StreamEvent {
    /// The stream header arrived and was validated.
    Root(StreamHeader),
    /// A complete top-level child of the stream.
    Node(Element),
    /// The peer closed its half of the stream.
    Close,
}

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Feed-based stream parser: push bytes in, pull [`StreamEvent`]s out.
pub struct XmlReader {
    config: StreamConfig,
    parser: FeedParser<'static>,
    root_seen: bool,
    /// Ancestry of the top-level child currently being assembled.
    stack: Vec<Element>,
    /// Bytes consumed by the node currently being assembled.
    node_bytes: usize,
}

impl XmlReader {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            parser: FeedParser::new(),
            root_seen: false,
            stack: Vec::new(),
            node_bytes: 0,
        }
    }

    /// Feed raw bytes from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.parser.feed(data.to_vec());
    }

    /// Discard all parser state and begin a fresh stream on the same
    /// connection. The next bytes fed must start a new stream header.
    pub fn reset(&mut self) {
        trace!("resetting stream parser state");
        self.parser = FeedParser::new();
        self.root_seen = false;
        self.stack.clear();
        self.node_bytes = 0;
    }

    /// Pull the next stream event, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, StreamError> {
        loop {
            // The stream close itself surfaces as the root's end-element
            // below, so both starvation signals just mean "feed me".
            let event = match self.parser.read() {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(None),
                Err(rxml::Error::IO(_)) => return Ok(None),
                Err(err) => {
                    trace!(error = %err, "XML parse failure");
                    return Err(StreamError::XmlNotWellFormed);
                }
            };

            match event {
                rxml::Event::XmlDeclaration(_, _) => continue,
                rxml::Event::StartElement(metrics, (namespace, name), attrs) => {
                    if !self.root_seen {
                        if namespace.as_str() != ns::STREAM || name.as_str() != "stream" {
                            return Err(StreamError::InvalidNamespace);
                        }
                        self.root_seen = true;
                        return Ok(Some(StreamEvent::Root(StreamHeader::from_attrs(&attrs))));
                    }

                    // depth: root is one, first-level children are two
                    if self.stack.len() + 2 > self.config.max_depth {
                        return Err(StreamError::PolicyViolation);
                    }
                    self.node_bytes += metrics.len();
                    if self.node_bytes > self.config.max_node_bytes {
                        return Err(StreamError::ResourceConstraint);
                    }
                    let elem = element_from_start(namespace, name, attrs);
                    self.stack.push(elem);
                }
                rxml::Event::Text(metrics, text) => {
                    self.node_bytes += metrics.len();
                    if self.node_bytes > self.config.max_node_bytes {
                        return Err(StreamError::ResourceConstraint);
                    }
                    match self.stack.last_mut() {
                        Some(parent) => {
                            parent.append_text_node(text);
                        }
                        // whitespace keepalives between stanzas
                        None => continue,
                    }
                }
                rxml::Event::EndElement(_) => match self.stack.pop() {
                    // the stream root itself closed
                    None => return Ok(Some(StreamEvent::Close)),
                    Some(elem) => match self.stack.last_mut() {
                        Some(parent) => {
                            parent.append_child(elem);
                        }
                        None => {
                            self.node_bytes = 0;
                            return Ok(Some(StreamEvent::Node(elem)));
                        }
                    },
                },
            }
        }
    }
}

/// Build a [`minidom::Element`] from a resolved start-element event.
fn element_from_start(namespace: Namespace, name: NcName, attrs: AttrMap) -> Element {
    let mut builder = Element::builder(name, namespace);
    for ((attr_ns, attr_name), value) in attrs.into_iter() {
        if attr_ns.is_none() {
            builder = builder.attr(attr_name, value);
        } else if attr_ns.as_str() == XML_NS {
            builder = builder.attr(format!("xml:{}", attr_name), value);
        }
        // other namespaced attributes are not used by the protocols we route
    }
    builder.build()
}

/// Serialize an element to wire-ready markup.
pub fn serialize(elem: &Element) -> String {
    String::from(elem)
}

/// Build the opening `<stream:stream/>` markup we emit on a connection.
///
/// The well-known `stream` and `db` prefixes are always declared so peers
/// may use dialback elements without further declarations.
pub fn stream_header(
    content_ns: &str,
    to: Option<&str>,
    from: Option<&str>,
    id: Option<&str>,
) -> String {
    let mut header = format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' xmlns:db='{}'",
        content_ns,
        ns::STREAM,
        ns::DIALBACK,
    );
    if let Some(to) = to {
        header.push_str(&format!(" to='{}'", crate::stanza::escape_text(to)));
    }
    if let Some(from) = from {
        header.push_str(&format!(" from='{}'", crate::stanza::escape_text(from)));
    }
    if let Some(id) = id {
        header.push_str(&format!(" id='{}'", crate::stanza::escape_text(id)));
    }
    header.push('>');
    header
}
