//! Error taxonomy: crate-level errors, stanza errors, and stream errors.
//!
//! Stanza errors carry both the legacy numeric `code` attribute and the
//! XMPP-style `(type, condition)` pair so that pre-XMPP clients and modern
//! ones both understand a bounce. Stream errors are fatal to a connection
//! and are always followed by a close.

use minidom::Element;
use thiserror::Error;

use crate::ns;

/// Errors surfaced by the routing core.
#[derive(Debug, Error)]
pub enum XmppError {
    /// I/O failure on a connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// XML that could not be parsed or violated a stream limit
    #[error("malformed XML: {0}")]
    Xml(String),

    /// An address that did not parse as a JID
    #[error("invalid JID: {0}")]
    Jid(#[from] jid::Error),

    /// A stanza missing required routing attributes
    #[error("malformed stanza: {0}")]
    Stanza(String),

    /// A stream-level protocol violation
    #[error("stream error: {0}")]
    Stream(StreamError),

    /// No instance matched the destination domain
    #[error("no route to {0}")]
    NoRoute(String),

    /// The storage component did not answer in time
    #[error("storage timeout")]
    StorageTimeout,

    /// The storage component refused a request
    #[error("storage failure: {0}")]
    Storage(String),

    /// The component is shutting down
    #[error("shutting down")]
    Shutdown,
}

/// XMPP stanza error types (RFC 3920 §9.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }
}

/// A stanza-level error: legacy code, XMPP type, condition, optional text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub code: u16,
    pub error_type: ErrorType,
    pub condition: &'static str,
    pub text: Option<String>,
}

impl StanzaError {
    pub const REDIRECT: StanzaError = StanzaError::new(302, ErrorType::Modify, "redirect");
    pub const BAD_REQUEST: StanzaError = StanzaError::new(400, ErrorType::Modify, "bad-request");
    pub const NOT_AUTHORIZED: StanzaError = StanzaError::new(401, ErrorType::Auth, "not-authorized");
    pub const PAYMENT_REQUIRED: StanzaError =
        StanzaError::new(402, ErrorType::Auth, "payment-required");
    pub const FORBIDDEN: StanzaError = StanzaError::new(403, ErrorType::Auth, "forbidden");
    pub const NOT_FOUND: StanzaError = StanzaError::new(404, ErrorType::Cancel, "item-not-found");
    pub const RECIPIENT_UNAVAILABLE: StanzaError =
        StanzaError::new(404, ErrorType::Wait, "recipient-unavailable");
    pub const NOT_ALLOWED: StanzaError = StanzaError::new(405, ErrorType::Cancel, "not-allowed");
    pub const NOT_ACCEPTABLE: StanzaError =
        StanzaError::new(406, ErrorType::Modify, "not-acceptable");
    pub const REGISTRATION_REQUIRED: StanzaError =
        StanzaError::new(407, ErrorType::Auth, "registration-required");
    pub const REQUEST_TIMEOUT: StanzaError =
        StanzaError::new(408, ErrorType::Wait, "remote-server-timeout");
    pub const CONFLICT: StanzaError = StanzaError::new(409, ErrorType::Cancel, "conflict");
    pub const INTERNAL: StanzaError =
        StanzaError::new(500, ErrorType::Wait, "internal-server-error");
    pub const NOT_IMPLEMENTED: StanzaError =
        StanzaError::new(501, ErrorType::Cancel, "feature-not-implemented");
    pub const EXTERNAL: StanzaError =
        StanzaError::new(502, ErrorType::Wait, "service-unavailable");
    pub const UNAVAILABLE: StanzaError =
        StanzaError::new(503, ErrorType::Cancel, "service-unavailable");
    pub const REMOTE_TIMEOUT: StanzaError =
        StanzaError::new(504, ErrorType::Wait, "remote-server-timeout");
    pub const DISCONNECTED: StanzaError =
        StanzaError::new(510, ErrorType::Cancel, "service-unavailable");
    pub const REMOTE_NOT_FOUND: StanzaError =
        StanzaError::new(404, ErrorType::Cancel, "remote-server-not-found");

    pub const fn new(code: u16, error_type: ErrorType, condition: &'static str) -> Self {
        StanzaError {
            code,
            error_type,
            condition,
            text: None,
        }
    }

    /// Attach human-readable text to the error.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Map a legacy numeric code to its XMPP equivalent.
    ///
    /// Unknown codes fall back to `(wait, undefined-condition)`.
    pub fn from_code(code: u16) -> StanzaError {
        match code {
            302 => Self::REDIRECT,
            400 => Self::BAD_REQUEST,
            401 => Self::NOT_AUTHORIZED,
            402 => Self::PAYMENT_REQUIRED,
            403 => Self::FORBIDDEN,
            404 => Self::NOT_FOUND,
            405 => Self::NOT_ALLOWED,
            406 => Self::NOT_ACCEPTABLE,
            407 => Self::REGISTRATION_REQUIRED,
            408 => Self::REQUEST_TIMEOUT,
            409 => Self::CONFLICT,
            500 => Self::INTERNAL,
            501 => Self::NOT_IMPLEMENTED,
            502 => Self::EXTERNAL,
            503 => Self::UNAVAILABLE,
            504 => Self::REMOTE_TIMEOUT,
            510 => Self::DISCONNECTED,
            _ => StanzaError::new(code, ErrorType::Wait, "undefined-condition"),
        }
    }

    /// Build the `<error/>` child element for a bounced stanza, in the
    /// stanza's own namespace.
    pub fn to_element(&self, stanza_ns: &str) -> Element {
        let mut builder = Element::builder("error", stanza_ns)
            .attr("code", self.code.to_string())
            .attr("type", self.error_type.as_str())
            .append(Element::builder(self.condition, ns::STANZAS).build());
        if let Some(ref text) = self.text {
            builder = builder.append(
                Element::builder("text", ns::STANZAS)
                    .append(text.clone())
                    .build(),
            );
        }
        builder.build()
    }
}

/// Stream-level error conditions (RFC 3920 §4.7.3), all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidId,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    PolicyViolation,
    RemoteConnectionFailed,
    ResourceConstraint,
    RestrictedXml,
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedEncoding,
    UnsupportedStanzaType,
    UnsupportedVersion,
    XmlNotWellFormed,
}

impl StreamError {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamError::BadFormat => "bad-format",
            StreamError::BadNamespacePrefix => "bad-namespace-prefix",
            StreamError::Conflict => "conflict",
            StreamError::ConnectionTimeout => "connection-timeout",
            StreamError::HostGone => "host-gone",
            StreamError::HostUnknown => "host-unknown",
            StreamError::ImproperAddressing => "improper-addressing",
            StreamError::InternalServerError => "internal-server-error",
            StreamError::InvalidFrom => "invalid-from",
            StreamError::InvalidId => "invalid-id",
            StreamError::InvalidNamespace => "invalid-namespace",
            StreamError::InvalidXml => "invalid-xml",
            StreamError::NotAuthorized => "not-authorized",
            StreamError::PolicyViolation => "policy-violation",
            StreamError::RemoteConnectionFailed => "remote-connection-failed",
            StreamError::ResourceConstraint => "resource-constraint",
            StreamError::RestrictedXml => "restricted-xml",
            StreamError::SeeOtherHost => "see-other-host",
            StreamError::SystemShutdown => "system-shutdown",
            StreamError::UndefinedCondition => "undefined-condition",
            StreamError::UnsupportedEncoding => "unsupported-encoding",
            StreamError::UnsupportedStanzaType => "unsupported-stanza-type",
            StreamError::UnsupportedVersion => "unsupported-version",
            StreamError::XmlNotWellFormed => "xml-not-well-formed",
        }
    }

    /// Parse a condition name as received in a `<stream:error/>` child.
    pub fn from_name(name: &str) -> Option<StreamError> {
        Some(match name {
            "bad-format" => StreamError::BadFormat,
            "bad-namespace-prefix" => StreamError::BadNamespacePrefix,
            "conflict" => StreamError::Conflict,
            "connection-timeout" => StreamError::ConnectionTimeout,
            "host-gone" => StreamError::HostGone,
            "host-unknown" => StreamError::HostUnknown,
            "improper-addressing" => StreamError::ImproperAddressing,
            "internal-server-error" => StreamError::InternalServerError,
            "invalid-from" => StreamError::InvalidFrom,
            "invalid-id" => StreamError::InvalidId,
            "invalid-namespace" => StreamError::InvalidNamespace,
            "invalid-xml" => StreamError::InvalidXml,
            "not-authorized" => StreamError::NotAuthorized,
            "policy-violation" => StreamError::PolicyViolation,
            "remote-connection-failed" => StreamError::RemoteConnectionFailed,
            "resource-constraint" => StreamError::ResourceConstraint,
            "restricted-xml" => StreamError::RestrictedXml,
            "see-other-host" => StreamError::SeeOtherHost,
            "system-shutdown" => StreamError::SystemShutdown,
            "undefined-condition" => StreamError::UndefinedCondition,
            "unsupported-encoding" => StreamError::UnsupportedEncoding,
            "unsupported-stanza-type" => StreamError::UnsupportedStanzaType,
            "unsupported-version" => StreamError::UnsupportedVersion,
            "xml-not-well-formed" => StreamError::XmlNotWellFormed,
            _ => return None,
        })
    }

    /// Serialize as wire-ready `<stream:error/>` markup.
    ///
    /// Stream framing keeps the conventional `stream` prefix, so this is
    /// emitted as raw markup rather than through the tree serializer.
    pub fn to_xml(self, text: Option<&str>) -> String {
        match text {
            Some(text) => format!(
                "<stream:error><{} xmlns='{}'/><text xmlns='{}' xml:lang='en'>{}</text></stream:error>",
                self.as_str(),
                ns::STREAMS,
                ns::STREAMS,
                crate::stanza::escape_text(text),
            ),
            None => format!(
                "<stream:error><{} xmlns='{}'/></stream:error>",
                self.as_str(),
                ns::STREAMS,
            ),
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_code_table() {
        let cases = [
            (302, ErrorType::Modify, "redirect"),
            (400, ErrorType::Modify, "bad-request"),
            (401, ErrorType::Auth, "not-authorized"),
            (402, ErrorType::Auth, "payment-required"),
            (403, ErrorType::Auth, "forbidden"),
            (404, ErrorType::Cancel, "item-not-found"),
            (405, ErrorType::Cancel, "not-allowed"),
            (406, ErrorType::Modify, "not-acceptable"),
            (407, ErrorType::Auth, "registration-required"),
            (408, ErrorType::Wait, "remote-server-timeout"),
            (409, ErrorType::Cancel, "conflict"),
            (500, ErrorType::Wait, "internal-server-error"),
            (501, ErrorType::Cancel, "feature-not-implemented"),
            (502, ErrorType::Wait, "service-unavailable"),
            (503, ErrorType::Cancel, "service-unavailable"),
            (504, ErrorType::Wait, "remote-server-timeout"),
            (510, ErrorType::Cancel, "service-unavailable"),
        ];
        for (code, error_type, condition) in cases {
            let err = StanzaError::from_code(code);
            assert_eq!(err.code, code);
            assert_eq!(err.error_type, error_type, "code {}", code);
            assert_eq!(err.condition, condition, "code {}", code);
        }

        let unknown = StanzaError::from_code(599);
        assert_eq!(unknown.error_type, ErrorType::Wait);
        assert_eq!(unknown.condition, "undefined-condition");
    }

    #[test]
    fn test_error_element_shape() {
        let elem = StanzaError::UNAVAILABLE
            .with_text("gone fishing")
            .to_element(ns::CLIENT);
        assert_eq!(elem.name(), "error");
        assert_eq!(elem.attr("code"), Some("503"));
        assert_eq!(elem.attr("type"), Some("cancel"));
        assert!(elem.has_child("service-unavailable", ns::STANZAS));
        let text = elem.get_child("text", ns::STANZAS).unwrap();
        assert_eq!(text.text(), "gone fishing");
    }

    #[test]
    fn test_stream_error_round_trip() {
        let all = [
            "bad-format",
            "bad-namespace-prefix",
            "conflict",
            "connection-timeout",
            "host-gone",
            "host-unknown",
            "improper-addressing",
            "internal-server-error",
            "invalid-from",
            "invalid-id",
            "invalid-namespace",
            "invalid-xml",
            "not-authorized",
            "policy-violation",
            "remote-connection-failed",
            "resource-constraint",
            "restricted-xml",
            "see-other-host",
            "system-shutdown",
            "undefined-condition",
            "unsupported-encoding",
            "unsupported-stanza-type",
            "unsupported-version",
            "xml-not-well-formed",
        ];
        for name in all {
            let err = StreamError::from_name(name).expect(name);
            assert_eq!(err.as_str(), name);
        }
        assert!(StreamError::from_name("no-such-condition").is_none());
    }

    #[test]
    fn test_stream_error_markup() {
        let xml = StreamError::NotAuthorized.to_xml(Some("Invalid handshake"));
        assert!(xml.starts_with("<stream:error>"));
        assert!(xml.contains("<not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
        assert!(xml.contains("Invalid handshake"));
        assert!(xml.ends_with("</stream:error>"));
    }
}
