//! Error types for the XMPP client.

use thiserror::Error;

use crate::ns;

/// Client-side XMPP errors.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (socket read/write, connect).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS negotiation or record-layer error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Inbound XML could not be parsed.
    #[error("XML parse error: {0}")]
    Parse(String),

    /// The peer violated the stream protocol (bad envelope, unexpected
    /// element during negotiation, malformed SASL exchange).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// SASL authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server requires TLS but the configuration disabled it.
    #[error("server requires TLS but the configuration disables it")]
    TlsRequiredByServer,

    /// Operation requires an established transport.
    #[error("not connected")]
    NotConnected,

    /// Operation requires an authenticated session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The session was closed; the handle is no longer usable.
    #[error("session already disposed")]
    AlreadyDisposed,

    /// An IQ waiter's deadline fired before the response arrived.
    #[error("request timed out")]
    Timeout,

    /// The session closed while the request was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// The transport was lost while the request was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The peer answered with a stanza error.
    #[error("stanza error: {condition}")]
    Stanza {
        /// Error type attribute.
        error_type: StanzaErrorType,
        /// Defined condition.
        condition: StanzaErrorCondition,
        /// Optional human-readable text.
        text: Option<String>,
    },

    /// The peer does not advertise the required extension.
    #[error("peer does not support {0}")]
    FeatureNotSupportedByPeer(String),

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A JID string failed to parse.
    #[error("invalid JID: {0}")]
    InvalidJid(String),

    /// An identifier is already in use (duplicate SI session id).
    #[error("conflict: {0}")]
    Conflict(String),

    /// An offer could not be accepted (no common stream method,
    /// rejected transfer).
    #[error("not acceptable: {0}")]
    NotAcceptable(String),
}

impl Error {
    /// Create a new XML parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a new protocol violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new not-acceptable error.
    pub fn not_acceptable(msg: impl Into<String>) -> Self {
        Self::NotAcceptable(msg.into())
    }

    /// Wrap a stanza error with the given condition and type.
    pub fn stanza(
        error_type: StanzaErrorType,
        condition: StanzaErrorCondition,
        text: Option<String>,
    ) -> Self {
        Self::Stanza {
            error_type,
            condition,
            text,
        }
    }
}

/// Convenient alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Stanza error defined conditions (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    /// Malformed or incomprehensible request.
    BadRequest,
    /// The request clashes with existing state.
    Conflict,
    /// The feature is not implemented by the responder.
    FeatureNotImplemented,
    /// The requester lacks permission.
    Forbidden,
    /// The addressed entity is gone.
    Gone,
    /// Responder-side failure.
    InternalServerError,
    /// The addressed item does not exist.
    ItemNotFound,
    /// The JID in the request is malformed.
    JidMalformed,
    /// The request is understood but unacceptable.
    NotAcceptable,
    /// The action is not allowed for any entity.
    NotAllowed,
    /// The requester must authenticate first.
    NotAuthorized,
    /// Payment is required.
    PaymentRequired,
    /// The intended recipient is temporarily unavailable.
    RecipientUnavailable,
    /// The entity is reachable at another address.
    Redirect,
    /// Registration is required first.
    RegistrationRequired,
    /// The remote server does not exist.
    RemoteServerNotFound,
    /// The remote server could not be reached in time.
    RemoteServerTimeout,
    /// The responder is resource constrained.
    ResourceConstraint,
    /// The service is unavailable.
    ServiceUnavailable,
    /// A presence subscription is required first.
    SubscriptionRequired,
    /// Condition not covered by the defined set.
    UndefinedCondition,
    /// The request was out of order.
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Element name of this condition on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PaymentRequired => "payment-required",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// Parse a condition from its element name.
    pub fn from_str(name: &str) -> Option<Self> {
        Some(match name {
            "bad-request" => Self::BadRequest,
            "conflict" => Self::Conflict,
            "feature-not-implemented" => Self::FeatureNotImplemented,
            "forbidden" => Self::Forbidden,
            "gone" => Self::Gone,
            "internal-server-error" => Self::InternalServerError,
            "item-not-found" => Self::ItemNotFound,
            "jid-malformed" => Self::JidMalformed,
            "not-acceptable" => Self::NotAcceptable,
            "not-allowed" => Self::NotAllowed,
            "not-authorized" => Self::NotAuthorized,
            "payment-required" => Self::PaymentRequired,
            "recipient-unavailable" => Self::RecipientUnavailable,
            "redirect" => Self::Redirect,
            "registration-required" => Self::RegistrationRequired,
            "remote-server-not-found" => Self::RemoteServerNotFound,
            "remote-server-timeout" => Self::RemoteServerTimeout,
            "resource-constraint" => Self::ResourceConstraint,
            "service-unavailable" => Self::ServiceUnavailable,
            "subscription-required" => Self::SubscriptionRequired,
            "undefined-condition" => Self::UndefinedCondition,
            "unexpected-request" => Self::UnexpectedRequest,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stanza error types (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorType {
    /// Retry after providing credentials.
    Auth,
    /// Do not retry.
    Cancel,
    /// Proceed, the condition is informational.
    Continue,
    /// Retry after changing the data sent.
    Modify,
    /// Retry after waiting.
    Wait,
}

impl StanzaErrorType {
    /// Attribute value of this type on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    /// Parse a type from its attribute value.
    pub fn from_str(value: &str) -> Option<Self> {
        Some(match value {
            "auth" => Self::Auth,
            "cancel" => Self::Cancel,
            "continue" => Self::Continue,
            "modify" => Self::Modify,
            "wait" => Self::Wait,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed `<error/>` child of a stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    /// Error type attribute.
    pub error_type: StanzaErrorType,
    /// Defined condition.
    pub condition: StanzaErrorCondition,
    /// Optional human-readable text.
    pub text: Option<String>,
}

impl StanzaError {
    /// Construct a stanza error.
    pub fn new(error_type: StanzaErrorType, condition: StanzaErrorCondition) -> Self {
        Self {
            error_type,
            condition,
            text: None,
        }
    }

    /// Attach human-readable text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Parse from an `<error/>` element.
    pub fn from_element(elem: &minidom::Element) -> Option<Self> {
        let error_type = elem
            .attr("type")
            .and_then(StanzaErrorType::from_str)
            .unwrap_or(StanzaErrorType::Cancel);

        let mut condition = StanzaErrorCondition::UndefinedCondition;
        let mut text = None;
        for child in elem.children() {
            if child.ns() != ns::STANZAS {
                continue;
            }
            if child.name() == "text" {
                let t = child.text();
                if !t.is_empty() {
                    text = Some(t);
                }
            } else if let Some(c) = StanzaErrorCondition::from_str(child.name()) {
                condition = c;
            }
        }

        Some(Self {
            error_type,
            condition,
            text,
        })
    }

    /// Serialize to an `<error/>` element.
    pub fn to_element(&self) -> minidom::Element {
        let mut error = minidom::Element::builder("error", ns::JABBER_CLIENT)
            .attr("type", self.error_type.as_str())
            .build();
        error.append_child(minidom::Element::bare(self.condition.as_str(), ns::STANZAS));
        if let Some(text) = &self.text {
            let text_elem = minidom::Element::builder("text", ns::STANZAS)
                .append(text.as_str())
                .build();
            error.append_child(text_elem);
        }
        error
    }
}

impl From<StanzaError> for Error {
    fn from(e: StanzaError) -> Self {
        Error::Stanza {
            error_type: e.error_type,
            condition: e.condition,
            text: e.text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_names_round_trip() {
        for condition in [
            StanzaErrorCondition::BadRequest,
            StanzaErrorCondition::Conflict,
            StanzaErrorCondition::ServiceUnavailable,
            StanzaErrorCondition::UnexpectedRequest,
        ] {
            assert_eq!(
                StanzaErrorCondition::from_str(condition.as_str()),
                Some(condition)
            );
        }
        assert_eq!(StanzaErrorCondition::from_str("no-such-thing"), None);
    }

    #[test]
    fn stanza_error_parses_condition_and_text() {
        let xml = "<error xmlns='jabber:client' type='cancel'>\
                   <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                   <text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>gone away</text>\
                   </error>";
        let elem: minidom::Element = xml.parse().unwrap();
        let error = StanzaError::from_element(&elem).unwrap();

        assert_eq!(error.error_type, StanzaErrorType::Cancel);
        assert_eq!(error.condition, StanzaErrorCondition::ItemNotFound);
        assert_eq!(error.text.as_deref(), Some("gone away"));
    }

    #[test]
    fn stanza_error_serializes_condition() {
        let error = StanzaError::new(StanzaErrorType::Modify, StanzaErrorCondition::BadRequest)
            .with_text("bad id");
        let elem = error.to_element();

        assert_eq!(elem.attr("type"), Some("modify"));
        assert!(elem.has_child("bad-request", ns::STANZAS));
        let text = elem.get_child("text", ns::STANZAS).unwrap();
        assert_eq!(text.text(), "bad id");
    }
}
