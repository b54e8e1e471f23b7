//! IQ request/response stanzas.

use minidom::Element;

use crate::error::{Error, Result, StanzaError};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::parse_jid_attr;

/// The subtype and payload of an IQ.
///
/// Get/Set carry exactly one first-level payload element by convention;
/// results may be empty.
#[derive(Debug, Clone)]
pub enum IqPayload {
    /// Request for information.
    Get(Element),
    /// Request to change state.
    Set(Element),
    /// Successful response.
    Result(Option<Element>),
    /// Failed response.
    Error {
        /// The parsed `<error/>` child.
        error: StanzaError,
        /// Echo of the request payload, when the peer includes it.
        payload: Option<Element>,
    },
}

/// An IQ stanza.
#[derive(Debug, Clone)]
pub struct Iq {
    /// Addressee; `None` targets the user's own server.
    pub to: Option<Jid>,
    /// Sender, stamped by the server on inbound stanzas.
    pub from: Option<Jid>,
    /// Correlation id. Outbound requests with an empty id get a fresh
    /// one assigned at send time.
    pub id: String,
    /// Subtype plus payload.
    pub payload: IqPayload,
}

impl Iq {
    /// Build a Get request.
    pub fn get(payload: Element) -> Self {
        Self {
            to: None,
            from: None,
            id: String::new(),
            payload: IqPayload::Get(payload),
        }
    }

    /// Build a Set request.
    pub fn set(payload: Element) -> Self {
        Self {
            to: None,
            from: None,
            id: String::new(),
            payload: IqPayload::Set(payload),
        }
    }

    /// Build the Result reply to an inbound request.
    pub fn result_for(request: &Iq, payload: Option<Element>) -> Self {
        Self {
            to: request.from.clone(),
            from: None,
            id: request.id.clone(),
            payload: IqPayload::Result(payload),
        }
    }

    /// Build the Error reply to an inbound request.
    pub fn error_for(request: &Iq, error: StanzaError) -> Self {
        let payload = match &request.payload {
            IqPayload::Get(p) | IqPayload::Set(p) => Some(p.clone()),
            _ => None,
        };
        Self {
            to: request.from.clone(),
            from: None,
            id: request.id.clone(),
            payload: IqPayload::Error { error, payload },
        }
    }

    /// Set the addressee.
    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    /// Set the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Whether this is a Get or Set.
    pub fn is_request(&self) -> bool {
        matches!(self.payload, IqPayload::Get(_) | IqPayload::Set(_))
    }

    /// Whether this is a Result or Error.
    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// The request payload of a Get/Set, if any.
    pub fn request_payload(&self) -> Option<&Element> {
        match &self.payload {
            IqPayload::Get(p) | IqPayload::Set(p) => Some(p),
            _ => None,
        }
    }

    /// The payload of a Result, if any.
    pub fn result_payload(&self) -> Option<&Element> {
        match &self.payload {
            IqPayload::Result(p) => p.as_ref(),
            _ => None,
        }
    }

    /// Convert a Result into its payload, or a peer Error into
    /// [`Error::Stanza`].
    pub fn into_result(self) -> Result<Option<Element>> {
        match self.payload {
            IqPayload::Result(payload) => Ok(payload),
            IqPayload::Error { error, .. } => Err(error.into()),
            IqPayload::Get(_) | IqPayload::Set(_) => {
                Err(Error::protocol("request stanza where a response was expected"))
            }
        }
    }

    /// Parse from a wire element.
    pub fn from_element(element: &Element) -> Result<Self> {
        let to = parse_jid_attr(element, "to")?;
        let from = parse_jid_attr(element, "from")?;
        let id = element.attr("id").unwrap_or("").to_string();
        let type_ = element
            .attr("type")
            .ok_or_else(|| Error::parse("iq without type attribute"))?;

        let first_payload = || {
            element
                .children()
                .find(|c| !c.is("error", ns::JABBER_CLIENT))
                .cloned()
        };

        let payload = match type_ {
            "get" => IqPayload::Get(
                first_payload().ok_or_else(|| Error::parse("iq get without payload"))?,
            ),
            "set" => IqPayload::Set(
                first_payload().ok_or_else(|| Error::parse("iq set without payload"))?,
            ),
            "result" => IqPayload::Result(first_payload()),
            "error" => {
                let error = element
                    .get_child("error", ns::JABBER_CLIENT)
                    .and_then(StanzaError::from_element)
                    .ok_or_else(|| Error::parse("iq error without error child"))?;
                IqPayload::Error {
                    error,
                    payload: first_payload(),
                }
            }
            other => return Err(Error::parse(format!("unknown iq type '{other}'"))),
        };

        Ok(Self {
            to,
            from,
            id,
            payload,
        })
    }

    /// Serialize to a wire element.
    pub fn to_element(&self) -> Element {
        let type_ = match &self.payload {
            IqPayload::Get(_) => "get",
            IqPayload::Set(_) => "set",
            IqPayload::Result(_) => "result",
            IqPayload::Error { .. } => "error",
        };
        let mut iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", type_)
            .build();
        if !self.id.is_empty() {
            iq.set_attr("id", self.id.clone());
        }
        if let Some(to) = &self.to {
            iq.set_attr("to", to.to_string());
        }
        if let Some(from) = &self.from {
            iq.set_attr("from", from.to_string());
        }
        match &self.payload {
            IqPayload::Get(payload) | IqPayload::Set(payload) => {
                iq.append_child(payload.clone());
            }
            IqPayload::Result(Some(payload)) => {
                iq.append_child(payload.clone());
            }
            IqPayload::Result(None) => {}
            IqPayload::Error { error, payload } => {
                if let Some(payload) = payload {
                    iq.append_child(payload.clone());
                }
                iq.append_child(error.to_element());
            }
        }
        iq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StanzaErrorCondition, StanzaErrorType};

    #[test]
    fn get_round_trips_with_payload() {
        let iq = Iq::get(Element::bare("ping", ns::PING))
            .with_to("test".parse().unwrap())
            .with_id("p1");
        let elem = iq.to_element();
        assert_eq!(elem.attr("type"), Some("get"));

        let parsed = Iq::from_element(&elem).unwrap();
        assert_eq!(parsed.id, "p1");
        assert!(parsed.is_request());
        assert_eq!(parsed.request_payload().unwrap().name(), "ping");
    }

    #[test]
    fn empty_result_parses() {
        let elem: Element = "<iq xmlns='jabber:client' type='result' id='x'/>"
            .parse()
            .unwrap();
        let iq = Iq::from_element(&elem).unwrap();
        assert!(iq.into_result().unwrap().is_none());
    }

    #[test]
    fn error_response_surfaces_condition() {
        let elem: Element = "<iq xmlns='jabber:client' type='error' id='x'>\
            <error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>\
            </iq>"
            .parse()
            .unwrap();
        let iq = Iq::from_element(&elem).unwrap();
        match iq.into_result() {
            Err(Error::Stanza { condition, .. }) => {
                assert_eq!(condition, StanzaErrorCondition::ItemNotFound);
            }
            other => panic!("expected stanza error, got {other:?}"),
        }
    }

    #[test]
    fn error_reply_echoes_request() {
        let elem: Element = "<iq xmlns='jabber:client' type='get' id='q1' from='peer@test/r'>\
            <query xmlns='jabber:iq:version'/></iq>"
            .parse()
            .unwrap();
        let request = Iq::from_element(&elem).unwrap();
        let reply = Iq::error_for(
            &request,
            StanzaError::new(
                StanzaErrorType::Cancel,
                StanzaErrorCondition::ServiceUnavailable,
            ),
        );

        assert_eq!(reply.id, "q1");
        assert_eq!(reply.to.as_ref().unwrap().to_string(), "peer@test/r");
        let elem = reply.to_element();
        assert!(elem.has_child("query", ns::VERSION));
        assert!(elem.has_child("error", ns::JABBER_CLIENT));
    }

    #[test]
    fn request_without_payload_is_rejected() {
        let elem: Element = "<iq xmlns='jabber:client' type='get' id='1'/>".parse().unwrap();
        assert!(Iq::from_element(&elem).is_err());
    }
}
