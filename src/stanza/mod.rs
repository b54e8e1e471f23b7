//! Typed stanza layer over the wire elements.
//!
//! The three stanza kinds of RFC 6120 are modeled as owned structs that
//! parse from and serialize back to [`minidom::Element`]. Extension
//! payloads stay as raw elements; the typed fields cover only the
//! attributes and children with core IM semantics.

mod iq;
mod message;
mod presence;

pub use iq::{Iq, IqPayload};
pub use message::{Delay, Forwarded, Message, MessageKind};
pub use presence::{Availability, Presence, PresenceKind, Show};

use minidom::Element;

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::ns;

/// One inbound or outbound stanza.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// Request/response RPC.
    Iq(Iq),
    /// One-way content.
    Message(Message),
    /// One-way availability.
    Presence(Presence),
}

impl Stanza {
    /// Classify and parse a top-level stream child.
    pub fn parse(element: &Element) -> Result<Self> {
        if element.ns() != ns::JABBER_CLIENT {
            return Err(Error::parse(format!(
                "unexpected stanza namespace '{}'",
                element.ns()
            )));
        }
        match element.name() {
            "iq" => Iq::from_element(element).map(Stanza::Iq),
            "message" => Message::from_element(element).map(Stanza::Message),
            "presence" => Presence::from_element(element).map(Stanza::Presence),
            other => Err(Error::parse(format!("unsupported stanza <{other}/>"))),
        }
    }

    /// Serialize back to a wire element.
    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Iq(iq) => iq.to_element(),
            Stanza::Message(message) => message.to_element(),
            Stanza::Presence(presence) => presence.to_element(),
        }
    }

    /// The stanza's `from` attribute.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Iq(iq) => iq.from.as_ref(),
            Stanza::Message(message) => message.from.as_ref(),
            Stanza::Presence(presence) => presence.from.as_ref(),
        }
    }

    /// The stanza's `to` attribute.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Iq(iq) => iq.to.as_ref(),
            Stanza::Message(message) => message.to.as_ref(),
            Stanza::Presence(presence) => presence.to.as_ref(),
        }
    }

    /// Wire element name of this stanza kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Stanza::Iq(_) => "iq",
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
        }
    }
}

pub(crate) fn parse_jid_attr(element: &Element, name: &str) -> Result<Option<Jid>> {
    element
        .attr(name)
        .map(|value| {
            value
                .parse::<Jid>()
                .map_err(|_| Error::parse(format!("malformed '{name}' address '{value}'")))
        })
        .transpose()
}

pub(crate) fn lang_key(element: &Element) -> String {
    element.attr("xml:lang").unwrap_or("").to_string()
}
