//! Message stanzas.
//!
//! Bodies and subjects are keyed by `xml:lang` with the empty string for
//! the default language, the shape the wire uses. Forwarded inner
//! messages (carbons, MAM results) are exposed through [`Forwarded`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use minidom::Element;

use crate::error::{Error, Result, StanzaError};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{lang_key, parse_jid_attr};

/// Message subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    /// Standalone message (no type attribute).
    #[default]
    Normal,
    /// One-to-one conversation.
    Chat,
    /// Sent through a MUC room.
    Groupchat,
    /// Fire-and-forget notification.
    Headline,
    /// Delivery failure bounce.
    Error,
}

impl MessageKind {
    fn from_attr(value: Option<&str>) -> Result<Self> {
        Ok(match value {
            None | Some("normal") => Self::Normal,
            Some("chat") => Self::Chat,
            Some("groupchat") => Self::Groupchat,
            Some("headline") => Self::Headline,
            Some("error") => Self::Error,
            Some(other) => return Err(Error::parse(format!("unknown message type '{other}'"))),
        })
    }

    fn as_attr(&self) -> Option<&'static str> {
        match self {
            Self::Normal => None,
            Self::Chat => Some("chat"),
            Self::Groupchat => Some("groupchat"),
            Self::Headline => Some("headline"),
            Self::Error => Some("error"),
        }
    }
}

/// A message stanza.
#[derive(Debug, Clone)]
pub struct Message {
    /// Addressee.
    pub to: Option<Jid>,
    /// Sender, stamped by the server on inbound stanzas.
    pub from: Option<Jid>,
    /// Optional tracking id.
    pub id: Option<String>,
    /// Subtype.
    pub kind: MessageKind,
    /// Bodies keyed by language ("" = default).
    pub bodies: BTreeMap<String, String>,
    /// Subjects keyed by language ("" = default).
    pub subjects: BTreeMap<String, String>,
    /// Conversation thread id.
    pub thread: Option<String>,
    /// Extension payload children, order preserved.
    pub payloads: Vec<Element>,
    /// Parsed `<error/>` child for [`MessageKind::Error`].
    pub error: Option<StanzaError>,
}

impl Message {
    /// Build an empty message of the given kind.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            to: None,
            from: None,
            id: None,
            kind,
            bodies: BTreeMap::new(),
            subjects: BTreeMap::new(),
            thread: None,
            payloads: Vec::new(),
            error: None,
        }
    }

    /// Build a chat message with a default-language body.
    pub fn chat(to: Jid, body: impl Into<String>) -> Self {
        let mut message = Self::new(MessageKind::Chat);
        message.to = Some(to);
        message.bodies.insert(String::new(), body.into());
        message
    }

    /// Build a groupchat message with a default-language body.
    pub fn groupchat(to: Jid, body: impl Into<String>) -> Self {
        let mut message = Self::new(MessageKind::Groupchat);
        message.to = Some(to);
        message.bodies.insert(String::new(), body.into());
        message
    }

    /// Set the addressee.
    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    /// Add a default-language subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.insert(String::new(), subject.into());
        self
    }

    /// Set the thread id.
    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    /// Attach an extension payload.
    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payloads.push(payload);
        self
    }

    /// The default-language body, falling back to any body.
    pub fn body(&self) -> Option<&str> {
        self.bodies
            .get("")
            .or_else(|| self.bodies.values().next())
            .map(String::as_str)
    }

    /// The default-language subject, falling back to any subject.
    pub fn subject(&self) -> Option<&str> {
        self.subjects
            .get("")
            .or_else(|| self.subjects.values().next())
            .map(String::as_str)
    }

    /// First extension payload matching name and namespace.
    pub fn payload(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payloads.iter().find(|p| p.is(name, namespace))
    }

    /// The delayed-delivery timestamp, if stamped.
    pub fn delay(&self) -> Option<Delay> {
        self.payload("delay", ns::DELAY).and_then(Delay::from_element)
    }

    /// Parse from a wire element.
    pub fn from_element(element: &Element) -> Result<Self> {
        let mut message = Self::new(MessageKind::from_attr(element.attr("type"))?);
        message.to = parse_jid_attr(element, "to")?;
        message.from = parse_jid_attr(element, "from")?;
        message.id = element.attr("id").map(str::to_string);

        for child in element.children() {
            if child.is("body", ns::JABBER_CLIENT) {
                message.bodies.insert(lang_key(child), child.text());
            } else if child.is("subject", ns::JABBER_CLIENT) {
                message.subjects.insert(lang_key(child), child.text());
            } else if child.is("thread", ns::JABBER_CLIENT) {
                message.thread = Some(child.text());
            } else if child.is("error", ns::JABBER_CLIENT) {
                message.error = StanzaError::from_element(child);
            } else {
                message.payloads.push(child.clone());
            }
        }

        Ok(message)
    }

    /// Serialize to a wire element.
    pub fn to_element(&self) -> Element {
        let mut message = Element::builder("message", ns::JABBER_CLIENT).build();
        if let Some(kind) = self.kind.as_attr() {
            message.set_attr("type", kind);
        }
        if let Some(to) = &self.to {
            message.set_attr("to", to.to_string());
        }
        if let Some(from) = &self.from {
            message.set_attr("from", from.to_string());
        }
        if let Some(id) = &self.id {
            message.set_attr("id", id.clone());
        }
        for (lang, subject) in &self.subjects {
            message.append_child(text_child("subject", lang, subject));
        }
        for (lang, body) in &self.bodies {
            message.append_child(text_child("body", lang, body));
        }
        if let Some(thread) = &self.thread {
            message.append_child(
                Element::builder("thread", ns::JABBER_CLIENT)
                    .append(thread.as_str())
                    .build(),
            );
        }
        for payload in &self.payloads {
            message.append_child(payload.clone());
        }
        if let Some(error) = &self.error {
            message.append_child(error.to_element());
        }
        message
    }
}

fn text_child(name: &str, lang: &str, text: &str) -> Element {
    let mut child = Element::builder(name, ns::JABBER_CLIENT)
        .append(text)
        .build();
    if !lang.is_empty() {
        child.set_attr("xml:lang", lang);
    }
    child
}

/// Delayed-delivery stamp (XEP-0203).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delay {
    /// Original send time.
    pub stamp: DateTime<Utc>,
    /// The entity that delayed the stanza.
    pub from: Option<Jid>,
}

impl Delay {
    /// Parse from a `<delay/>` element.
    pub fn from_element(element: &Element) -> Option<Self> {
        let stamp = element.attr("stamp")?;
        let stamp = DateTime::parse_from_rfc3339(stamp)
            .ok()?
            .with_timezone(&Utc);
        let from = element.attr("from").and_then(|f| f.parse().ok());
        Some(Self { stamp, from })
    }

    /// Serialize to a `<delay/>` element.
    pub fn to_element(&self) -> Element {
        let mut delay = Element::builder("delay", ns::DELAY)
            .attr("stamp", self.stamp.to_rfc3339())
            .build();
        if let Some(from) = &self.from {
            delay.set_attr("from", from.to_string());
        }
        delay
    }
}

/// A forwarded inner message (XEP-0297), as used by carbons and MAM.
#[derive(Debug, Clone)]
pub struct Forwarded {
    /// Delay stamp carried alongside the inner message.
    pub delay: Option<Delay>,
    /// The forwarded message itself.
    pub message: Box<Message>,
}

impl Forwarded {
    /// Parse from a `<forwarded/>` element.
    pub fn from_element(element: &Element) -> Result<Self> {
        if !element.is("forwarded", ns::FORWARD) {
            return Err(Error::parse("not a forwarded element"));
        }
        let delay = element
            .get_child("delay", ns::DELAY)
            .and_then(Delay::from_element);
        let inner = element
            .get_child("message", ns::JABBER_CLIENT)
            .ok_or_else(|| Error::parse("forwarded without inner message"))?;
        Ok(Self {
            delay,
            message: Box::new(Message::from_element(inner)?),
        })
    }

    /// Serialize to a `<forwarded/>` element.
    pub fn to_element(&self) -> Element {
        let mut forwarded = Element::builder("forwarded", ns::FORWARD).build();
        if let Some(delay) = &self.delay {
            forwarded.append_child(delay.to_element());
        }
        forwarded.append_child(self.message.to_element());
        forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_builder_round_trips() {
        let message = Message::chat("bob@test".parse().unwrap(), "hi");
        let elem = message.to_element();
        assert_eq!(elem.attr("type"), Some("chat"));

        let parsed = Message::from_element(&elem).unwrap();
        assert_eq!(parsed.kind, MessageKind::Chat);
        assert_eq!(parsed.body(), Some("hi"));
    }

    #[test]
    fn language_keyed_bodies() {
        let xml = "<message xmlns='jabber:client'>\
                   <body>hello</body>\
                   <body xml:lang='de'>hallo</body>\
                   </message>";
        let message = Message::from_element(&xml.parse().unwrap()).unwrap();
        assert_eq!(message.bodies.len(), 2);
        assert_eq!(message.body(), Some("hello"));
        assert_eq!(message.bodies.get("de").map(String::as_str), Some("hallo"));
    }

    #[test]
    fn subject_only_message_has_no_body() {
        let xml = "<message xmlns='jabber:client' type='groupchat'>\
                   <subject>welcome</subject></message>";
        let message = Message::from_element(&xml.parse().unwrap()).unwrap();
        assert_eq!(message.subject(), Some("welcome"));
        assert!(message.body().is_none());
    }

    #[test]
    fn unknown_children_are_kept_as_payloads() {
        let xml = "<message xmlns='jabber:client'><body>x</body>\
                   <active xmlns='http://jabber.org/protocol/chatstates'/></message>";
        let message = Message::from_element(&xml.parse().unwrap()).unwrap();
        assert!(message.payload("active", ns::CHATSTATES).is_some());
    }

    #[test]
    fn forwarded_with_delay_parses() {
        let xml = "<forwarded xmlns='urn:xmpp:forward:0'>\
                   <delay xmlns='urn:xmpp:delay' stamp='2025-06-07T12:00:00Z'/>\
                   <message xmlns='jabber:client' from='a@test'><body>old</body></message>\
                   </forwarded>";
        let forwarded = Forwarded::from_element(&xml.parse().unwrap()).unwrap();
        assert!(forwarded.delay.is_some());
        assert_eq!(forwarded.message.body(), Some("old"));
    }

    #[test]
    fn error_message_carries_condition() {
        let xml = "<message xmlns='jabber:client' type='error'><body>hi</body>\
                   <error type='cancel'>\
                   <service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                   </error></message>";
        let message = Message::from_element(&xml.parse().unwrap()).unwrap();
        assert_eq!(message.kind, MessageKind::Error);
        assert!(message.error.is_some());
    }
}
