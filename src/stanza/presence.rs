//! Presence stanzas.

use std::collections::BTreeMap;

use minidom::Element;

use crate::error::{Error, Result, StanzaError};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{lang_key, parse_jid_attr};

/// Presence subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceKind {
    /// Available (no type attribute).
    #[default]
    Available,
    /// Going offline.
    Unavailable,
    /// Asking for a presence subscription.
    Subscribe,
    /// Granting a presence subscription.
    Subscribed,
    /// Cancelling one's own subscription.
    Unsubscribe,
    /// Revoking the peer's subscription.
    Unsubscribed,
    /// Server-side availability probe.
    Probe,
    /// Delivery failure bounce.
    Error,
}

impl PresenceKind {
    fn from_attr(value: Option<&str>) -> Result<Self> {
        Ok(match value {
            None => Self::Available,
            Some("unavailable") => Self::Unavailable,
            Some("subscribe") => Self::Subscribe,
            Some("subscribed") => Self::Subscribed,
            Some("unsubscribe") => Self::Unsubscribe,
            Some("unsubscribed") => Self::Unsubscribed,
            Some("probe") => Self::Probe,
            Some("error") => Self::Error,
            Some(other) => return Err(Error::parse(format!("unknown presence type '{other}'"))),
        })
    }

    fn as_attr(&self) -> Option<&'static str> {
        match self {
            Self::Available => None,
            Self::Unavailable => Some("unavailable"),
            Self::Subscribe => Some("subscribe"),
            Self::Subscribed => Some("subscribed"),
            Self::Unsubscribe => Some("unsubscribe"),
            Self::Unsubscribed => Some("unsubscribed"),
            Self::Probe => Some("probe"),
            Self::Error => Some("error"),
        }
    }
}

/// The `<show/>` refinement of an available presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Show {
    /// Temporarily away.
    Away,
    /// Free for chat.
    Chat,
    /// Do not disturb.
    Dnd,
    /// Extended away.
    Xa,
}

impl Show {
    fn from_text(text: &str) -> Option<Self> {
        Some(match text {
            "away" => Self::Away,
            "chat" => Self::Chat,
            "dnd" => Self::Dnd,
            "xa" => Self::Xa,
            _ => return None,
        })
    }

    fn as_text(&self) -> &'static str {
        match self {
            Self::Away => "away",
            Self::Chat => "chat",
            Self::Dnd => "dnd",
            Self::Xa => "xa",
        }
    }
}

/// Caller-facing availability. Offline is not a settable state; use
/// `close` to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    /// Online with no refinement.
    #[default]
    Online,
    /// Temporarily away.
    Away,
    /// Free for chat.
    Chat,
    /// Do not disturb.
    Dnd,
    /// Extended away.
    Xa,
}

impl Availability {
    /// The wire `<show/>` value, `None` for plain online.
    pub fn show(&self) -> Option<Show> {
        match self {
            Self::Online => None,
            Self::Away => Some(Show::Away),
            Self::Chat => Some(Show::Chat),
            Self::Dnd => Some(Show::Dnd),
            Self::Xa => Some(Show::Xa),
        }
    }

    /// Availability implied by an inbound show value.
    pub fn from_show(show: Option<Show>) -> Self {
        match show {
            None => Self::Online,
            Some(Show::Away) => Self::Away,
            Some(Show::Chat) => Self::Chat,
            Some(Show::Dnd) => Self::Dnd,
            Some(Show::Xa) => Self::Xa,
        }
    }
}

/// A presence stanza.
#[derive(Debug, Clone)]
pub struct Presence {
    /// Addressee; broadcast when absent.
    pub to: Option<Jid>,
    /// Sender, stamped by the server on inbound stanzas.
    pub from: Option<Jid>,
    /// Optional tracking id.
    pub id: Option<String>,
    /// Subtype.
    pub kind: PresenceKind,
    /// Availability refinement.
    pub show: Option<Show>,
    /// Status messages keyed by language ("" = default).
    pub statuses: BTreeMap<String, String>,
    /// Priority, 0 when absent.
    pub priority: i8,
    /// Extension payload children.
    pub payloads: Vec<Element>,
    /// Parsed `<error/>` child for [`PresenceKind::Error`].
    pub error: Option<StanzaError>,
}

impl Presence {
    /// Build an empty presence of the given kind.
    pub fn new(kind: PresenceKind) -> Self {
        Self {
            to: None,
            from: None,
            id: None,
            kind,
            show: None,
            statuses: BTreeMap::new(),
            priority: 0,
            payloads: Vec::new(),
            error: None,
        }
    }

    /// Build a plain available presence.
    pub fn available() -> Self {
        Self::new(PresenceKind::Available)
    }

    /// Set the addressee.
    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    /// Set the show refinement.
    pub fn with_show(mut self, show: Option<Show>) -> Self {
        self.show = show;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    /// Add a default-language status message.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.statuses.insert(String::new(), status.into());
        self
    }

    /// Attach an extension payload.
    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payloads.push(payload);
        self
    }

    /// The default-language status, falling back to any status.
    pub fn status(&self) -> Option<&str> {
        self.statuses
            .get("")
            .or_else(|| self.statuses.values().next())
            .map(String::as_str)
    }

    /// First extension payload matching name and namespace.
    pub fn payload(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payloads.iter().find(|p| p.is(name, namespace))
    }

    /// Parse from a wire element.
    pub fn from_element(element: &Element) -> Result<Self> {
        let mut presence = Self::new(PresenceKind::from_attr(element.attr("type"))?);
        presence.to = parse_jid_attr(element, "to")?;
        presence.from = parse_jid_attr(element, "from")?;
        presence.id = element.attr("id").map(str::to_string);

        for child in element.children() {
            if child.is("show", ns::JABBER_CLIENT) {
                presence.show = Show::from_text(child.text().trim());
            } else if child.is("status", ns::JABBER_CLIENT) {
                presence.statuses.insert(lang_key(child), child.text());
            } else if child.is("priority", ns::JABBER_CLIENT) {
                presence.priority = child.text().trim().parse().unwrap_or(0);
            } else if child.is("error", ns::JABBER_CLIENT) {
                presence.error = StanzaError::from_element(child);
            } else {
                presence.payloads.push(child.clone());
            }
        }

        Ok(presence)
    }

    /// Serialize to a wire element.
    pub fn to_element(&self) -> Element {
        let mut presence = Element::builder("presence", ns::JABBER_CLIENT).build();
        if let Some(kind) = self.kind.as_attr() {
            presence.set_attr("type", kind);
        }
        if let Some(to) = &self.to {
            presence.set_attr("to", to.to_string());
        }
        if let Some(from) = &self.from {
            presence.set_attr("from", from.to_string());
        }
        if let Some(id) = &self.id {
            presence.set_attr("id", id.clone());
        }
        if let Some(show) = &self.show {
            presence.append_child(
                Element::builder("show", ns::JABBER_CLIENT)
                    .append(show.as_text())
                    .build(),
            );
        }
        for (lang, status) in &self.statuses {
            let mut child = Element::builder("status", ns::JABBER_CLIENT)
                .append(status.as_str())
                .build();
            if !lang.is_empty() {
                child.set_attr("xml:lang", lang);
            }
            presence.append_child(child);
        }
        if self.priority != 0 {
            presence.append_child(
                Element::builder("priority", ns::JABBER_CLIENT)
                    .append(self.priority.to_string().as_str())
                    .build(),
            );
        }
        for payload in &self.payloads {
            presence.append_child(payload.clone());
        }
        if let Some(error) = &self.error {
            presence.append_child(error.to_element());
        }
        presence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_with_show_and_priority_round_trips() {
        let presence = Presence::available()
            .with_show(Some(Show::Dnd))
            .with_priority(5)
            .with_status("busy");
        let elem = presence.to_element();

        let parsed = Presence::from_element(&elem).unwrap();
        assert_eq!(parsed.kind, PresenceKind::Available);
        assert_eq!(parsed.show, Some(Show::Dnd));
        assert_eq!(parsed.priority, 5);
        assert_eq!(parsed.status(), Some("busy"));
    }

    #[test]
    fn subscription_kinds_parse() {
        for (attr, kind) in [
            ("subscribe", PresenceKind::Subscribe),
            ("subscribed", PresenceKind::Subscribed),
            ("unsubscribe", PresenceKind::Unsubscribe),
            ("unsubscribed", PresenceKind::Unsubscribed),
        ] {
            let xml = format!("<presence xmlns='jabber:client' type='{attr}'/>");
            let presence = Presence::from_element(&xml.parse().unwrap()).unwrap();
            assert_eq!(presence.kind, kind);
        }
    }

    #[test]
    fn zero_priority_is_omitted_on_the_wire() {
        let elem = Presence::available().to_element();
        assert!(elem.get_child("priority", ns::JABBER_CLIENT).is_none());
    }

    #[test]
    fn availability_maps_to_show() {
        assert_eq!(Availability::Online.show(), None);
        assert_eq!(Availability::Away.show(), Some(Show::Away));
        assert_eq!(Availability::from_show(Some(Show::Xa)), Availability::Xa);
    }
}
