//! Roster model and item wire grammar (RFC 6121).
//!
//! The roster lives on the server; the session mirrors it. All local
//! mutations arrive through roster pushes on the inbound path, so the
//! mirror never diverges from what the server acknowledged.

use std::collections::{BTreeMap, BTreeSet};

use minidom::Element;

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::ns;

/// Presence subscription state between the user and a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    /// No subscription in either direction.
    #[default]
    None,
    /// We receive the contact's presence.
    To,
    /// The contact receives ours.
    From,
    /// Both directions.
    Both,
}

impl SubscriptionState {
    fn from_attr(value: &str) -> Result<Self> {
        Ok(match value {
            "none" => Self::None,
            "to" => Self::To,
            "from" => Self::From,
            "both" => Self::Both,
            other => {
                return Err(Error::parse(format!(
                    "unknown subscription state '{other}'"
                )))
            }
        })
    }

    /// Attribute value on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::To => "to",
            Self::From => "from",
            Self::Both => "both",
        }
    }
}

/// One contact in the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    /// The contact's bare JID.
    pub jid: Jid,
    /// Optional display name.
    pub name: Option<String>,
    /// Group labels.
    pub groups: BTreeSet<String>,
    /// Subscription state.
    pub subscription: SubscriptionState,
    /// Whether an outgoing subscription request is pending.
    pub pending_out: bool,
}

impl RosterItem {
    /// A minimal item for the given contact.
    pub fn new(jid: Jid) -> Self {
        Self {
            jid: jid.to_bare(),
            name: None,
            groups: BTreeSet::new(),
            subscription: SubscriptionState::None,
            pending_out: false,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a group label.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// Parse from a roster `<item/>` element.
    pub fn from_element(element: &Element) -> Result<Self> {
        let jid: Jid = element
            .attr("jid")
            .ok_or_else(|| Error::parse("roster item without jid"))?
            .parse()?;

        let subscription = element
            .attr("subscription")
            .filter(|s| *s != "remove")
            .map(SubscriptionState::from_attr)
            .transpose()?
            .unwrap_or_default();

        let mut groups = BTreeSet::new();
        for group in element.children().filter(|c| c.is("group", ns::ROSTER)) {
            let label = group.text();
            if !label.is_empty() {
                groups.insert(label);
            }
        }

        Ok(Self {
            jid: jid.to_bare(),
            name: element.attr("name").map(str::to_string),
            groups,
            subscription,
            pending_out: element.attr("ask") == Some("subscribe"),
        })
    }

    /// Whether this element is a removal push.
    pub fn is_removal(element: &Element) -> bool {
        element.attr("subscription") == Some("remove")
    }

    /// Serialize for a roster set (name and groups only; subscription
    /// management is the server's).
    pub fn to_set_element(&self) -> Element {
        let mut item = Element::builder("item", ns::ROSTER)
            .attr("jid", self.jid.to_string())
            .build();
        if let Some(name) = &self.name {
            item.set_attr("name", name.clone());
        }
        for group in &self.groups {
            item.append_child(
                Element::builder("group", ns::ROSTER)
                    .append(group.as_str())
                    .build(),
            );
        }
        item
    }
}

/// The session-local roster mirror, keyed by bare JID.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    items: BTreeMap<Jid, RosterItem>,
}

impl Roster {
    /// An empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a contact by (bare) JID.
    pub fn get(&self, jid: &Jid) -> Option<&RosterItem> {
        self.items.get(&jid.to_bare())
    }

    /// Iterate all items.
    pub fn iter(&self) -> impl Iterator<Item = &RosterItem> {
        self.items.values()
    }

    /// Number of contacts.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert or replace an item.
    pub fn upsert(&mut self, item: RosterItem) {
        self.items.insert(item.jid.clone(), item);
    }

    /// Remove a contact.
    pub fn remove(&mut self, jid: &Jid) -> Option<RosterItem> {
        self.items.remove(&jid.to_bare())
    }

    /// Replace the whole mirror (roster fetch result).
    pub fn replace(&mut self, items: impl IntoIterator<Item = RosterItem>) {
        self.items.clear();
        for item in items {
            self.upsert(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_item() {
        let xml = "<item xmlns='jabber:iq:roster' jid='bob@test' name='Bob' \
                   subscription='both' ask='subscribe'>\
                   <group>Friends</group><group>Work</group></item>";
        let item = RosterItem::from_element(&xml.parse().unwrap()).unwrap();

        assert_eq!(item.jid.to_string(), "bob@test");
        assert_eq!(item.name.as_deref(), Some("Bob"));
        assert_eq!(item.subscription, SubscriptionState::Both);
        assert!(item.pending_out);
        assert_eq!(item.groups.len(), 2);
    }

    #[test]
    fn missing_subscription_defaults_to_none() {
        let xml = "<item xmlns='jabber:iq:roster' jid='bob@test'/>";
        let item = RosterItem::from_element(&xml.parse().unwrap()).unwrap();
        assert_eq!(item.subscription, SubscriptionState::None);
        assert!(!item.pending_out);
    }

    #[test]
    fn removal_is_detected() {
        let xml: Element = "<item xmlns='jabber:iq:roster' jid='bob@test' subscription='remove'/>"
            .parse()
            .unwrap();
        assert!(RosterItem::is_removal(&xml));
    }

    #[test]
    fn set_element_keeps_name_and_groups_only() {
        let item = RosterItem::new("bob@test/resource".parse().unwrap())
            .with_name("Bob")
            .with_group("Friends");
        let elem = item.to_set_element();

        assert_eq!(elem.attr("jid"), Some("bob@test"));
        assert_eq!(elem.attr("name"), Some("Bob"));
        assert!(elem.attr("subscription").is_none());
        assert_eq!(elem.children().count(), 1);
    }

    #[test]
    fn roster_upsert_is_keyed_by_bare_jid() {
        let mut roster = Roster::new();
        roster.upsert(RosterItem::new("bob@test".parse().unwrap()));
        roster.upsert(RosterItem::new("bob@test".parse().unwrap()).with_name("Bob"));

        assert_eq!(roster.len(), 1);
        let full: Jid = "bob@test/home".parse().unwrap();
        assert_eq!(
            roster.get(&full).unwrap().name.as_deref(),
            Some("Bob")
        );
    }
}
