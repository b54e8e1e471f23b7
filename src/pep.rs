//! Personal Eventing Protocol (XEP-0163).
//!
//! PEP is pubsub over the user's own bare JID: publishes go out as IQ
//! sets to personal nodes, and the server fans items out to interested
//! contacts as `<message/>` stanzas carrying an event payload. Interest
//! is signalled by advertising `<node>+notify` in entity caps, which is
//! why this extension's namespace list carries the `+notify` variants.

use std::sync::Arc;

use dashmap::DashMap;
use minidom::Element;
use tracing::debug;

use crate::connection::Connection;
use crate::error::Result;
use crate::event::Event;
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, Message, MessageKind, Stanza};

/// A published user mood (XEP-0107).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mood {
    /// The mood value element name ("happy", "annoyed", ...).
    pub value: String,
    /// Free-text elaboration.
    pub text: Option<String>,
}

impl Mood {
    /// Build a mood.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            text: None,
        }
    }

    /// Attach text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    fn from_element(element: &Element) -> Option<Self> {
        let mut value = None;
        let mut text = None;
        for child in element.children() {
            if child.name() == "text" {
                let t = child.text();
                if !t.is_empty() {
                    text = Some(t);
                }
            } else if value.is_none() {
                value = Some(child.name().to_string());
            }
        }
        Some(Self {
            value: value?,
            text,
        })
    }

    fn to_element(&self) -> Element {
        let mut mood = Element::builder("mood", ns::MOOD).build();
        mood.append_child(Element::bare(self.value.as_str(), ns::MOOD));
        if let Some(text) = &self.text {
            mood.append_child(
                Element::builder("text", ns::MOOD).append(text.as_str()).build(),
            );
        }
        mood
    }
}

/// A published user activity (XEP-0108).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    /// General category ("relaxing", "working", ...).
    pub general: String,
    /// Specific activity within the category.
    pub specific: Option<String>,
    /// Free-text elaboration.
    pub text: Option<String>,
}

impl Activity {
    /// Build an activity.
    pub fn new(general: impl Into<String>) -> Self {
        Self {
            general: general.into(),
            specific: None,
            text: None,
        }
    }

    /// Refine with a specific activity.
    pub fn with_specific(mut self, specific: impl Into<String>) -> Self {
        self.specific = Some(specific.into());
        self
    }

    fn from_element(element: &Element) -> Option<Self> {
        let mut activity = None;
        let mut text = None;
        for child in element.children() {
            if child.name() == "text" {
                let t = child.text();
                if !t.is_empty() {
                    text = Some(t);
                }
            } else if activity.is_none() {
                let specific = child.children().next().map(|c| c.name().to_string());
                activity = Some((child.name().to_string(), specific));
            }
        }
        let (general, specific) = activity?;
        Some(Self {
            general,
            specific,
            text,
        })
    }

    fn to_element(&self) -> Element {
        let mut general = Element::builder(self.general.as_str(), ns::ACTIVITY).build();
        if let Some(specific) = &self.specific {
            general.append_child(Element::bare(specific.as_str(), ns::ACTIVITY));
        }
        let mut activity = Element::builder("activity", ns::ACTIVITY).build();
        activity.append_child(general);
        if let Some(text) = &self.text {
            activity.append_child(
                Element::builder("text", ns::ACTIVITY)
                    .append(text.as_str())
                    .build(),
            );
        }
        activity
    }
}

/// A published "now listening" record (XEP-0118).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tune {
    /// Performing artist.
    pub artist: Option<String>,
    /// Track length in seconds.
    pub length: Option<u32>,
    /// User rating, 1..=10.
    pub rating: Option<u8>,
    /// Album or other source.
    pub source: Option<String>,
    /// Track title.
    pub title: Option<String>,
    /// Track number or identifier.
    pub track: Option<String>,
    /// URI for the song.
    pub uri: Option<String>,
}

impl Tune {
    fn from_element(element: &Element) -> Option<Self> {
        let text = |name: &str| {
            element
                .get_child(name, ns::TUNE)
                .map(|c| c.text())
                .filter(|t| !t.is_empty())
        };
        let tune = Self {
            artist: text("artist"),
            length: text("length").and_then(|l| l.parse().ok()),
            rating: text("rating").and_then(|r| r.parse().ok()),
            source: text("source"),
            title: text("title"),
            track: text("track"),
            uri: text("uri"),
        };
        (tune != Self::default()).then_some(tune)
    }

    fn to_element(&self) -> Element {
        let mut tune = Element::builder("tune", ns::TUNE).build();
        let mut push = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                tune.append_child(
                    Element::builder(name, ns::TUNE).append(value.as_str()).build(),
                );
            }
        };
        push("artist", self.artist.clone());
        push("length", self.length.map(|l| l.to_string()));
        push("rating", self.rating.map(|r| r.to_string()));
        push("source", self.source.clone());
        push("title", self.title.clone());
        push("track", self.track.clone());
        push("uri", self.uri.clone());
        tune
    }
}

type ItemHandler = Box<dyn Fn(&Jid, Option<&Element>) + Send + Sync + 'static>;

/// The PEP extension.
pub struct Pep {
    conn: Connection,
    /// node -> listener for non-built-in payloads.
    handlers: DashMap<String, ItemHandler>,
}

impl Pep {
    /// Publish one item payload to a personal node.
    pub async fn publish(&self, node: &str, payload: Element) -> Result<()> {
        let item = Element::builder("item", ns::PUBSUB).append(payload).build();
        let publish = Element::builder("publish", ns::PUBSUB)
            .attr("node", node)
            .append(item)
            .build();
        let pubsub = Element::builder("pubsub", ns::PUBSUB).append(publish).build();
        self.conn.request(Iq::set(pubsub)).await?.into_result()?;
        Ok(())
    }

    /// Publish or clear the user mood.
    pub async fn set_mood(&self, mood: Option<Mood>) -> Result<()> {
        let payload = match mood {
            Some(mood) => mood.to_element(),
            None => Element::bare("mood", ns::MOOD),
        };
        self.publish(ns::MOOD, payload).await
    }

    /// Publish or clear the user activity.
    pub async fn set_activity(&self, activity: Option<Activity>) -> Result<()> {
        let payload = match activity {
            Some(activity) => activity.to_element(),
            None => Element::bare("activity", ns::ACTIVITY),
        };
        self.publish(ns::ACTIVITY, payload).await
    }

    /// Publish or clear the current tune.
    pub async fn set_tune(&self, tune: Option<Tune>) -> Result<()> {
        let payload = match tune {
            Some(tune) => tune.to_element(),
            None => Element::bare("tune", ns::TUNE),
        };
        self.publish(ns::TUNE, payload).await
    }

    /// Register a listener for a node without built-in typing. The
    /// payload is `None` for retractions and empty publishes.
    pub fn set_item_handler(
        &self,
        node: impl Into<String>,
        handler: impl Fn(&Jid, Option<&Element>) + Send + Sync + 'static,
    ) {
        self.handlers.insert(node.into(), Box::new(handler));
    }

    fn dispatch_items(&self, from: &Jid, items: &Element, im: &Im) {
        let node = items.attr("node").unwrap_or("");
        let payload = items
            .children()
            .find(|c| c.is("item", ns::PUBSUB_EVENT))
            .and_then(|item| item.children().next());

        match node {
            ns::MOOD => {
                let mood = payload.and_then(Mood::from_element);
                im.events().emit(Event::MoodChanged {
                    from: from.to_bare(),
                    mood,
                });
            }
            ns::ACTIVITY => {
                let activity = payload.and_then(Activity::from_element);
                im.events().emit(Event::ActivityChanged {
                    from: from.to_bare(),
                    activity,
                });
            }
            ns::TUNE => {
                let tune = payload.and_then(Tune::from_element);
                im.events().emit(Event::Tune {
                    from: from.to_bare(),
                    tune,
                });
            }
            other => match self.handlers.get(other) {
                Some(handler) => handler(&from.to_bare(), payload),
                None => debug!(node = other, "pep item for unhandled node"),
            },
        }
    }

    fn handle_event_message(&self, message: &Message, im: &Im) -> bool {
        if !matches!(message.kind, MessageKind::Normal | MessageKind::Headline) {
            return false;
        }
        let Some(event) = message.payload("event", ns::PUBSUB_EVENT) else {
            return false;
        };
        let Some(from) = &message.from else {
            return false;
        };
        if let Some(items) = event.get_child("items", ns::PUBSUB_EVENT) {
            self.dispatch_items(from, items, im);
        }
        true
    }
}

impl Extension for Pep {
    fn tag(&self) -> &'static str {
        "Pep"
    }

    fn namespaces(&self) -> Vec<String> {
        // The +notify variants ask servers to fan these nodes out to us.
        vec![
            ns::MOOD.to_string(),
            format!("{}+notify", ns::MOOD),
            ns::ACTIVITY.to_string(),
            format!("{}+notify", ns::ACTIVITY),
            ns::TUNE.to_string(),
            format!("{}+notify", ns::TUNE),
        ]
    }

    fn filter_input(&self, stanza: &mut Stanza, im: &Im) -> bool {
        match stanza {
            Stanza::Message(message) => self.handle_event_message(message, im),
            _ => false,
        }
    }
}

impl ExtensionBuild for Pep {
    const TAG: &'static str = "Pep";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
            handlers: DashMap::new(),
        }))
    }
}
