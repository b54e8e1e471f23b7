//! Chat State Notifications (XEP-0085).

use std::sync::Arc;

use minidom::Element;

use crate::connection::Connection;
use crate::error::Result;
use crate::event::Event;
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Message, MessageKind, Stanza};

/// A conversation partner's typing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    /// Actively participating.
    Active,
    /// Composing a message.
    Composing,
    /// Paused mid-composition.
    Paused,
    /// Not paying attention.
    Inactive,
    /// Left the conversation.
    Gone,
}

impl ChatState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Composing => "composing",
            Self::Paused => "paused",
            Self::Inactive => "inactive",
            Self::Gone => "gone",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "active" => Self::Active,
            "composing" => Self::Composing,
            "paused" => Self::Paused,
            "inactive" => Self::Inactive,
            "gone" => Self::Gone,
            _ => return None,
        })
    }
}

/// The chat-states extension.
pub struct ChatStates {
    conn: Connection,
}

impl ChatStates {
    /// Send a standalone chat-state update.
    pub async fn send_chat_state(&self, to: &Jid, state: ChatState) -> Result<()> {
        let message = Message::new(MessageKind::Chat)
            .with_to(to.clone())
            .with_payload(Element::bare(state.as_str(), ns::CHATSTATES));
        self.conn.send_stanza(&Stanza::Message(message)).await
    }

    fn state_of(message: &Message) -> Option<ChatState> {
        message
            .payloads
            .iter()
            .find(|p| p.ns() == ns::CHATSTATES)
            .and_then(|p| ChatState::from_name(p.name()))
    }
}

impl Extension for ChatStates {
    fn tag(&self) -> &'static str {
        "ChatStates"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::CHATSTATES.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, im: &Im) -> bool {
        let Stanza::Message(message) = stanza else {
            return false;
        };
        let Some(state) = Self::state_of(message) else {
            return false;
        };
        let Some(from) = message.from.clone() else {
            return false;
        };

        im.events().emit(Event::ChatStateChanged { from, state });
        // A bare notification is consumed; a message that also carries
        // content continues to the message events.
        message.body().is_none()
    }

    fn filter_output(&self, stanza: &mut Stanza) {
        // Stamp chat messages with <active/> so the peer knows we speak
        // chat states at all.
        let Stanza::Message(message) = stanza else {
            return;
        };
        if message.kind == MessageKind::Chat
            && message.body().is_some()
            && Self::state_of(message).is_none()
        {
            message
                .payloads
                .push(Element::bare(ChatState::Active.as_str(), ns::CHATSTATES));
        }
    }
}

impl ExtensionBuild for ChatStates {
    const TAG: &'static str = "ChatStates";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConfig;

    fn setup() -> (Arc<Im>, Arc<ChatStates>) {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let chat_states = im.load_extension::<ChatStates>().unwrap();
        (im, chat_states)
    }

    #[tokio::test]
    async fn bare_notification_is_consumed() {
        let (im, chat_states) = setup();
        let mut events = im.events().subscribe();

        let xml = "<message xmlns='jabber:client' type='chat' from='bob@test/x'>\
                   <composing xmlns='http://jabber.org/protocol/chatstates'/></message>";
        let message = Message::from_element(&xml.parse().unwrap()).unwrap();
        assert!(chat_states.filter_input(&mut Stanza::Message(message), &im));

        match events.try_recv().unwrap() {
            Event::ChatStateChanged { state, .. } => {
                assert_eq!(state, ChatState::Composing)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_with_body_raises_state_but_passes() {
        let (im, chat_states) = setup();
        let mut events = im.events().subscribe();

        let xml = "<message xmlns='jabber:client' type='chat' from='bob@test/x'>\
                   <body>hi</body>\
                   <active xmlns='http://jabber.org/protocol/chatstates'/></message>";
        let message = Message::from_element(&xml.parse().unwrap()).unwrap();
        assert!(!chat_states.filter_input(&mut Stanza::Message(message), &im));
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::ChatStateChanged { .. }
        ));
    }

    #[tokio::test]
    async fn outbound_chat_messages_are_stamped_active() {
        let (_im, chat_states) = setup();
        let mut stanza = Stanza::Message(Message::chat("bob@test".parse().unwrap(), "hi"));
        chat_states.filter_output(&mut stanza);

        let Stanza::Message(message) = stanza else { unreachable!() };
        assert!(message.payload("active", ns::CHATSTATES).is_some());
    }
}
