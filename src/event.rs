//! Typed session events.
//!
//! Events are structured records fanned out on a broadcast channel; any
//! number of consumers may subscribe and lagging consumers only lose
//! their own backlog.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::connection::SessionState;
use crate::im::roster::RosterItem;
use crate::jid::Jid;
use crate::muc::{GroupPresence, MucError, MucInvite, MucInviteDeclined};
use crate::pep::{Activity, Mood, Tune};
use crate::stanza::{Availability, Message};
use crate::xep::xep0085::ChatState;

/// Everything a session can notify about.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection state machine moved.
    Connect(SessionState),
    /// A contact's availability changed.
    StatusChanged {
        /// The full JID the presence came from.
        from: Jid,
        /// `None` means the contact went offline.
        availability: Option<Availability>,
        /// Announced priority.
        priority: i8,
        /// Localized status messages ("" = default language).
        statuses: BTreeMap<String, String>,
    },
    /// An inbound message passed the filter chain unconsumed.
    Message(Message),
    /// An inbound message bounced with an error.
    ErrorMessage(Message),
    /// A roster push updated the local roster.
    RosterUpdated(RosterItem),
    /// The peer approved our subscription request.
    SubscriptionApproved(Jid),
    /// The peer refused our subscription request.
    SubscriptionRefused(Jid),
    /// The peer cancelled their subscription to us.
    Unsubscribed(Jid),
    /// A MUC room subject was set or changed.
    GroupChatSubjectChanged {
        /// The room.
        room: Jid,
        /// The nickname that set the subject, when disclosed.
        nick: Option<String>,
        /// The new subject.
        subject: String,
    },
    /// Occupant presence changed in a joined room.
    GroupPresenceChanged(GroupPresence),
    /// A room invite (mediated or direct) arrived.
    GroupInviteReceived(MucInvite),
    /// An invite we sent was declined.
    GroupInviteDeclined(MucInviteDeclined),
    /// A MUC-level error arrived for a room interaction.
    GroupMucError(MucError),
    /// A contact published a mood.
    MoodChanged {
        /// The publishing bare JID.
        from: Jid,
        /// The payload; `None` retracts the mood.
        mood: Option<Mood>,
    },
    /// A contact published an activity.
    ActivityChanged {
        /// The publishing bare JID.
        from: Jid,
        /// The payload; `None` retracts the activity.
        activity: Option<Activity>,
    },
    /// A contact published what they are listening to.
    Tune {
        /// The publishing bare JID.
        from: Jid,
        /// The payload; `None` stops publication.
        tune: Option<Tune>,
    },
    /// A chat-state notification arrived.
    ChatStateChanged {
        /// The sender.
        from: Jid,
        /// Their state.
        state: ChatState,
    },
    /// Bytes moved on a file transfer.
    FileTransferProgress {
        /// Session id.
        sid: String,
        /// File name from the offer.
        name: String,
        /// Bytes moved so far.
        transferred: u64,
        /// Total bytes expected.
        total: u64,
    },
    /// A file transfer ended before completion.
    FileTransferAborted {
        /// Session id.
        sid: String,
        /// Human-readable cause.
        reason: String,
    },
    /// A non-fatal asynchronous error (malformed stanza, filter panic).
    Error(Arc<crate::error::Error>),
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast fan-out for [`Event`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe; the receiver sees events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit to all current subscribers. Fine to call with none.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Event::Connect(SessionState::Connecting));
        bus.emit(Event::Connect(SessionState::Ready));

        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::Connect(SessionState::Connecting)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::Connect(SessionState::Ready)
        ));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.emit(Event::Connect(SessionState::Disconnected));
    }
}
