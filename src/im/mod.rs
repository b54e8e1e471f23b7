//! The instant-messaging layer.
//!
//! [`Im`] sits on top of the connection: it owns the extension registry
//! and filter chains, the roster mirror, the presence/subscription state
//! machine, and the typed events raised for stanzas no filter consumed.
//!
//! One dispatch task consumes the connection's inbound channel, so
//! filters for a given stanza always run to completion before the next
//! stanza is looked at.

pub mod privacy;
pub mod roster;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use minidom::Element;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::{fresh_id, Connection};
use crate::error::{Error, Result, StanzaError, StanzaErrorCondition, StanzaErrorType};
use crate::event::{Event, EventBus};
use crate::extension::{ExtensionBuild, ExtensionRegistry};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{
    Availability, Iq, IqPayload, Message, MessageKind, Presence, PresenceKind, Stanza,
};

use roster::{Roster, RosterItem};

/// Reply to an inbound subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDecision {
    /// Send `subscribed`.
    Approve,
    /// Send `unsubscribed`.
    Refuse,
}

type SubscriptionHandler =
    Box<dyn Fn(&Jid) -> Option<SubscriptionDecision> + Send + Sync + 'static>;
type CustomIqHandler =
    Box<dyn Fn(Option<&Jid>, &Element) -> Option<Element> + Send + Sync + 'static>;

/// The IM layer. Construct with [`Im::new`], then load extensions,
/// then authenticate.
pub struct Im {
    conn: Connection,
    registry: ExtensionRegistry,
    roster: Mutex<Roster>,
    subscription_handler: Mutex<Option<SubscriptionHandler>>,
    custom_iq_handler: Mutex<Option<CustomIqHandler>>,
    last_presence: Mutex<Option<Presence>>,
    restore_session: AtomicBool,
}

impl Im {
    /// Attach an IM layer to a (not yet connected) session and start
    /// its dispatch task.
    pub fn new(conn: &Connection) -> Arc<Self> {
        let inbound = conn.attach_dispatch();
        let im = Arc::new(Self {
            conn: conn.clone(),
            registry: ExtensionRegistry::new(),
            roster: Mutex::new(Roster::new()),
            subscription_handler: Mutex::new(None),
            custom_iq_handler: Mutex::new(None),
            last_presence: Mutex::new(None),
            restore_session: AtomicBool::new(false),
        });
        let hook_im = Arc::downgrade(&im);
        conn.set_outbound_hook(Arc::new(move |stanza| {
            if let Some(im) = hook_im.upgrade() {
                for extension in im.registry.snapshot() {
                    extension.filter_output(stanza);
                }
            }
        }));
        tokio::spawn(dispatch_loop(Arc::clone(&im), inbound));
        im
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The session event bus.
    pub fn events(&self) -> &EventBus {
        self.conn.events()
    }

    /// The extension registry.
    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// Load (or fetch) an extension singleton, resolving its declared
    /// dependencies first.
    pub fn load_extension<E: ExtensionBuild>(self: &Arc<Self>) -> Result<Arc<E>> {
        self.registry.load::<E>(self)
    }

    /// Unload an extension and drop its namespace advertisements.
    pub fn unload_extension(&self, tag: &str) -> bool {
        self.registry.unload(tag)
    }

    /// The union of all loaded extensions' namespaces.
    pub fn advertised_namespaces(&self) -> Vec<String> {
        self.registry.namespaces()
    }

    /// Connect, authenticate, fetch the roster and broadcast an initial
    /// available presence.
    pub async fn authenticate(self: &Arc<Self>) -> Result<()> {
        self.conn.connect().await?;
        self.restore_session.store(true, Ordering::SeqCst);
        self.get_roster().await?;
        self.set_status(Availability::Online, 0, BTreeMap::new())
            .await?;
        Ok(())
    }

    /// Connect and authenticate without roster fetch or presence.
    pub async fn simple_authenticate(&self) -> Result<()> {
        self.conn.connect().await
    }

    /// Re-run the negotiation and restore session-scoped state when the
    /// session was established with [`authenticate`](Self::authenticate).
    pub async fn reconnect(&self) -> Result<()> {
        self.conn.reconnect().await?;
        if self.restore_session.load(Ordering::SeqCst) {
            self.refetch_roster().await?;
            let last = self.last_presence.lock().unwrap().clone();
            if let Some(presence) = last {
                self.send_presence(presence).await?;
            }
        }
        Ok(())
    }

    /// Tear down extensions and close the session.
    pub async fn close(&self) -> Result<()> {
        self.registry.clear();
        self.conn.close().await
    }

    /// Register the single subscription-request consumer. Returning
    /// `None` leaves the request unanswered for a later explicit
    /// [`approve_subscription`](Self::approve_subscription) or
    /// [`refuse_subscription`](Self::refuse_subscription).
    pub fn set_subscription_handler(
        &self,
        handler: impl Fn(&Jid) -> Option<SubscriptionDecision> + Send + Sync + 'static,
    ) {
        *self.subscription_handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Register the delegate for IQ requests nothing else handled.
    /// Returning `Some(payload)` replies with an IQ result; `None`
    /// lets the stanza bounce with `service-unavailable`.
    pub fn set_custom_iq_handler(
        &self,
        handler: impl Fn(Option<&Jid>, &Element) -> Option<Element> + Send + Sync + 'static,
    ) {
        *self.custom_iq_handler.lock().unwrap() = Some(Box::new(handler));
    }

    // ---- outbound ---------------------------------------------------

    /// Send a message; the connection runs the output filter chain.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.conn.send_stanza(&Stanza::Message(message)).await
    }

    /// Send a presence; the connection runs the output filter chain.
    pub async fn send_presence(&self, presence: Presence) -> Result<()> {
        self.conn.send_stanza(&Stanza::Presence(presence)).await
    }

    /// Send an IQ request and await the response under the session
    /// default timeout.
    pub async fn request(&self, iq: Iq) -> Result<Iq> {
        self.conn.request(iq).await
    }

    /// Broadcast availability. `Offline` does not exist here on
    /// purpose; disconnecting is [`close`](Self::close).
    pub async fn set_status(
        &self,
        availability: Availability,
        priority: i8,
        messages: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut presence = Presence::available()
            .with_show(availability.show())
            .with_priority(priority);
        presence.statuses = messages;
        *self.last_presence.lock().unwrap() = Some(presence.clone());
        self.send_presence(presence).await
    }

    /// Convenience single-message form of [`set_status`](Self::set_status).
    pub async fn set_presence(
        &self,
        availability: Availability,
        status: Option<String>,
    ) -> Result<()> {
        let mut messages = BTreeMap::new();
        if let Some(status) = status {
            messages.insert(String::new(), status);
        }
        self.set_status(availability, 0, messages).await
    }

    // ---- roster -----------------------------------------------------

    /// Fetch the roster from the server, replacing the local mirror.
    pub async fn get_roster(&self) -> Result<Roster> {
        self.refetch_roster().await?;
        Ok(self.roster.lock().unwrap().clone())
    }

    /// The current local roster mirror without a network fetch.
    pub fn roster(&self) -> Roster {
        self.roster.lock().unwrap().clone()
    }

    /// Add or update a contact. The local mirror updates when the
    /// server's roster push arrives.
    pub async fn add_contact(&self, item: RosterItem) -> Result<()> {
        let query = Element::builder("query", ns::ROSTER)
            .append(item.to_set_element())
            .build();
        self.request(Iq::set(query)).await?.into_result()?;
        Ok(())
    }

    /// Remove a contact and any subscriptions to it.
    pub async fn remove_contact(&self, jid: &Jid) -> Result<()> {
        let item = Element::builder("item", ns::ROSTER)
            .attr("jid", jid.to_bare().to_string())
            .attr("subscription", "remove")
            .build();
        let query = Element::builder("query", ns::ROSTER).append(item).build();
        self.request(Iq::set(query)).await?.into_result()?;
        Ok(())
    }

    // ---- subscription primitives ------------------------------------

    /// Ask for the contact's presence (`subscribe`).
    pub async fn request_subscription(&self, jid: &Jid) -> Result<()> {
        self.send_subscription_presence(jid, PresenceKind::Subscribe)
            .await
    }

    /// Grant a pending request (`subscribed`).
    pub async fn approve_subscription(&self, jid: &Jid) -> Result<()> {
        self.send_subscription_presence(jid, PresenceKind::Subscribed)
            .await
    }

    /// Deny a pending request (`unsubscribed`).
    pub async fn refuse_subscription(&self, jid: &Jid) -> Result<()> {
        self.send_subscription_presence(jid, PresenceKind::Unsubscribed)
            .await
    }

    /// Stop receiving the contact's presence (`unsubscribe`).
    pub async fn unsubscribe(&self, jid: &Jid) -> Result<()> {
        self.send_subscription_presence(jid, PresenceKind::Unsubscribe)
            .await
    }

    /// Revoke the contact's subscription to us (`unsubscribed`).
    pub async fn revoke_subscription(&self, jid: &Jid) -> Result<()> {
        self.send_subscription_presence(jid, PresenceKind::Unsubscribed)
            .await
    }

    /// Re-inject a stanza into the inbound pipeline (filter use).
    pub fn reinject(&self, stanza: Stanza) {
        self.conn.reinject_inbound(stanza);
    }

    async fn send_subscription_presence(&self, jid: &Jid, kind: PresenceKind) -> Result<()> {
        let presence = Presence::new(kind).with_to(jid.to_bare());
        self.send_presence(presence).await
    }

    async fn refetch_roster(&self) -> Result<()> {
        let iq = Iq::get(Element::bare("query", ns::ROSTER)).with_id(fresh_id());
        let response = self.conn.request(iq).await?;
        let payload = response
            .into_result()?
            .ok_or_else(|| Error::protocol("roster result without query"))?;

        let items = payload
            .children()
            .filter(|c| c.is("item", ns::ROSTER))
            .map(RosterItem::from_element)
            .collect::<Result<Vec<_>>>()?;
        self.roster.lock().unwrap().replace(items);
        Ok(())
    }

    // ---- inbound ----------------------------------------------------

    async fn process_inbound(self: &Arc<Self>, mut stanza: Stanza) {
        // Correlated responses release their waiter here, in wire order
        // with the stanzas that preceded them; they never meet the
        // filter chain. Unsolicited responses drop silently.
        if let Stanza::Iq(iq) = &stanza {
            if iq.is_response() {
                self.conn.resolve_response(iq);
                return;
            }
        }

        for extension in self.registry.snapshot() {
            if extension.filter_input(&mut stanza, self) {
                return;
            }
        }
        match stanza {
            Stanza::Message(message) => self.handle_message(message),
            Stanza::Presence(presence) => self.handle_presence(presence).await,
            Stanza::Iq(iq) => self.handle_iq_request(iq).await,
        }
    }

    fn handle_message(&self, message: Message) {
        match message.kind {
            MessageKind::Error => self.events().emit(Event::ErrorMessage(message)),
            _ => self.events().emit(Event::Message(message)),
        }
    }

    async fn handle_presence(self: &Arc<Self>, presence: Presence) {
        let Some(from) = presence.from.clone() else {
            debug!("dropping presence without sender");
            return;
        };
        match presence.kind {
            PresenceKind::Available | PresenceKind::Unavailable => {
                let availability = match presence.kind {
                    PresenceKind::Available => {
                        Some(Availability::from_show(presence.show))
                    }
                    _ => None,
                };
                self.events().emit(Event::StatusChanged {
                    from,
                    availability,
                    priority: presence.priority,
                    statuses: presence.statuses,
                });
            }
            PresenceKind::Subscribe => {
                let bare = from.to_bare();
                let decision = {
                    let handler = self.subscription_handler.lock().unwrap();
                    handler.as_ref().and_then(|h| h(&bare))
                };
                match decision {
                    Some(SubscriptionDecision::Approve) => {
                        if let Err(error) = self.approve_subscription(&bare).await {
                            warn!(error = %error, "failed to approve subscription");
                        }
                    }
                    Some(SubscriptionDecision::Refuse) => {
                        if let Err(error) = self.refuse_subscription(&bare).await {
                            warn!(error = %error, "failed to refuse subscription");
                        }
                    }
                    None => debug!(from = %bare, "subscription request left pending"),
                }
            }
            PresenceKind::Subscribed => {
                self.events().emit(Event::SubscriptionApproved(from.to_bare()));
            }
            PresenceKind::Unsubscribed => {
                // A refusal answers our pending request; anything else is
                // a revocation of an existing subscription.
                let bare = from.to_bare();
                let pending = self
                    .roster
                    .lock()
                    .unwrap()
                    .get(&bare)
                    .map(|item| item.pending_out)
                    .unwrap_or(false);
                if pending {
                    self.events().emit(Event::SubscriptionRefused(bare));
                } else {
                    self.events().emit(Event::Unsubscribed(bare));
                }
            }
            PresenceKind::Unsubscribe | PresenceKind::Probe => {
                debug!(kind = ?presence.kind, "ignoring presence");
            }
            PresenceKind::Error => {
                if let Some(error) = presence.error {
                    self.events().emit(Event::Error(Arc::new(error.into())));
                }
            }
        }
    }

    async fn handle_iq_request(self: &Arc<Self>, iq: Iq) {
        let Some(payload) = iq.request_payload() else {
            debug!("response iq leaked into the request path");
            return;
        };

        if payload.is("query", ns::ROSTER) && matches!(iq.payload, IqPayload::Set(_)) {
            self.handle_roster_push(&iq).await;
            return;
        }

        let reply = {
            let handler = self.custom_iq_handler.lock().unwrap();
            handler.as_ref().and_then(|h| h(iq.from.as_ref(), payload))
        };
        let response = match reply {
            Some(payload) => Iq::result_for(&iq, Some(payload)),
            None => Iq::error_for(
                &iq,
                StanzaError::new(
                    StanzaErrorType::Cancel,
                    StanzaErrorCondition::ServiceUnavailable,
                ),
            ),
        };
        if let Err(error) = self.conn.send_stanza(&Stanza::Iq(response)).await {
            warn!(error = %error, "failed to answer iq request");
        }
    }

    /// Apply a roster push if, and only if, it comes from ourselves or
    /// the server; anything else is a spoof attempt and dropped without
    /// acknowledgement.
    async fn handle_roster_push(self: &Arc<Self>, iq: &Iq) {
        let trusted = match (&iq.from, self.conn.jid()) {
            (None, _) => true,
            (Some(from), Some(own)) => *from == own || *from == own.to_bare(),
            (Some(_), None) => false,
        };
        if !trusted {
            warn!(from = ?iq.from, "ignoring roster push from untrusted sender");
            return;
        }

        let Some(query) = iq.request_payload() else { return };
        let mut updates = Vec::new();
        for child in query.children().filter(|c| c.is("item", ns::ROSTER)) {
            if RosterItem::is_removal(child) {
                let Some(jid) = child.attr("jid").and_then(|j| j.parse::<Jid>().ok()) else {
                    continue;
                };
                let removed = self.roster.lock().unwrap().remove(&jid);
                updates.push(removed.unwrap_or_else(|| RosterItem::new(jid)));
            } else {
                match RosterItem::from_element(child) {
                    Ok(item) => {
                        self.roster.lock().unwrap().upsert(item.clone());
                        updates.push(item);
                    }
                    Err(error) => {
                        debug!(error = %error, "skipping malformed roster push item")
                    }
                }
            }
        }

        let ack = Iq::result_for(iq, None);
        if let Err(error) = self.conn.send_stanza(&Stanza::Iq(ack)).await {
            warn!(error = %error, "failed to acknowledge roster push");
        }
        for item in updates {
            self.events().emit(Event::RosterUpdated(item));
        }
    }
}

async fn dispatch_loop(im: Arc<Im>, mut inbound: mpsc::Receiver<Stanza>) {
    while let Some(stanza) = inbound.recv().await {
        im.process_inbound(stanza).await;
    }
    debug!("im dispatch loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConfig;
    use crate::extension::Extension;

    fn offline_im() -> Arc<Im> {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        Im::new(&conn)
    }

    struct Consuming;
    impl Extension for Consuming {
        fn tag(&self) -> &'static str {
            "Consuming"
        }
        fn namespaces(&self) -> Vec<String> {
            vec!["urn:test:consuming".into()]
        }
        fn filter_input(&self, _stanza: &mut Stanza, _im: &Im) -> bool {
            true
        }
    }
    impl ExtensionBuild for Consuming {
        const TAG: &'static str = "Consuming";
        fn build(_im: &Arc<Im>) -> Result<Arc<Self>> {
            Ok(Arc::new(Consuming))
        }
    }

    struct NeedsConsuming;
    impl Extension for NeedsConsuming {
        fn tag(&self) -> &'static str {
            "NeedsConsuming"
        }
    }
    impl ExtensionBuild for NeedsConsuming {
        const TAG: &'static str = "NeedsConsuming";
        fn dependencies() -> &'static [&'static str] {
            &["Consuming"]
        }
        fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
            im.load_extension::<Consuming>()?;
            Ok(Arc::new(NeedsConsuming))
        }
    }

    struct CycleA;
    impl Extension for CycleA {
        fn tag(&self) -> &'static str {
            "CycleA"
        }
    }
    impl ExtensionBuild for CycleA {
        const TAG: &'static str = "CycleA";
        fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
            im.load_extension::<CycleB>()?;
            Ok(Arc::new(CycleA))
        }
    }

    struct CycleB;
    impl Extension for CycleB {
        fn tag(&self) -> &'static str {
            "CycleB"
        }
    }
    impl ExtensionBuild for CycleB {
        const TAG: &'static str = "CycleB";
        fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
            im.load_extension::<CycleA>()?;
            Ok(Arc::new(CycleB))
        }
    }

    #[tokio::test]
    async fn extensions_are_singletons() {
        let im = offline_im();
        let first = im.load_extension::<Consuming>().unwrap();
        let second = im.load_extension::<Consuming>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(im.registry().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn dependencies_load_before_dependents() {
        let im = offline_im();
        im.load_extension::<NeedsConsuming>().unwrap();
        let order: Vec<&str> = im.registry().snapshot().iter().map(|e| e.tag()).collect();
        assert_eq!(order, vec!["Consuming", "NeedsConsuming"]);
    }

    #[tokio::test]
    async fn dependency_cycles_are_rejected() {
        let im = offline_im();
        let error = im.load_extension::<CycleA>();
        assert!(matches!(error, Err(Error::InvalidArgument(_))));
        assert!(!im.registry().contains("CycleA"));
        assert!(!im.registry().contains("CycleB"));
    }

    #[tokio::test]
    async fn namespace_union_follows_loads_and_unloads() {
        let im = offline_im();
        im.load_extension::<Consuming>().unwrap();
        assert_eq!(im.advertised_namespaces(), vec!["urn:test:consuming"]);

        assert!(im.unload_extension("Consuming"));
        assert!(im.advertised_namespaces().is_empty());
    }

    #[tokio::test]
    async fn consuming_filter_short_circuits_events() {
        let im = offline_im();
        im.load_extension::<Consuming>().unwrap();
        let mut events = im.events().subscribe();

        let message = Message::chat("alice@test".parse().unwrap(), "hi");
        im.process_inbound(Stanza::Message(message)).await;

        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn unconsumed_message_raises_event() {
        let im = offline_im();
        let mut events = im.events().subscribe();

        let mut message = Message::chat("alice@test".parse().unwrap(), "hi");
        message.from = Some("bob@test/x".parse().unwrap());
        im.process_inbound(Stanza::Message(message)).await;

        match events.try_recv().unwrap() {
            Event::Message(message) => assert_eq!(message.body(), Some("hi")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn untrusted_roster_push_is_ignored() {
        let im = offline_im();
        let mut events = im.events().subscribe();

        let xml = "<iq xmlns='jabber:client' type='set' id='p1' from='mallory@evil/x'>\
                   <query xmlns='jabber:iq:roster'>\
                   <item jid='mallory@evil' subscription='both'/></query></iq>";
        let iq = Iq::from_element(&xml.parse().unwrap()).unwrap();
        im.process_inbound(Stanza::Iq(iq)).await;

        assert!(im.roster().is_empty());
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn serverless_roster_push_updates_mirror() {
        let im = offline_im();
        let mut events = im.events().subscribe();

        // from absent = trusted (our own server).
        let xml = "<iq xmlns='jabber:client' type='set' id='p2'>\
                   <query xmlns='jabber:iq:roster'>\
                   <item jid='bob@test' subscription='to'/></query></iq>";
        let iq = Iq::from_element(&xml.parse().unwrap()).unwrap();
        im.process_inbound(Stanza::Iq(iq)).await;

        assert_eq!(im.roster().len(), 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::RosterUpdated(_)
        ));
    }

    #[tokio::test]
    async fn inbound_subscribed_presence_raises_approved() {
        let im = offline_im();
        let mut events = im.events().subscribe();

        let xml = "<presence xmlns='jabber:client' type='subscribed' from='bob@test'/>";
        let presence = Presence::from_element(&xml.parse().unwrap()).unwrap();
        im.process_inbound(Stanza::Presence(presence)).await;

        match events.try_recv().unwrap() {
            Event::SubscriptionApproved(jid) => assert_eq!(jid.to_string(), "bob@test"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn availability_presence_raises_status_changed() {
        let im = offline_im();
        let mut events = im.events().subscribe();

        let xml = "<presence xmlns='jabber:client' from='bob@test/desk'>\
                   <show>away</show><priority>3</priority><status>brb</status></presence>";
        let presence = Presence::from_element(&xml.parse().unwrap()).unwrap();
        im.process_inbound(Stanza::Presence(presence)).await;

        match events.try_recv().unwrap() {
            Event::StatusChanged {
                from,
                availability,
                priority,
                statuses,
            } => {
                assert_eq!(from.to_string(), "bob@test/desk");
                assert_eq!(availability, Some(Availability::Away));
                assert_eq!(priority, 3);
                assert_eq!(statuses.get("").map(String::as_str), Some("brb"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
