//! Message Carbons (XEP-0280).
//!
//! Once enabled, the server copies messages sent or received by our
//! other resources to this one, wrapped in `received`/`sent` envelopes.
//! The unwrapped inner message is re-injected into the inbound dispatch
//! pipeline (never the network). Only one carbon layer is ever
//! unwrapped; a forged nested carbon is dropped.

use std::sync::Arc;

use minidom::Element;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::Result;
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::ns;
use crate::stanza::{Forwarded, Iq, Message, Stanza};

/// The carbons extension.
pub struct Carbons {
    conn: Connection,
}

impl Carbons {
    /// Ask the server to start copying.
    pub async fn enable_carbons(&self) -> Result<()> {
        self.conn
            .request(Iq::set(Element::bare("enable", ns::CARBONS)))
            .await?
            .into_result()?;
        Ok(())
    }

    /// Ask the server to stop copying.
    pub async fn disable_carbons(&self) -> Result<()> {
        self.conn
            .request(Iq::set(Element::bare("disable", ns::CARBONS)))
            .await?
            .into_result()?;
        Ok(())
    }

    fn unwrap_carbon(&self, message: &Message, im: &Im) -> bool {
        let Some(wrapper) = message
            .payload("received", ns::CARBONS)
            .or_else(|| message.payload("sent", ns::CARBONS))
        else {
            return false;
        };

        // Carbons come from our own bare JID; anything else is a spoof.
        let own_bare = self.conn.jid().map(|j| j.to_bare());
        let trusted = match (&message.from, own_bare) {
            (Some(from), Some(own)) => from.to_bare() == own,
            (None, _) => true,
            _ => false,
        };
        if !trusted {
            warn!(from = ?message.from, "dropping carbon from untrusted sender");
            return true;
        }

        let Some(forwarded) = wrapper
            .get_child("forwarded", ns::FORWARD)
            .and_then(|f| Forwarded::from_element(f).ok())
        else {
            debug!("carbon without forwarded payload");
            return true;
        };

        let inner = *forwarded.message;
        // Never unwrap more than one layer.
        if inner.payload("received", ns::CARBONS).is_some()
            || inner.payload("sent", ns::CARBONS).is_some()
        {
            warn!("dropping nested carbon");
            return true;
        }

        im.reinject(Stanza::Message(inner));
        true
    }
}

impl Extension for Carbons {
    fn tag(&self) -> &'static str {
        "Carbons"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::CARBONS.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, im: &Im) -> bool {
        match stanza {
            Stanza::Message(message) => self.unwrap_carbon(message, im),
            _ => false,
        }
    }
}

impl ExtensionBuild for Carbons {
    const TAG: &'static str = "Carbons";

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

    fn setup() -> (Arc<Im>, Arc<Carbons>) {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let carbons = im.load_extension::<Carbons>().unwrap();
        (im, carbons)
    }

    fn carbon_xml(inner: &str) -> String {
        format!(
            "<message xmlns='jabber:client' to='alice@test/home'>\
             <received xmlns='urn:xmpp:carbons:2'>\
             <forwarded xmlns='urn:xmpp:forward:0'>{inner}</forwarded>\
             </received></message>"
        )
    }

    #[tokio::test]
    async fn carbon_is_consumed() {
        let (im, carbons) = setup();
        let xml = carbon_xml(
            "<message xmlns='jabber:client' from='bob@test/x' type='chat'>\
             <body>copied</body></message>",
        );
        let message = Message::from_element(&xml.parse().unwrap()).unwrap();
        assert!(carbons.filter_input(&mut Stanza::Message(message), &im));
    }

    #[tokio::test]
    async fn carbon_from_other_account_is_dropped() {
        let (im, carbons) = setup();
        // from= set to someone else's bare JID.
        let xml = "<message xmlns='jabber:client' from='mallory@evil'>\
             <received xmlns='urn:xmpp:carbons:2'>\
             <forwarded xmlns='urn:xmpp:forward:0'>\
             <message xmlns='jabber:client' from='bob@test/x'><body>fake</body></message>\
             </forwarded></received></message>";
        let message = Message::from_element(&xml.parse().unwrap()).unwrap();
        // Consumed (dropped), not re-injected and not surfaced.
        assert!(carbons.filter_input(&mut Stanza::Message(message), &im));
    }

    #[tokio::test]
    async fn nested_carbons_are_not_unwrapped() {
        let (im, carbons) = setup();
        let inner_carbon = "<message xmlns='jabber:client' from='bob@test/x'>\
             <received xmlns='urn:xmpp:carbons:2'/></message>";
        let xml = carbon_xml(inner_carbon);
        let message = Message::from_element(&xml.parse().unwrap()).unwrap();
        assert!(carbons.filter_input(&mut Stanza::Message(message), &im));
    }

    #[tokio::test]
    async fn plain_messages_pass_through() {
        let (im, carbons) = setup();
        let message = Message::chat("alice@test".parse().unwrap(), "hi");
        assert!(!carbons.filter_input(&mut Stanza::Message(message), &im));
    }
}
