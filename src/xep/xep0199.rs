//! XMPP Ping (XEP-0199).

use std::sync::Arc;
use std::time::{Duration, Instant};

use minidom::Element;

use crate::connection::Connection;
use crate::error::Result;
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqPayload, Stanza};

/// The ping extension.
pub struct Ping {
    conn: Connection,
}

impl Ping {
    /// Ping a JID (or the server when `None`) and measure the
    /// round-trip time. A `service-unavailable` answer still proves the
    /// peer is there, so it counts as success.
    pub async fn ping(&self, to: Option<&Jid>) -> Result<Duration> {
        let mut iq = Iq::get(Element::bare("ping", ns::PING));
        if let Some(to) = to {
            iq = iq.with_to(to.clone());
        }
        let started = Instant::now();
        match self.conn.request(iq).await {
            Ok(_) => Ok(started.elapsed()),
            Err(crate::error::Error::Stanza {
                condition: crate::error::StanzaErrorCondition::ServiceUnavailable,
                ..
            }) => Ok(started.elapsed()),
            Err(error) => Err(error),
        }
    }
}

impl Extension for Ping {
    fn tag(&self) -> &'static str {
        "Ping"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::PING.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, _im: &Im) -> bool {
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        let is_ping = matches!(
            iq.payload,
            IqPayload::Get(ref p) if p.is("ping", ns::PING)
        );
        if !is_ping {
            return false;
        }
        self.conn
            .send_stanza_background(Stanza::Iq(Iq::result_for(iq, None)));
        true
    }
}

impl ExtensionBuild for Ping {
    const TAG: &'static str = "Ping";

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

    #[tokio::test]
    async fn inbound_ping_is_answered_and_consumed() {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let ping = im.load_extension::<Ping>().unwrap();

        let xml = "<iq xmlns='jabber:client' type='get' id='p1' from='test'>\
                   <ping xmlns='urn:xmpp:ping'/></iq>";
        let iq = Iq::from_element(&xml.parse().unwrap()).unwrap();
        assert!(ping.filter_input(&mut Stanza::Iq(iq), &im));
    }

    #[tokio::test]
    async fn other_iqs_pass_through() {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let ping = im.load_extension::<Ping>().unwrap();

        let xml = "<iq xmlns='jabber:client' type='get' id='v1'>\
                   <query xmlns='jabber:iq:version'/></iq>";
        let iq = Iq::from_element(&xml.parse().unwrap()).unwrap();
        assert!(!ping.filter_input(&mut Stanza::Iq(iq), &im));
    }
}
