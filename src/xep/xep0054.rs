//! vCard storage (XEP-0054) with vCard-based avatar advertisement
//! (XEP-0153).
//!
//! The vCard payload stays a raw element: decoding photo binaries and
//! rendering the card is the caller's business. When an avatar hash is
//! set, broadcast presence carries the `vcard-temp:x:update`
//! advertisement.

use std::sync::{Arc, Mutex};

use minidom::Element;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, PresenceKind, Stanza};

/// The vCard extension.
pub struct VCard {
    conn: Connection,
    /// SHA-1 hex of the published avatar photo, advertised in presence.
    avatar_hash: Mutex<Option<String>>,
}

impl VCard {
    /// Fetch a vCard; `None` targets our own.
    pub async fn get_vcard(&self, jid: Option<&Jid>) -> Result<Element> {
        let mut iq = Iq::get(Element::bare("vCard", ns::VCARD));
        if let Some(jid) = jid {
            iq = iq.with_to(jid.to_bare());
        }
        self.conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("vCard result without payload"))
    }

    /// Publish our own vCard.
    pub async fn set_vcard(&self, vcard: Element) -> Result<()> {
        if !vcard.is("vCard", ns::VCARD) {
            return Err(Error::invalid_argument("payload is not a vCard element"));
        }
        self.conn.request(Iq::set(vcard)).await?.into_result()?;
        Ok(())
    }

    /// Set the avatar photo hash advertised in presence; `None` stops
    /// advertising.
    pub fn set_avatar_hash(&self, hash: Option<String>) {
        *self.avatar_hash.lock().unwrap() = hash;
    }
}

impl Extension for VCard {
    fn tag(&self) -> &'static str {
        "VCard"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::VCARD.to_string(), ns::VCARD_UPDATE.to_string()]
    }

    fn filter_output(&self, stanza: &mut Stanza) {
        let Stanza::Presence(presence) = stanza else {
            return;
        };
        if presence.kind != PresenceKind::Available || presence.to.is_some() {
            return;
        }
        let Some(hash) = self.avatar_hash.lock().unwrap().clone() else {
            return;
        };
        if presence.payload("x", ns::VCARD_UPDATE).is_some() {
            return;
        }
        let photo = Element::builder("photo", ns::VCARD_UPDATE)
            .append(hash.as_str())
            .build();
        presence
            .payloads
            .push(Element::builder("x", ns::VCARD_UPDATE).append(photo).build());
    }
}

impl ExtensionBuild for VCard {
    const TAG: &'static str = "VCard";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
            avatar_hash: Mutex::new(None),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConfig;
    use crate::stanza::Presence;

    #[tokio::test]
    async fn broadcast_presence_carries_avatar_hash() {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let vcard = im.load_extension::<VCard>().unwrap();
        vcard.set_avatar_hash(Some("deadbeef".into()));

        let mut stanza = Stanza::Presence(Presence::available());
        vcard.filter_output(&mut stanza);

        let Stanza::Presence(presence) = stanza else { unreachable!() };
        let x = presence.payload("x", ns::VCARD_UPDATE).unwrap();
        assert_eq!(x.get_child("photo", ns::VCARD_UPDATE).unwrap().text(), "deadbeef");
    }

    #[tokio::test]
    async fn directed_presence_is_left_alone() {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let vcard = im.load_extension::<VCard>().unwrap();
        vcard.set_avatar_hash(Some("deadbeef".into()));

        let mut stanza = Stanza::Presence(
            Presence::available().with_to("room@conf.test/alice".parse().unwrap()),
        );
        vcard.filter_output(&mut stanza);

        let Stanza::Presence(presence) = stanza else { unreachable!() };
        assert!(presence.payload("x", ns::VCARD_UPDATE).is_none());
    }
}
