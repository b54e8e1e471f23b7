//! Blocking Command (XEP-0191).
//!
//! Preferred when the server advertises `urn:xmpp:blocking`; otherwise
//! a best-effort fallback maintains a privacy list named `blocked`.
//! The fallback is not a wire-level standard and other clients may not
//! honor it.

use std::sync::Arc;

use minidom::Element;
use tracing::info;

use crate::connection::Connection;
use crate::disco::ServiceDiscovery;
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::im::privacy::{
    PrivacyAction, PrivacyList, PrivacyRule, PrivacySelector,
};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqPayload, Stanza};

const FALLBACK_LIST: &str = "blocked";

/// The blocking extension.
pub struct Blocking {
    conn: Connection,
    disco: Arc<ServiceDiscovery>,
    im: std::sync::Weak<Im>,
}

impl Blocking {
    async fn server_supports_blocking(&self) -> Result<bool> {
        let server = Jid::domain(&self.conn.domain())?;
        self.disco.supports_namespace(&server, ns::BLOCKING).await
    }

    /// Block all communication with a JID.
    pub async fn block(&self, jid: &Jid) -> Result<()> {
        if self.server_supports_blocking().await? {
            let item = Element::builder("item", ns::BLOCKING)
                .attr("jid", jid.to_bare().to_string())
                .build();
            let block = Element::builder("block", ns::BLOCKING).append(item).build();
            self.conn.request(Iq::set(block)).await?.into_result()?;
            return Ok(());
        }
        self.fallback_update(|rules| {
            let jid = jid.to_bare();
            if !rules.iter().any(|r| r.selector == PrivacySelector::Jid(jid.clone())) {
                let order = rules.iter().map(|r| r.order).max().unwrap_or(0) + 1;
                rules.push(
                    PrivacyRule::new(order, PrivacyAction::Deny)
                        .with_selector(PrivacySelector::Jid(jid)),
                );
            }
        })
        .await
    }

    /// Lift a block.
    pub async fn unblock(&self, jid: &Jid) -> Result<()> {
        if self.server_supports_blocking().await? {
            let item = Element::builder("item", ns::BLOCKING)
                .attr("jid", jid.to_bare().to_string())
                .build();
            let unblock = Element::builder("unblock", ns::BLOCKING).append(item).build();
            self.conn.request(Iq::set(unblock)).await?.into_result()?;
            return Ok(());
        }
        let bare = jid.to_bare();
        self.fallback_update(|rules| {
            rules.retain(|r| r.selector != PrivacySelector::Jid(bare.clone()));
        })
        .await
    }

    /// Fetch the set of blocked JIDs.
    pub async fn get_blocklist(&self) -> Result<Vec<Jid>> {
        if self.server_supports_blocking().await? {
            let payload = self
                .conn
                .request(Iq::get(Element::bare("blocklist", ns::BLOCKING)))
                .await?
                .into_result()?
                .ok_or_else(|| Error::protocol("blocklist result without payload"))?;
            return Ok(payload
                .children()
                .filter(|c| c.is("item", ns::BLOCKING))
                .filter_map(|c| c.attr("jid"))
                .filter_map(|j| j.parse().ok())
                .collect());
        }

        let im = self.im()?;
        let list = match im.get_privacy_list(FALLBACK_LIST).await {
            Ok(list) => list,
            Err(Error::Stanza { condition, .. })
                if condition == crate::error::StanzaErrorCondition::ItemNotFound =>
            {
                return Ok(Vec::new())
            }
            Err(error) => return Err(error),
        };
        Ok(list
            .rules
            .iter()
            .filter_map(|r| match &r.selector {
                PrivacySelector::Jid(jid) if r.action == PrivacyAction::Deny => {
                    Some(jid.clone())
                }
                _ => None,
            })
            .collect())
    }

    fn im(&self) -> Result<Arc<Im>> {
        self.im
            .upgrade()
            .ok_or_else(|| Error::invalid_argument("session gone"))
    }

    async fn fallback_update(
        &self,
        mutate: impl FnOnce(&mut Vec<PrivacyRule>),
    ) -> Result<()> {
        let im = self.im()?;
        info!("blocking command unavailable; using privacy-list fallback");

        let mut rules = match im.get_privacy_list(FALLBACK_LIST).await {
            Ok(list) => list.rules,
            Err(Error::Stanza { condition, .. })
                if condition == crate::error::StanzaErrorCondition::ItemNotFound =>
            {
                Vec::new()
            }
            Err(error) => return Err(error),
        };
        mutate(&mut rules);

        let list = PrivacyList::new(FALLBACK_LIST, rules)?;
        im.set_privacy_list(&list).await?;
        im.set_active_privacy_list(Some(FALLBACK_LIST)).await?;
        im.set_default_privacy_list(Some(FALLBACK_LIST)).await
    }
}

impl Extension for Blocking {
    fn tag(&self) -> &'static str {
        "Blocking"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::BLOCKING.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, _im: &Im) -> bool {
        // Acknowledge server pushes of block/unblock changes.
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        let Some(payload) = iq.request_payload() else {
            return false;
        };
        let is_push = matches!(iq.payload, IqPayload::Set(_))
            && (payload.is("block", ns::BLOCKING) || payload.is("unblock", ns::BLOCKING));
        if !is_push {
            return false;
        }
        self.conn
            .send_stanza_background(Stanza::Iq(Iq::result_for(iq, None)));
        true
    }
}

impl ExtensionBuild for Blocking {
    const TAG: &'static str = "Blocking";

    fn dependencies() -> &'static [&'static str] {
        &["ServiceDiscovery"]
    }

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        let disco = im.load_extension::<ServiceDiscovery>()?;
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
            disco,
            im: Arc::downgrade(im),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConfig;

    #[tokio::test]
    async fn block_push_is_acknowledged_and_consumed() {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let blocking = im.load_extension::<Blocking>().unwrap();

        let xml = "<iq xmlns='jabber:client' type='set' id='push1'>\
                   <block xmlns='urn:xmpp:blocking'>\
                   <item jid='spammer@evil'/></block></iq>";
        let iq = Iq::from_element(&xml.parse().unwrap()).unwrap();
        assert!(blocking.filter_input(&mut Stanza::Iq(iq), &im));
    }

    #[tokio::test]
    async fn blocklist_queries_pass_other_iqs() {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let blocking = im.load_extension::<Blocking>().unwrap();

        let xml = "<iq xmlns='jabber:client' type='get' id='x'>\
                   <ping xmlns='urn:xmpp:ping'/></iq>";
        let iq = Iq::from_element(&xml.parse().unwrap()).unwrap();
        assert!(!blocking.filter_input(&mut Stanza::Iq(iq), &im));
    }
}
