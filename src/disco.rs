//! Service discovery (XEP-0030) and entity capabilities (XEP-0115).
//!
//! Discovery answers "what can this JID do" over the network; entity
//! caps short-circuits the question with a session-local cache keyed by
//! the capability hash announced in presence, so two JIDs advertising
//! the same hash share one cached feature set.

use std::sync::{Arc, Weak};

use base64::prelude::*;
use dashmap::DashMap;
use minidom::Element;
use sha1::{Digest, Sha1};

use crate::connection::Connection;
use crate::dataform::DataForm;
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqPayload, PresenceKind, Stanza};

/// One identity record of a disco#info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Category ("client", "conference", "server", ...).
    pub category: String,
    /// Type within the category.
    pub type_: String,
    /// Human-readable name.
    pub name: Option<String>,
}

impl Identity {
    /// Build an identity record.
    pub fn new(category: &str, type_: &str, name: Option<&str>) -> Self {
        Self {
            category: category.to_string(),
            type_: type_.to_string(),
            name: name.map(str::to_string),
        }
    }
}

/// A parsed disco#info response.
#[derive(Debug, Clone, Default)]
pub struct DiscoInfo {
    /// Identity records.
    pub identities: Vec<Identity>,
    /// Advertised feature namespaces.
    pub features: Vec<String>,
    /// Extended info forms (room info and the like).
    pub forms: Vec<DataForm>,
}

impl DiscoInfo {
    /// Whether a feature namespace is advertised.
    pub fn has_feature(&self, namespace: &str) -> bool {
        self.features.iter().any(|f| f == namespace)
    }

    /// Parse from a disco#info `<query/>`.
    pub fn from_element(element: &Element) -> Result<Self> {
        let mut info = Self::default();
        for child in element.children() {
            if child.is("identity", ns::DISCO_INFO) {
                info.identities.push(Identity {
                    category: child.attr("category").unwrap_or("").to_string(),
                    type_: child.attr("type").unwrap_or("").to_string(),
                    name: child.attr("name").map(str::to_string),
                });
            } else if child.is("feature", ns::DISCO_INFO) {
                if let Some(var) = child.attr("var") {
                    info.features.push(var.to_string());
                }
            } else if child.is("x", ns::DATA_FORMS) {
                if let Ok(form) = DataForm::from_element(child) {
                    info.forms.push(form);
                }
            }
        }
        Ok(info)
    }

    /// Serialize to a disco#info `<query/>`.
    pub fn to_element(&self, node: Option<&str>) -> Element {
        let mut query = Element::builder("query", ns::DISCO_INFO).build();
        if let Some(node) = node {
            query.set_attr("node", node);
        }
        for identity in &self.identities {
            let mut elem = Element::builder("identity", ns::DISCO_INFO)
                .attr("category", identity.category.clone())
                .attr("type", identity.type_.clone())
                .build();
            if let Some(name) = &identity.name {
                elem.set_attr("name", name.clone());
            }
            query.append_child(elem);
        }
        for feature in &self.features {
            query.append_child(
                Element::builder("feature", ns::DISCO_INFO)
                    .attr("var", feature.clone())
                    .build(),
            );
        }
        for form in &self.forms {
            query.append_child(form.to_element());
        }
        query
    }

    /// XEP-0115 verification string hash (SHA-1, base64).
    pub fn caps_ver(&self) -> String {
        let mut s = String::new();

        let mut identities: Vec<&Identity> = self.identities.iter().collect();
        identities.sort_by(|a, b| {
            (&a.category, &a.type_, &a.name).cmp(&(&b.category, &b.type_, &b.name))
        });
        for identity in identities {
            s.push_str(&format!(
                "{}/{}//{}<",
                identity.category,
                identity.type_,
                identity.name.as_deref().unwrap_or("")
            ));
        }

        let mut features: Vec<&String> = self.features.iter().collect();
        features.sort();
        features.dedup();
        for feature in features {
            s.push_str(feature);
            s.push('<');
        }

        let mut forms: Vec<&DataForm> = self
            .forms
            .iter()
            .filter(|f| f.declared_type().is_some())
            .collect();
        forms.sort_by(|a, b| a.declared_type().cmp(&b.declared_type()));
        for form in forms {
            s.push_str(form.declared_type().unwrap_or(""));
            s.push('<');
            let mut fields: Vec<_> = form
                .fields
                .iter()
                .filter(|f| f.var != "FORM_TYPE")
                .collect();
            fields.sort_by(|a, b| a.var.cmp(&b.var));
            for field in fields {
                s.push_str(&field.var);
                s.push('<');
                let mut values: Vec<&String> = field.values.iter().collect();
                values.sort();
                for value in values {
                    s.push_str(value);
                    s.push('<');
                }
            }
        }

        BASE64_STANDARD.encode(Sha1::digest(s.as_bytes()))
    }
}

/// One item of a disco#items response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoItem {
    /// The item's address.
    pub jid: Jid,
    /// Optional node.
    pub node: Option<String>,
    /// Optional name.
    pub name: Option<String>,
}

const CAPS_NODE: &str = "https://rookery.social/xmpp";

/// The discovery extension.
pub struct ServiceDiscovery {
    conn: Connection,
    im: Weak<Im>,
    /// ver hash -> shared feature set.
    caps_cache: DashMap<String, Arc<DiscoInfo>>,
    /// full JID -> announced ver hash.
    jid_caps: DashMap<Jid, String>,
}

impl ServiceDiscovery {
    /// Identities and features this client answers disco#info with.
    fn own_info(&self) -> DiscoInfo {
        let mut features = vec![
            ns::DISCO_INFO.to_string(),
            ns::DISCO_ITEMS.to_string(),
            ns::CAPS.to_string(),
        ];
        if let Some(im) = self.im.upgrade() {
            features.extend(im.advertised_namespaces());
        }
        features.sort();
        features.dedup();
        DiscoInfo {
            identities: vec![Identity::new("client", "pc", Some("rookery"))],
            features,
            forms: Vec::new(),
        }
    }

    /// Query a JID's identities and features.
    pub async fn info(&self, jid: &Jid, node: Option<&str>) -> Result<DiscoInfo> {
        let mut query = Element::builder("query", ns::DISCO_INFO).build();
        if let Some(node) = node {
            query.set_attr("node", node);
        }
        let iq = Iq::get(query).with_to(jid.clone());
        let payload = self
            .conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("disco#info result without query"))?;
        let info = DiscoInfo::from_element(&payload)?;

        // Share the result under the peer's announced hash, if any.
        if node.is_none() {
            if let Some(ver) = self.jid_caps.get(jid).map(|v| v.clone()) {
                self.caps_cache.insert(ver, Arc::new(info.clone()));
            }
        }
        Ok(info)
    }

    /// The feature namespaces a JID advertises.
    pub async fn get_features(&self, jid: &Jid) -> Result<Vec<String>> {
        Ok(self.info(jid, None).await?.features)
    }

    /// The identity records a JID advertises.
    pub async fn get_identities(&self, jid: &Jid) -> Result<Vec<Identity>> {
        Ok(self.info(jid, None).await?.identities)
    }

    /// Query a JID's child items.
    pub async fn items(&self, jid: &Jid) -> Result<Vec<DiscoItem>> {
        let iq = Iq::get(Element::bare("query", ns::DISCO_ITEMS)).with_to(jid.clone());
        let payload = self
            .conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("disco#items result without query"))?;

        let mut items = Vec::new();
        for child in payload.children().filter(|c| c.is("item", ns::DISCO_ITEMS)) {
            let Some(jid) = child.attr("jid").and_then(|j| j.parse().ok()) else {
                continue;
            };
            items.push(DiscoItem {
                jid,
                node: child.attr("node").map(str::to_string),
                name: child.attr("name").map(str::to_string),
            });
        }
        Ok(items)
    }

    /// Whether a peer supports a locally loaded extension, by hash
    /// cache first, then direct query.
    pub async fn supports(&self, jid: &Jid, extension_tag: &str) -> Result<bool> {
        let im = self
            .im
            .upgrade()
            .ok_or_else(|| Error::invalid_argument("session gone"))?;
        let namespaces: Vec<String> = im
            .registry()
            .snapshot()
            .iter()
            .find(|e| e.tag() == extension_tag)
            .map(|e| e.namespaces())
            .ok_or_else(|| {
                Error::invalid_argument(format!("extension {extension_tag} is not loaded"))
            })?;
        if namespaces.is_empty() {
            return Ok(false);
        }
        let info = self.cached_or_query(jid).await?;
        Ok(namespaces.iter().any(|n| info.has_feature(n)))
    }

    /// Whether a peer advertises a namespace.
    pub async fn supports_namespace(&self, jid: &Jid, namespace: &str) -> Result<bool> {
        let info = self.cached_or_query(jid).await?;
        Ok(info.has_feature(namespace))
    }

    async fn cached_or_query(&self, jid: &Jid) -> Result<Arc<DiscoInfo>> {
        if let Some(ver) = self.jid_caps.get(jid).map(|v| v.clone()) {
            if let Some(cached) = self.caps_cache.get(&ver) {
                return Ok(Arc::clone(cached.value()));
            }
        }
        self.info(jid, None).await.map(Arc::new)
    }

    /// The `<c/>` element to attach to outbound presence.
    fn caps_element(&self) -> Element {
        Element::builder("c", ns::CAPS)
            .attr("hash", "sha-1")
            .attr("node", CAPS_NODE)
            .attr("ver", self.own_info().caps_ver())
            .build()
    }
}

impl Extension for ServiceDiscovery {
    fn tag(&self) -> &'static str {
        "ServiceDiscovery"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![
            ns::DISCO_INFO.to_string(),
            ns::DISCO_ITEMS.to_string(),
            ns::CAPS.to_string(),
        ]
    }

    fn filter_input(&self, stanza: &mut Stanza, _im: &Im) -> bool {
        match stanza {
            // Answer disco#info queries about ourselves.
            Stanza::Iq(iq) => {
                let Some(payload) = iq.request_payload() else {
                    return false;
                };
                if !payload.is("query", ns::DISCO_INFO)
                    || !matches!(iq.payload, IqPayload::Get(_))
                {
                    return false;
                }
                let node = payload.attr("node").map(str::to_string);
                let response =
                    Iq::result_for(iq, Some(self.own_info().to_element(node.as_deref())));
                self.conn
                    .send_stanza_background(Stanza::Iq(response));
                true
            }
            // Record announced capability hashes; the presence still
            // flows on to the status events.
            Stanza::Presence(presence) => {
                if presence.kind == PresenceKind::Available {
                    if let (Some(from), Some(c)) =
                        (&presence.from, presence.payload("c", ns::CAPS))
                    {
                        if let Some(ver) = c.attr("ver") {
                            self.jid_caps.insert(from.clone(), ver.to_string());
                        }
                    }
                }
                false
            }
            Stanza::Message(_) => false,
        }
    }

    fn filter_output(&self, stanza: &mut Stanza) {
        // Advertise our capability hash on available broadcasts.
        if let Stanza::Presence(presence) = stanza {
            if presence.kind == PresenceKind::Available
                && presence.to.is_none()
                && presence.payload("c", ns::CAPS).is_none()
            {
                let caps = self.caps_element();
                presence.payloads.push(caps);
            }
        }
    }
}

impl ExtensionBuild for ServiceDiscovery {
    const TAG: &'static str = "ServiceDiscovery";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
            im: Arc::downgrade(im),
            caps_cache: DashMap::new(),
            jid_caps: DashMap::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identities_features_and_forms() {
        let xml = "<query xmlns='http://jabber.org/protocol/disco#info'>\
            <identity category='conference' type='text' name='general'/>\
            <feature var='http://jabber.org/protocol/muc'/>\
            <feature var='urn:xmpp:mam:2'/>\
            <x xmlns='jabber:x:data' type='result'>\
            <field var='FORM_TYPE' type='hidden'>\
            <value>http://jabber.org/protocol/muc#roominfo</value></field>\
            <field var='muc#roominfo_occupants'><value>4</value></field>\
            </x></query>";
        let info = DiscoInfo::from_element(&xml.parse().unwrap()).unwrap();

        assert_eq!(info.identities[0].category, "conference");
        assert!(info.has_feature(ns::MUC));
        assert!(info.has_feature(ns::MAM));
        assert_eq!(info.forms.len(), 1);
        assert_eq!(
            info.forms[0].value("muc#roominfo_occupants"),
            Some("4")
        );
    }

    /// XEP-0115 §5.2 simple generation example.
    #[test]
    fn caps_ver_matches_xep_vector() {
        let info = DiscoInfo {
            identities: vec![Identity::new("client", "pc", Some("Exodus 0.9.1"))],
            features: vec![
                ns::DISCO_INFO.to_string(),
                ns::DISCO_ITEMS.to_string(),
                ns::MUC.to_string(),
                ns::CAPS.to_string(),
            ],
            forms: Vec::new(),
        };
        assert_eq!(info.caps_ver(), "QgayPKawpkPSDYmwT/WM94uAlu0=");
    }

    #[test]
    fn caps_ver_is_order_independent() {
        let a = DiscoInfo {
            identities: vec![Identity::new("client", "pc", None)],
            features: vec![ns::MUC.to_string(), ns::DISCO_INFO.to_string()],
            forms: Vec::new(),
        };
        let b = DiscoInfo {
            identities: vec![Identity::new("client", "pc", None)],
            features: vec![ns::DISCO_INFO.to_string(), ns::MUC.to_string()],
            forms: Vec::new(),
        };
        assert_eq!(a.caps_ver(), b.caps_ver());
    }

    #[test]
    fn info_round_trips() {
        let info = DiscoInfo {
            identities: vec![Identity::new("client", "pc", Some("rookery"))],
            features: vec![ns::PING.to_string()],
            forms: Vec::new(),
        };
        let parsed = DiscoInfo::from_element(&info.to_element(None)).unwrap();
        assert_eq!(parsed.identities, info.identities);
        assert_eq!(parsed.features, info.features);
    }
}
