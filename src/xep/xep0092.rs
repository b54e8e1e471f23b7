//! Software Version (XEP-0092).

use std::sync::{Arc, Mutex};

use minidom::Element;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqPayload, Stanza};

/// A peer's announced software identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareVersion {
    /// Software name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Operating system, when disclosed.
    pub os: Option<String>,
}

/// The software-version extension.
pub struct Version {
    conn: Connection,
    own: Mutex<SoftwareVersion>,
}

impl Version {
    /// Override what we answer version queries with. OS disclosure is
    /// opt-in.
    pub fn set_own_version(&self, version: SoftwareVersion) {
        *self.own.lock().unwrap() = version;
    }

    /// Ask a peer what software it runs.
    pub async fn get_version(&self, to: &Jid) -> Result<SoftwareVersion> {
        let iq = Iq::get(Element::bare("query", ns::VERSION)).with_to(to.clone());
        let payload = self
            .conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("version result without payload"))?;

        Ok(SoftwareVersion {
            name: payload
                .get_child("name", ns::VERSION)
                .map(|n| n.text())
                .unwrap_or_default(),
            version: payload
                .get_child("version", ns::VERSION)
                .map(|v| v.text())
                .unwrap_or_default(),
            os: payload.get_child("os", ns::VERSION).map(|o| o.text()),
        })
    }
}

impl Extension for Version {
    fn tag(&self) -> &'static str {
        "Version"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::VERSION.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, _im: &Im) -> bool {
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        let is_version = matches!(
            iq.payload,
            IqPayload::Get(ref p) if p.is("query", ns::VERSION)
        );
        if !is_version {
            return false;
        }

        let own = self.own.lock().unwrap().clone();
        let mut query = Element::builder("query", ns::VERSION).build();
        query.append_child(
            Element::builder("name", ns::VERSION)
                .append(own.name.as_str())
                .build(),
        );
        query.append_child(
            Element::builder("version", ns::VERSION)
                .append(own.version.as_str())
                .build(),
        );
        if let Some(os) = &own.os {
            query.append_child(
                Element::builder("os", ns::VERSION).append(os.as_str()).build(),
            );
        }
        self.conn
            .send_stanza_background(Stanza::Iq(Iq::result_for(iq, Some(query))));
        true
    }
}

impl ExtensionBuild for Version {
    const TAG: &'static str = "Version";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
            own: Mutex::new(SoftwareVersion {
                name: "rookery".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                os: None,
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConfig;

    #[tokio::test]
    async fn version_query_is_answered_and_consumed() {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let version = im.load_extension::<Version>().unwrap();

        let xml = "<iq xmlns='jabber:client' type='get' id='v1' from='bob@test/x'>\
                   <query xmlns='jabber:iq:version'/></iq>";
        let iq = Iq::from_element(&xml.parse().unwrap()).unwrap();
        assert!(version.filter_input(&mut Stanza::Iq(iq), &im));
    }
}
