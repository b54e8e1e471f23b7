//! Attention (XEP-0224).

use std::sync::Arc;

use minidom::Element;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Message, MessageKind, Stanza};

/// The attention ("buzz") extension.
///
/// Inbound attention messages are left to the normal message events;
/// callers check [`Message::payload`] for the attention element.
pub struct Attention {
    conn: Connection,
}

impl Attention {
    /// Demand the peer's attention, optionally with a line of text.
    pub async fn buzz(&self, to: &Jid, text: Option<&str>) -> Result<()> {
        if !to.is_full() {
            return Err(Error::invalid_argument("attention targets a full JID"));
        }
        let mut message = Message::new(MessageKind::Headline)
            .with_to(to.clone())
            .with_payload(Element::bare("attention", ns::ATTENTION));
        if let Some(text) = text {
            message.bodies.insert(String::new(), text.to_string());
        }
        self.conn.send_stanza(&Stanza::Message(message)).await
    }
}

impl Extension for Attention {
    fn tag(&self) -> &'static str {
        "Attention"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::ATTENTION.to_string()]
    }
}

impl ExtensionBuild for Attention {
    const TAG: &'static str = "Attention";

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
    async fn buzz_requires_a_full_jid() {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let attention = im.load_extension::<Attention>().unwrap();

        let bare: Jid = "bob@test".parse().unwrap();
        assert!(matches!(
            attention.buzz(&bare, None).await,
            Err(Error::InvalidArgument(_))
        ));
    }
}
