//! HTTP File Upload slot requests (XEP-0363).
//!
//! Only the slot negotiation lives here; the HTTP PUT itself is the
//! caller's business.

use std::sync::Arc;

use minidom::Element;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::Iq;

/// A granted upload slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSlot {
    /// Where to PUT the bytes.
    pub put_url: String,
    /// Headers the PUT must carry.
    pub put_headers: Vec<(String, String)>,
    /// Where the file will be fetchable.
    pub get_url: String,
}

/// The upload-slot extension.
pub struct HttpUpload {
    conn: Connection,
}

impl HttpUpload {
    /// Request a slot from an upload service.
    pub async fn request_slot(
        &self,
        service: &Jid,
        filename: &str,
        size: u64,
        content_type: Option<&str>,
    ) -> Result<UploadSlot> {
        let mut request = Element::builder("request", ns::HTTP_UPLOAD)
            .attr("filename", filename)
            .attr("size", size.to_string())
            .build();
        if let Some(content_type) = content_type {
            request.set_attr("content-type", content_type);
        }

        let iq = Iq::get(request).with_to(service.clone());
        let payload = self
            .conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("slot result without payload"))?;

        let put = payload
            .get_child("put", ns::HTTP_UPLOAD)
            .ok_or_else(|| Error::protocol("slot without put url"))?;
        let get = payload
            .get_child("get", ns::HTTP_UPLOAD)
            .ok_or_else(|| Error::protocol("slot without get url"))?;

        let put_url = put
            .attr("url")
            .ok_or_else(|| Error::protocol("put without url attribute"))?
            .to_string();
        let get_url = get
            .attr("url")
            .ok_or_else(|| Error::protocol("get without url attribute"))?
            .to_string();
        let put_headers = put
            .children()
            .filter(|c| c.is("header", ns::HTTP_UPLOAD))
            .filter_map(|h| h.attr("name").map(|n| (n.to_string(), h.text())))
            .collect();

        Ok(UploadSlot {
            put_url,
            put_headers,
            get_url,
        })
    }
}

impl Extension for HttpUpload {
    fn tag(&self) -> &'static str {
        "HttpUpload"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::HTTP_UPLOAD.to_string()]
    }
}

impl ExtensionBuild for HttpUpload {
    const TAG: &'static str = "HttpUpload";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_payload_parses_urls_and_headers() {
        let xml = "<slot xmlns='urn:xmpp:http:upload:0'>\
                   <put url='https://upload.test/abc'>\
                   <header name='Authorization'>Basic xyz</header></put>\
                   <get url='https://files.test/abc'/></slot>";
        let slot: Element = xml.parse().unwrap();

        let put = slot.get_child("put", ns::HTTP_UPLOAD).unwrap();
        assert_eq!(put.attr("url"), Some("https://upload.test/abc"));
        let header = put.get_child("header", ns::HTTP_UPLOAD).unwrap();
        assert_eq!(header.attr("name"), Some("Authorization"));
        assert_eq!(header.text(), "Basic xyz");
    }
}
