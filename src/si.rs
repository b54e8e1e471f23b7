//! Stream initiation (XEP-0095) with feature negotiation (XEP-0020).
//!
//! SI negotiates a profile (here: file transfer) and a byte-stream
//! method before any payload bytes move. The offer carries the proposed
//! methods in a feature-negotiation data form; the answer selects one.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use minidom::Element;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::dataform::{DataForm, Field, FormType};
use crate::error::{Error, Result, StanzaError, StanzaErrorCondition, StanzaErrorType};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqPayload, Stanza};

/// File metadata carried in an SI offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Optional description.
    pub description: Option<String>,
}

/// A parsed stream-initiation offer.
#[derive(Debug, Clone)]
pub struct SiOffer {
    /// Session id proposed by the initiator.
    pub sid: String,
    /// MIME type hint.
    pub mime_type: Option<String>,
    /// Profile namespace.
    pub profile: String,
    /// File metadata (file-transfer profile).
    pub file: FileOffer,
    /// Byte-stream method namespaces on offer, initiator order.
    pub methods: Vec<String>,
}

impl SiOffer {
    /// Parse from an `<si/>` payload.
    pub fn parse(payload: &Element) -> Result<Self> {
        if !payload.is("si", ns::SI) {
            return Err(Error::parse("not an si element"));
        }
        let sid = payload
            .attr("id")
            .ok_or_else(|| Error::parse("si without id"))?
            .to_string();
        let profile = payload
            .attr("profile")
            .ok_or_else(|| Error::parse("si without profile"))?
            .to_string();

        let file_elem = payload
            .get_child("file", ns::SI_FILE_TRANSFER)
            .ok_or_else(|| Error::parse("si without file metadata"))?;
        let file = FileOffer {
            name: file_elem
                .attr("name")
                .ok_or_else(|| Error::parse("file without name"))?
                .to_string(),
            size: file_elem
                .attr("size")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::parse("file without size"))?,
            description: file_elem
                .get_child("desc", ns::SI_FILE_TRANSFER)
                .map(|d| d.text())
                .filter(|d| !d.is_empty()),
        };

        let form = payload
            .get_child("feature", ns::FEATURE_NEG)
            .and_then(|f| f.get_child("x", ns::DATA_FORMS))
            .ok_or_else(|| Error::parse("si without feature negotiation"))?;
        let form = DataForm::from_element(form)?;
        let methods = form
            .field("stream-method")
            .map(|f| {
                if f.options.is_empty() {
                    f.values.clone()
                } else {
                    f.options.clone()
                }
            })
            .unwrap_or_default();

        Ok(Self {
            sid,
            mime_type: payload.attr("mime-type").map(str::to_string),
            profile,
            file,
            methods,
        })
    }

    /// Serialize the offer to an `<si/>` payload.
    pub fn to_element(&self) -> Element {
        let mut si = Element::builder("si", ns::SI)
            .attr("id", self.sid.clone())
            .attr("profile", self.profile.clone())
            .build();
        if let Some(mime) = &self.mime_type {
            si.set_attr("mime-type", mime.clone());
        }

        let mut file = Element::builder("file", ns::SI_FILE_TRANSFER)
            .attr("name", self.file.name.clone())
            .attr("size", self.file.size.to_string())
            .build();
        if let Some(description) = &self.file.description {
            file.append_child(
                Element::builder("desc", ns::SI_FILE_TRANSFER)
                    .append(description.as_str())
                    .build(),
            );
        }
        si.append_child(file);

        let form = DataForm::new(FormType::Form)
            .with_field(Field::list_single("stream-method", self.methods.clone()));
        si.append_child(
            Element::builder("feature", ns::FEATURE_NEG)
                .append(form.to_element())
                .build(),
        );
        si
    }

    /// Build the accepting answer that selects one method.
    pub fn accept_element(chosen_method: &str) -> Element {
        let form = DataForm::new(FormType::Submit)
            .with_field(Field::with_value("stream-method", chosen_method));
        Element::builder("si", ns::SI)
            .append(
                Element::builder("feature", ns::FEATURE_NEG)
                    .append(form.to_element())
                    .build(),
            )
            .build()
    }

    /// Extract the selected method from an accepting answer.
    pub fn chosen_method(payload: &Element) -> Result<String> {
        let form = payload
            .get_child("feature", ns::FEATURE_NEG)
            .and_then(|f| f.get_child("x", ns::DATA_FORMS))
            .ok_or_else(|| Error::protocol("si answer without feature negotiation"))?;
        let form = DataForm::from_element(form)?;
        form.value("stream-method")
            .map(str::to_string)
            .ok_or_else(|| Error::protocol("si answer without stream-method"))
    }
}

/// A profile implementation answering inbound SI offers.
#[async_trait]
pub trait SiProfileHandler: Send + Sync + 'static {
    /// Decide on an offer; the returned element becomes the IQ result
    /// payload. Errors map to stanza errors (`Conflict`,
    /// `NotAcceptable`) on the wire.
    async fn handle_offer(&self, from: Option<&Jid>, offer: SiOffer) -> Result<Element>;
}

/// The stream-initiation extension.
pub struct StreamInitiation {
    conn: Connection,
    profiles: DashMap<String, Arc<dyn SiProfileHandler>>,
}

impl StreamInitiation {
    /// Register the handler for a profile namespace.
    pub fn register_profile(&self, profile: impl Into<String>, handler: Arc<dyn SiProfileHandler>) {
        self.profiles.insert(profile.into(), handler);
    }

    /// Send an offer and return the method the peer selected.
    pub async fn offer(&self, to: &Jid, offer: &SiOffer) -> Result<String> {
        let iq = Iq::get(offer.to_element()).with_to(to.clone());
        let response = self.conn.request(iq).await?;
        let payload = response
            .into_result()?
            .ok_or_else(|| Error::protocol("si answer without payload"))?;
        let chosen = SiOffer::chosen_method(&payload)?;
        if !offer.methods.iter().any(|m| *m == chosen) {
            return Err(Error::protocol(format!(
                "peer selected unoffered method {chosen}"
            )));
        }
        Ok(chosen)
    }

    fn answer_offer(&self, iq: &Iq) {
        let Some(payload) = iq.request_payload() else {
            return;
        };
        let request = iq.clone();
        let offer = match SiOffer::parse(payload) {
            Ok(offer) => offer,
            Err(error) => {
                debug!(error = %error, "malformed si offer");
                let reply = Iq::error_for(
                    &request,
                    StanzaError::new(StanzaErrorType::Modify, StanzaErrorCondition::BadRequest),
                );
                self.conn.send_stanza_background(Stanza::Iq(reply));
                return;
            }
        };

        let Some(handler) = self
            .profiles
            .get(&offer.profile)
            .map(|h| Arc::clone(h.value()))
        else {
            debug!(profile = %offer.profile, "si offer for unknown profile");
            let reply = Iq::error_for(
                &request,
                StanzaError::new(
                    StanzaErrorType::Cancel,
                    StanzaErrorCondition::ServiceUnavailable,
                ),
            );
            self.conn.send_stanza_background(Stanza::Iq(reply));
            return;
        };

        let conn = self.conn.clone();
        tokio::spawn(async move {
            let reply = match handler.handle_offer(request.from.as_ref(), offer).await {
                Ok(result) => Iq::result_for(&request, Some(result)),
                Err(error) => Iq::error_for(&request, stanza_error_for(&error)),
            };
            if let Err(error) = conn.send_stanza(&Stanza::Iq(reply)).await {
                warn!(error = %error, "failed to answer si offer");
            }
        });
    }
}

fn stanza_error_for(error: &Error) -> StanzaError {
    match error {
        Error::Conflict(_) => {
            StanzaError::new(StanzaErrorType::Cancel, StanzaErrorCondition::Conflict)
        }
        Error::NotAcceptable(_) => StanzaError::new(
            StanzaErrorType::Modify,
            StanzaErrorCondition::NotAcceptable,
        ),
        _ => StanzaError::new(
            StanzaErrorType::Cancel,
            StanzaErrorCondition::InternalServerError,
        ),
    }
}

impl Extension for StreamInitiation {
    fn tag(&self) -> &'static str {
        "StreamInitiation"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![
            ns::SI.to_string(),
            ns::SI_FILE_TRANSFER.to_string(),
            ns::FEATURE_NEG.to_string(),
        ]
    }

    fn filter_input(&self, stanza: &mut Stanza, _im: &Im) -> bool {
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        let is_si = matches!(
            iq.payload,
            IqPayload::Get(ref p) | IqPayload::Set(ref p) if p.is("si", ns::SI)
        );
        if !is_si {
            return false;
        }
        self.answer_offer(iq);
        true
    }

    fn detached(&self) {
        // Profile handlers hold back-references to this extension's
        // dependents; dropping them breaks the cycle at teardown.
        self.profiles.clear();
    }
}

impl ExtensionBuild for StreamInitiation {
    const TAG: &'static str = "StreamInitiation";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
            profiles: DashMap::new(),
        }))
    }
}
