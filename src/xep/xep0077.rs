//! In-Band Registration (XEP-0077).

use std::collections::BTreeMap;
use std::sync::Arc;

use minidom::Element;

use crate::connection::Connection;
use crate::dataform::DataForm;
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::Iq;

/// What a service wants filled in to register.
#[derive(Debug, Clone, Default)]
pub struct RegistrationFields {
    /// Human-readable instructions.
    pub instructions: Option<String>,
    /// Legacy field names the service asks for ("username", ...).
    pub fields: Vec<String>,
    /// Extended registration form, when the service uses one.
    pub form: Option<DataForm>,
    /// Whether the account is already registered.
    pub registered: bool,
}

/// Values submitted for registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationSubmission {
    /// Legacy field values keyed by field name.
    pub fields: BTreeMap<String, String>,
    /// Completed form, when the request carried one.
    pub form: Option<DataForm>,
}

/// The registration extension.
pub struct Registration {
    conn: Connection,
}

impl Registration {
    /// Ask a service which fields registration needs.
    pub async fn request_registration(&self, to: Option<&Jid>) -> Result<RegistrationFields> {
        let mut iq = Iq::get(Element::bare("query", ns::REGISTER));
        if let Some(to) = to {
            iq = iq.with_to(to.clone());
        }
        let payload = self
            .conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("register result without payload"))?;

        let mut fields = RegistrationFields::default();
        for child in payload.children() {
            if child.is("x", ns::DATA_FORMS) {
                fields.form = DataForm::from_element(child).ok();
            } else if child.is("instructions", ns::REGISTER) {
                fields.instructions = Some(child.text());
            } else if child.is("registered", ns::REGISTER) {
                fields.registered = true;
            } else if child.ns() == ns::REGISTER {
                fields.fields.push(child.name().to_string());
            }
        }
        Ok(fields)
    }

    /// Submit registration values.
    pub async fn send_registration(
        &self,
        to: Option<&Jid>,
        submission: RegistrationSubmission,
    ) -> Result<()> {
        let mut query = Element::builder("query", ns::REGISTER).build();
        for (name, value) in &submission.fields {
            query.append_child(
                Element::builder(name.as_str(), ns::REGISTER)
                    .append(value.as_str())
                    .build(),
            );
        }
        if let Some(form) = submission.form {
            query.append_child(form.to_element());
        }

        let mut iq = Iq::set(query);
        if let Some(to) = to {
            iq = iq.with_to(to.clone());
        }
        self.conn.request(iq).await?.into_result()?;
        Ok(())
    }

    /// Cancel an existing registration.
    pub async fn unregister(&self, to: Option<&Jid>) -> Result<()> {
        let query = Element::builder("query", ns::REGISTER)
            .append(Element::bare("remove", ns::REGISTER))
            .build();
        let mut iq = Iq::set(query);
        if let Some(to) = to {
            iq = iq.with_to(to.clone());
        }
        self.conn.request(iq).await?.into_result()?;
        Ok(())
    }
}

impl Extension for Registration {
    fn tag(&self) -> &'static str {
        "Registration"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::REGISTER.to_string()]
    }
}

impl ExtensionBuild for Registration {
    const TAG: &'static str = "Registration";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
        }))
    }
}
