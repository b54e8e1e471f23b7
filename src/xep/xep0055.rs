//! Jabber Search (XEP-0055).
//!
//! One service-discovery-driven implementation: the search service is
//! whatever JID the caller discovered; the request form is extended
//! (data form) when the service offers one, legacy fields otherwise.

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

/// What a search service wants filled in.
#[derive(Debug, Clone, Default)]
pub struct SearchFields {
    /// Human-readable instructions.
    pub instructions: Option<String>,
    /// Legacy field names ("first", "last", "nick", "email").
    pub fields: Vec<String>,
    /// Extended search form, when offered.
    pub form: Option<DataForm>,
}

/// One row of a search result.
#[derive(Debug, Clone, Default)]
pub struct SearchRow {
    /// The matched JID.
    pub jid: Option<Jid>,
    /// Remaining columns keyed by field name.
    pub columns: BTreeMap<String, String>,
}

/// The search extension.
pub struct Search {
    conn: Connection,
}

impl Search {
    /// Fetch the search request form from a service.
    pub async fn request_search_form(&self, service: &Jid) -> Result<SearchFields> {
        let iq = Iq::get(Element::bare("query", ns::SEARCH)).with_to(service.clone());
        let payload = self
            .conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("search form result without payload"))?;

        let mut fields = SearchFields::default();
        for child in payload.children() {
            if child.is("x", ns::DATA_FORMS) {
                fields.form = DataForm::from_element(child).ok();
            } else if child.is("instructions", ns::SEARCH) {
                fields.instructions = Some(child.text());
            } else if child.ns() == ns::SEARCH {
                fields.fields.push(child.name().to_string());
            }
        }
        Ok(fields)
    }

    /// Run a search with legacy field values.
    pub async fn search(
        &self,
        service: &Jid,
        values: BTreeMap<String, String>,
    ) -> Result<Vec<SearchRow>> {
        let mut query = Element::builder("query", ns::SEARCH).build();
        for (name, value) in &values {
            query.append_child(
                Element::builder(name.as_str(), ns::SEARCH)
                    .append(value.as_str())
                    .build(),
            );
        }
        self.run(service, query).await
    }

    /// Run a search with a completed extended form.
    pub async fn search_with_form(&self, service: &Jid, form: DataForm) -> Result<Vec<SearchRow>> {
        let query = Element::builder("query", ns::SEARCH)
            .append(form.to_element())
            .build();
        self.run(service, query).await
    }

    async fn run(&self, service: &Jid, query: Element) -> Result<Vec<SearchRow>> {
        let iq = Iq::set(query).with_to(service.clone());
        let payload = self
            .conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("search result without payload"))?;

        // Extended results come back as a result form with item rows.
        if let Some(form_elem) = payload.get_child("x", ns::DATA_FORMS) {
            return Ok(parse_form_rows(form_elem));
        }

        let mut rows = Vec::new();
        for item in payload.children().filter(|c| c.is("item", ns::SEARCH)) {
            let mut row = SearchRow {
                jid: item.attr("jid").and_then(|j| j.parse().ok()),
                columns: BTreeMap::new(),
            };
            for column in item.children() {
                row.columns.insert(column.name().to_string(), column.text());
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

fn parse_form_rows(form: &Element) -> Vec<SearchRow> {
    let mut rows = Vec::new();
    for item in form.children().filter(|c| c.name() == "item") {
        let mut row = SearchRow::default();
        for field in item.children().filter(|c| c.name() == "field") {
            let var = field.attr("var").unwrap_or("").to_string();
            let value = field
                .children()
                .find(|c| c.name() == "value")
                .map(|v| v.text())
                .unwrap_or_default();
            if var == "jid" {
                row.jid = value.parse().ok();
            }
            row.columns.insert(var, value);
        }
        rows.push(row);
    }
    rows
}

impl Extension for Search {
    fn tag(&self) -> &'static str {
        "Search"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::SEARCH.to_string()]
    }
}

impl ExtensionBuild for Search {
    const TAG: &'static str = "Search";

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
    fn parses_form_result_rows() {
        let xml = "<x xmlns='jabber:x:data' type='result'>\
                   <item><field var='jid'><value>juliet@capulet.lit</value></field>\
                   <field var='first'><value>Juliet</value></field></item>\
                   </x>";
        let rows = parse_form_rows(&xml.parse().unwrap());
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].jid.as_ref().unwrap().to_string(),
            "juliet@capulet.lit"
        );
        assert_eq!(rows[0].columns.get("first").map(String::as_str), Some("Juliet"));
    }
}
