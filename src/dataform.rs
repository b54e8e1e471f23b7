//! Data forms (XEP-0004).
//!
//! Forms are the structured key/value container embedded in MUC
//! configuration, stream-initiation feature negotiation, MAM filters and
//! search queries.

use minidom::Element;

use crate::error::{Error, Result};
use crate::ns;

/// Form type attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormType {
    /// An empty form asking to be filled out.
    Form,
    /// A filled-out submission.
    Submit,
    /// Submission cancelled.
    Cancel,
    /// Query result rows.
    FormResult,
}

impl FormType {
    fn as_attr(&self) -> &'static str {
        match self {
            Self::Form => "form",
            Self::Submit => "submit",
            Self::Cancel => "cancel",
            Self::FormResult => "result",
        }
    }

    fn from_attr(value: &str) -> Result<Self> {
        Ok(match value {
            "form" => Self::Form,
            "submit" => Self::Submit,
            "cancel" => Self::Cancel,
            "result" => Self::FormResult,
            other => return Err(Error::parse(format!("unknown form type '{other}'"))),
        })
    }
}

/// One form field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Field {
    /// Field name.
    pub var: String,
    /// Field type attribute as announced ("list-single", "boolean", ...).
    pub field_type: Option<String>,
    /// Human-readable label.
    pub label: Option<String>,
    /// Submitted or default values.
    pub values: Vec<String>,
    /// Offered option values for list fields.
    pub options: Vec<String>,
}

impl Field {
    /// A field with a single value.
    pub fn with_value(var: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            values: vec![value.into()],
            ..Self::default()
        }
    }

    /// A list field offering the given options.
    pub fn list_single(var: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            var: var.into(),
            field_type: Some("list-single".to_string()),
            options,
            ..Self::default()
        }
    }

    /// The first value, if any.
    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }
}

/// A data form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataForm {
    /// Form type.
    pub form_type: FormType,
    /// Optional title.
    pub title: Option<String>,
    /// Optional instructions.
    pub instructions: Option<String>,
    /// Fields in wire order.
    pub fields: Vec<Field>,
}

impl DataForm {
    /// An empty form of the given type.
    pub fn new(form_type: FormType) -> Self {
        Self {
            form_type,
            title: None,
            instructions: None,
            fields: Vec::new(),
        }
    }

    /// A submission carrying the given `FORM_TYPE` hidden field.
    pub fn submission(namespace: &str) -> Self {
        let mut form = Self::new(FormType::Submit);
        form.fields.push(Field {
            var: "FORM_TYPE".to_string(),
            field_type: Some("hidden".to_string()),
            values: vec![namespace.to_string()],
            ..Field::default()
        });
        form
    }

    /// Append a field.
    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Look up a field by name.
    pub fn field(&self, var: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.var == var)
    }

    /// Look up a field's first value.
    pub fn value(&self, var: &str) -> Option<&str> {
        self.field(var).and_then(Field::value)
    }

    /// The declared `FORM_TYPE`, if present.
    pub fn declared_type(&self) -> Option<&str> {
        self.value("FORM_TYPE")
    }

    /// Set a field's value, replacing any previous values for the var.
    pub fn set_value(&mut self, var: &str, value: impl Into<String>) {
        match self.fields.iter_mut().find(|f| f.var == var) {
            Some(field) => field.values = vec![value.into()],
            None => self.fields.push(Field::with_value(var, value)),
        }
    }

    /// Turn a received `form` into a `submit` keeping current values.
    pub fn into_submission(mut self) -> Self {
        self.form_type = FormType::Submit;
        self.title = None;
        self.instructions = None;
        for field in &mut self.fields {
            field.label = None;
            field.options.clear();
        }
        self
    }

    /// Parse from an `<x xmlns='jabber:x:data'/>` element.
    pub fn from_element(element: &Element) -> Result<Self> {
        if !element.is("x", ns::DATA_FORMS) {
            return Err(Error::parse("not a data form element"));
        }
        let form_type = FormType::from_attr(
            element
                .attr("type")
                .ok_or_else(|| Error::parse("data form without type"))?,
        )?;

        let mut form = Self::new(form_type);
        for child in element.children() {
            match child.name() {
                "title" => form.title = Some(child.text()),
                "instructions" => form.instructions = Some(child.text()),
                "field" => {
                    let mut field = Field {
                        var: child.attr("var").unwrap_or("").to_string(),
                        field_type: child.attr("type").map(str::to_string),
                        label: child.attr("label").map(str::to_string),
                        ..Field::default()
                    };
                    for grand in child.children() {
                        match grand.name() {
                            "value" => field.values.push(grand.text()),
                            "option" => {
                                if let Some(value) =
                                    grand.get_child("value", ns::DATA_FORMS)
                                {
                                    field.options.push(value.text());
                                }
                            }
                            _ => {}
                        }
                    }
                    form.fields.push(field);
                }
                _ => {}
            }
        }
        Ok(form)
    }

    /// Serialize to an `<x xmlns='jabber:x:data'/>` element.
    pub fn to_element(&self) -> Element {
        let mut form = Element::builder("x", ns::DATA_FORMS)
            .attr("type", self.form_type.as_attr())
            .build();
        if let Some(title) = &self.title {
            form.append_child(
                Element::builder("title", ns::DATA_FORMS)
                    .append(title.as_str())
                    .build(),
            );
        }
        if let Some(instructions) = &self.instructions {
            form.append_child(
                Element::builder("instructions", ns::DATA_FORMS)
                    .append(instructions.as_str())
                    .build(),
            );
        }
        for field in &self.fields {
            let mut field_elem = Element::builder("field", ns::DATA_FORMS).build();
            if !field.var.is_empty() {
                field_elem.set_attr("var", field.var.clone());
            }
            if let Some(field_type) = &field.field_type {
                field_elem.set_attr("type", field_type.clone());
            }
            if let Some(label) = &field.label {
                field_elem.set_attr("label", label.clone());
            }
            for value in &field.values {
                field_elem.append_child(
                    Element::builder("value", ns::DATA_FORMS)
                        .append(value.as_str())
                        .build(),
                );
            }
            for option in &field.options {
                field_elem.append_child(
                    Element::builder("option", ns::DATA_FORMS)
                        .append(
                            Element::builder("value", ns::DATA_FORMS)
                                .append(option.as_str())
                                .build(),
                        )
                        .build(),
                );
            }
            form.append_child(field_elem);
        }
        form
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_round_trips() {
        let form = DataForm::submission(ns::MAM)
            .with_field(Field::with_value("with", "bob@test"))
            .with_field(Field::with_value("start", "2025-01-01T00:00:00Z"));
        let elem = form.to_element();

        let parsed = DataForm::from_element(&elem).unwrap();
        assert_eq!(parsed.form_type, FormType::Submit);
        assert_eq!(parsed.declared_type(), Some(ns::MAM));
        assert_eq!(parsed.value("with"), Some("bob@test"));
    }

    #[test]
    fn list_options_survive() {
        let form = DataForm::new(FormType::Form).with_field(Field::list_single(
            "stream-method",
            vec![ns::BYTESTREAMS.to_string(), ns::IBB.to_string()],
        ));
        let parsed = DataForm::from_element(&form.to_element()).unwrap();
        let field = parsed.field("stream-method").unwrap();
        assert_eq!(field.options.len(), 2);
        assert!(field.options.iter().any(|o| o == ns::IBB));
    }

    #[test]
    fn form_to_submission_strips_presentation() {
        let mut form = DataForm::new(FormType::Form);
        form.title = Some("Room config".into());
        form.fields.push(Field {
            var: "muc#roomconfig_roomname".into(),
            label: Some("Name".into()),
            values: vec!["old".into()],
            ..Field::default()
        });

        let mut submission = form.into_submission();
        submission.set_value("muc#roomconfig_roomname", "new");
        assert_eq!(submission.form_type, FormType::Submit);
        assert!(submission.title.is_none());
        assert_eq!(submission.value("muc#roomconfig_roomname"), Some("new"));
    }

    #[test]
    fn set_value_inserts_missing_fields() {
        let mut form = DataForm::new(FormType::Submit);
        form.set_value("max", "10");
        assert_eq!(form.value("max"), Some("10"));
        form.set_value("max", "20");
        assert_eq!(form.value("max"), Some("20"));
        assert_eq!(form.fields.len(), 1);
    }
}
