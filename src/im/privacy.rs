//! Privacy lists (XEP-0016).
//!
//! A list is a named, ordered rule sequence evaluated server-side: the
//! first matching rule decides. The session keeps at most one active
//! list; the account keeps at most one default list.

use minidom::Element;

use crate::connection::fresh_id;
use crate::error::{Error, Result};
use crate::im::roster::SubscriptionState;
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::Iq;

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyAction {
    /// Let the stanza through.
    Allow,
    /// Block the stanza.
    Deny,
}

impl PrivacyAction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    fn from_attr(value: &str) -> Result<Self> {
        match value {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(Error::parse(format!("unknown privacy action '{other}'"))),
        }
    }
}

/// What a rule matches on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PrivacySelector {
    /// Matches every stanza.
    #[default]
    Any,
    /// Matches a JID (per the XEP's JID matching ladder).
    Jid(Jid),
    /// Matches contacts in a roster group.
    Group(String),
    /// Matches contacts with a subscription state.
    Subscription(SubscriptionState),
}

/// Which stanza directions a rule covers; all when none are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrivacyGranularity {
    /// Inbound messages.
    pub message: bool,
    /// Inbound IQs.
    pub iq: bool,
    /// Inbound presence.
    pub presence_in: bool,
    /// Outbound presence.
    pub presence_out: bool,
}

impl PrivacyGranularity {
    /// Covers everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether no specific direction is set (= covers everything).
    pub fn is_all(&self) -> bool {
        !(self.message || self.iq || self.presence_in || self.presence_out)
    }
}

/// One rule in a privacy list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivacyRule {
    /// Evaluation position; unique within a list, ascending traversal.
    pub order: u32,
    /// Allow or deny.
    pub action: PrivacyAction,
    /// Match criterion.
    pub selector: PrivacySelector,
    /// Covered stanza directions.
    pub granularity: PrivacyGranularity,
}

impl PrivacyRule {
    /// A rule matching everything.
    pub fn new(order: u32, action: PrivacyAction) -> Self {
        Self {
            order,
            action,
            selector: PrivacySelector::Any,
            granularity: PrivacyGranularity::all(),
        }
    }

    /// Restrict to a selector.
    pub fn with_selector(mut self, selector: PrivacySelector) -> Self {
        self.selector = selector;
        self
    }

    fn from_element(element: &Element) -> Result<Self> {
        let order = element
            .attr("order")
            .and_then(|o| o.parse().ok())
            .ok_or_else(|| Error::parse("privacy item without order"))?;
        let action = PrivacyAction::from_attr(
            element
                .attr("action")
                .ok_or_else(|| Error::parse("privacy item without action"))?,
        )?;

        let selector = match element.attr("type") {
            None => PrivacySelector::Any,
            Some("jid") => PrivacySelector::Jid(
                element
                    .attr("value")
                    .ok_or_else(|| Error::parse("jid rule without value"))?
                    .parse()?,
            ),
            Some("group") => PrivacySelector::Group(
                element
                    .attr("value")
                    .ok_or_else(|| Error::parse("group rule without value"))?
                    .to_string(),
            ),
            Some("subscription") => {
                let value = element
                    .attr("value")
                    .ok_or_else(|| Error::parse("subscription rule without value"))?;
                let state = match value {
                    "none" => SubscriptionState::None,
                    "to" => SubscriptionState::To,
                    "from" => SubscriptionState::From,
                    "both" => SubscriptionState::Both,
                    other => {
                        return Err(Error::parse(format!(
                            "unknown subscription value '{other}'"
                        )))
                    }
                };
                PrivacySelector::Subscription(state)
            }
            Some(other) => {
                return Err(Error::parse(format!("unknown privacy type '{other}'")))
            }
        };

        let granularity = PrivacyGranularity {
            message: element.has_child("message", ns::PRIVACY),
            iq: element.has_child("iq", ns::PRIVACY),
            presence_in: element.has_child("presence-in", ns::PRIVACY),
            presence_out: element.has_child("presence-out", ns::PRIVACY),
        };

        Ok(Self {
            order,
            action,
            selector,
            granularity,
        })
    }

    fn to_element(&self) -> Element {
        let mut item = Element::builder("item", ns::PRIVACY)
            .attr("action", self.action.as_str())
            .attr("order", self.order.to_string())
            .build();
        match &self.selector {
            PrivacySelector::Any => {}
            PrivacySelector::Jid(jid) => {
                item.set_attr("type", "jid");
                item.set_attr("value", jid.to_string());
            }
            PrivacySelector::Group(group) => {
                item.set_attr("type", "group");
                item.set_attr("value", group.clone());
            }
            PrivacySelector::Subscription(state) => {
                item.set_attr("type", "subscription");
                item.set_attr("value", state.as_str());
            }
        }
        if self.granularity.message {
            item.append_child(Element::bare("message", ns::PRIVACY));
        }
        if self.granularity.iq {
            item.append_child(Element::bare("iq", ns::PRIVACY));
        }
        if self.granularity.presence_in {
            item.append_child(Element::bare("presence-in", ns::PRIVACY));
        }
        if self.granularity.presence_out {
            item.append_child(Element::bare("presence-out", ns::PRIVACY));
        }
        item
    }
}

/// A named privacy list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivacyList {
    /// List name.
    pub name: String,
    /// Rules in ascending order.
    pub rules: Vec<PrivacyRule>,
}

impl PrivacyList {
    /// Build a list, enforcing unique ascending orders.
    pub fn new(name: impl Into<String>, mut rules: Vec<PrivacyRule>) -> Result<Self> {
        rules.sort_by_key(|r| r.order);
        if rules.windows(2).any(|w| w[0].order == w[1].order) {
            return Err(Error::invalid_argument(
                "privacy rule orders must be unique within a list",
            ));
        }
        Ok(Self {
            name: name.into(),
            rules,
        })
    }

    /// Parse from a `<list/>` element.
    pub fn from_element(element: &Element) -> Result<Self> {
        let name = element
            .attr("name")
            .ok_or_else(|| Error::parse("privacy list without name"))?
            .to_string();
        let rules = element
            .children()
            .filter(|c| c.is("item", ns::PRIVACY))
            .map(PrivacyRule::from_element)
            .collect::<Result<Vec<_>>>()?;
        Self::new(name, rules)
    }

    /// Serialize to a `<list/>` element.
    pub fn to_element(&self) -> Element {
        let mut list = Element::builder("list", ns::PRIVACY)
            .attr("name", self.name.clone())
            .build();
        for rule in &self.rules {
            list.append_child(rule.to_element());
        }
        list
    }
}

/// Names of the account's lists with the session markers.
#[derive(Debug, Clone, Default)]
pub struct PrivacyListNames {
    /// All list names.
    pub names: Vec<String>,
    /// The session's active list.
    pub active: Option<String>,
    /// The account's default list.
    pub default: Option<String>,
}

impl Im {
    /// Fetch the account's privacy list names and markers.
    pub async fn get_privacy_lists(&self) -> Result<PrivacyListNames> {
        let iq = Iq::get(Element::bare("query", ns::PRIVACY)).with_id(fresh_id());
        let payload = self
            .connection()
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("privacy query without payload"))?;

        let mut names = PrivacyListNames::default();
        for child in payload.children() {
            match child.name() {
                "list" => {
                    if let Some(name) = child.attr("name") {
                        names.names.push(name.to_string());
                    }
                }
                "active" => names.active = child.attr("name").map(str::to_string),
                "default" => names.default = child.attr("name").map(str::to_string),
                _ => {}
            }
        }
        Ok(names)
    }

    /// Fetch one list's rules.
    pub async fn get_privacy_list(&self, name: &str) -> Result<PrivacyList> {
        let query = Element::builder("query", ns::PRIVACY)
            .append(
                Element::builder("list", ns::PRIVACY)
                    .attr("name", name)
                    .build(),
            )
            .build();
        let payload = self
            .connection()
            .request(Iq::get(query))
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("privacy list response without payload"))?;
        let list = payload
            .get_child("list", ns::PRIVACY)
            .ok_or_else(|| Error::protocol("privacy list response without list"))?;
        PrivacyList::from_element(list)
    }

    /// Create or replace a list.
    pub async fn set_privacy_list(&self, list: &PrivacyList) -> Result<()> {
        let query = Element::builder("query", ns::PRIVACY)
            .append(list.to_element())
            .build();
        self.connection().request(Iq::set(query)).await?.into_result()?;
        Ok(())
    }

    /// Remove a list by submitting it empty.
    pub async fn remove_privacy_list(&self, name: &str) -> Result<()> {
        let query = Element::builder("query", ns::PRIVACY)
            .append(
                Element::builder("list", ns::PRIVACY)
                    .attr("name", name)
                    .build(),
            )
            .build();
        self.connection().request(Iq::set(query)).await?.into_result()?;
        Ok(())
    }

    /// Set or decline the session's active list.
    pub async fn set_active_privacy_list(&self, name: Option<&str>) -> Result<()> {
        self.set_privacy_marker("active", name).await
    }

    /// Set or decline the account's default list.
    pub async fn set_default_privacy_list(&self, name: Option<&str>) -> Result<()> {
        self.set_privacy_marker("default", name).await
    }

    async fn set_privacy_marker(&self, marker: &str, name: Option<&str>) -> Result<()> {
        let mut elem = Element::builder(marker, ns::PRIVACY).build();
        if let Some(name) = name {
            elem.set_attr("name", name);
        }
        let query = Element::builder("query", ns::PRIVACY).append(elem).build();
        self.connection().request(Iq::set(query)).await?.into_result()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_round_trips_with_selector_and_granularity() {
        let rule = PrivacyRule {
            order: 7,
            action: PrivacyAction::Deny,
            selector: PrivacySelector::Jid("spammer@test".parse().unwrap()),
            granularity: PrivacyGranularity {
                message: true,
                presence_in: true,
                ..PrivacyGranularity::default()
            },
        };
        let parsed = PrivacyRule::from_element(&rule.to_element()).unwrap();
        assert_eq!(parsed, rule);
    }

    #[test]
    fn list_sorts_rules_by_order() {
        let list = PrivacyList::new(
            "work",
            vec![
                PrivacyRule::new(20, PrivacyAction::Allow),
                PrivacyRule::new(10, PrivacyAction::Deny)
                    .with_selector(PrivacySelector::Group("Blocked".into())),
            ],
        )
        .unwrap();
        assert_eq!(list.rules[0].order, 10);
        assert_eq!(list.rules[1].order, 20);
    }

    #[test]
    fn duplicate_orders_are_rejected() {
        let result = PrivacyList::new(
            "bad",
            vec![
                PrivacyRule::new(1, PrivacyAction::Allow),
                PrivacyRule::new(1, PrivacyAction::Deny),
            ],
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn list_round_trips() {
        let list = PrivacyList::new(
            "default",
            vec![
                PrivacyRule::new(1, PrivacyAction::Deny).with_selector(
                    PrivacySelector::Subscription(SubscriptionState::None),
                ),
                PrivacyRule::new(2, PrivacyAction::Allow),
            ],
        )
        .unwrap();
        let parsed = PrivacyList::from_element(&list.to_element()).unwrap();
        assert_eq!(parsed, list);
    }
}
