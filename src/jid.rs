//! XMPP addresses.
//!
//! A JID is `node@domain/resource` where `node` and `resource` are
//! optional. Equality is over the full triple; [`Jid::to_bare`] drops the
//! resource. Normalization is limited to ASCII-lowercasing the domain;
//! full stringprep profiles are out of scope.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// An XMPP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Build a JID from its parts, validating each.
    pub fn new(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, Error> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(Error::InvalidJid("empty domain".into()));
        }
        if domain.contains('@') || domain.contains('/') {
            return Err(Error::InvalidJid(format!("malformed domain '{domain}'")));
        }
        if let Some(node) = node {
            if node.is_empty() {
                return Err(Error::InvalidJid("empty node part".into()));
            }
            if node.contains('@') || node.contains('/') {
                return Err(Error::InvalidJid(format!("malformed node '{node}'")));
            }
        }
        if let Some(resource) = resource {
            if resource.is_empty() {
                return Err(Error::InvalidJid("empty resource part".into()));
            }
        }

        Ok(Self {
            node: node.map(|s| s.to_string()),
            domain: domain.to_ascii_lowercase(),
            resource: resource.map(|s| s.to_string()),
        })
    }

    /// Build a bare `node@domain` JID.
    pub fn bare(node: &str, domain: &str) -> Result<Self, Error> {
        Self::new(Some(node), domain, None)
    }

    /// Build a domain-only JID (servers, MUC services).
    pub fn domain(domain: &str) -> Result<Self, Error> {
        Self::new(None, domain, None)
    }

    /// The node (local) part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain_part(&self) -> &str {
        &self.domain
    }

    /// The resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether this JID carries no resource.
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// Whether this JID carries a resource.
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// This JID with the resource dropped.
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// This JID with the given resource attached.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, Error> {
        Self::new(self.node.as_deref(), &self.domain, Some(resource))
    }

    /// Whether `other` addresses the same bare JID.
    pub fn bare_eq(&self, other: &Jid) -> bool {
        self.node == other.node && self.domain == other.domain
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidJid("empty JID".into()));
        }

        // The resource is everything after the first '/'; a '@' inside the
        // resource is legal and must not split the node.
        let (addr, resource) = match s.split_once('/') {
            Some((addr, resource)) => (addr, Some(resource)),
            None => (s, None),
        };

        let (node, domain) = match addr.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, addr),
        };

        Jid::new(node, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for Jid {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Error> {
        s.parse()
    }
}
