//! Distinguished names and relative distinguished names.
//!
//! This is the minimal DN handling the replication core needs: normalized
//! parse/display, parent/child navigation, and multi-valued RDNs (used by
//! conflict names of the form `entryuuid=<uuid>+cn=x`). Attribute names and
//! values are normalized to lowercase at parse time so equality and hashing
//! are schema-free.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A relative distinguished name: one or more attribute/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rdn {
    avas: Vec<(String, String)>,
}

impl Rdn {
    /// Builds a single-valued RDN.
    pub fn new(attr: &str, value: &str) -> Self {
        Self {
            avas: vec![(normalize(attr), normalize(value))],
        }
    }

    /// Builds a multi-valued RDN from attribute/value pairs.
    pub fn multi(avas: Vec<(String, String)>) -> Self {
        Self {
            avas: avas
                .into_iter()
                .map(|(a, v)| (normalize(&a), normalize(&v)))
                .collect(),
        }
    }

    /// The attribute/value pairs of this RDN.
    pub fn avas(&self) -> &[(String, String)] {
        &self.avas
    }

    /// Returns true if the RDN contains the given attribute type.
    pub fn has_attribute(&self, attr: &str) -> bool {
        let attr = normalize(attr);
        self.avas.iter().any(|(a, _)| *a == attr)
    }

    /// The value this RDN carries for `attr`, if any.
    pub fn value_of(&self, attr: &str) -> Option<&str> {
        let attr = normalize(attr);
        self.avas
            .iter()
            .find(|(a, _)| *a == attr)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (a, v)) in self.avas.iter().enumerate() {
            if i > 0 {
                write!(f, "+")?;
            }
            write!(f, "{a}={v}")?;
        }
        Ok(())
    }
}

/// A distinguished name, stored leaf-first (`cn=x,dc=example` has `cn=x`
/// at index 0).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

/// Error parsing a DN or RDN from its string form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid DN: {input}")]
pub struct DnParseError {
    /// The rejected input.
    pub input: String,
}

impl Dn {
    /// The root DN (zero RDNs). Only useful as a parent sentinel.
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    /// Number of RDN components.
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// The leaf RDN, if the DN is not the root.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// The parent DN, or `None` for the root.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// The DN obtained by placing `rdn` directly under `self`.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    /// The DN obtained by replacing the leaf RDN with `rdn`, keeping the
    /// parent. Returns `None` for the root.
    pub fn with_rdn(&self, rdn: Rdn) -> Option<Dn> {
        self.parent().map(|p| p.child(rdn))
    }

    /// Returns true if `self` sits directly under `parent`.
    pub fn is_child_of(&self, parent: &Dn) -> bool {
        self.parent().as_ref() == Some(parent)
    }

    /// Returns true if `self` is `other` or sits anywhere below it.
    pub fn is_under(&self, other: &Dn) -> bool {
        if self.rdns.len() < other.rdns.len() {
            return false;
        }
        self.rdns[self.rdns.len() - other.rdns.len()..] == other.rdns[..]
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{rdn}")?;
        }
        Ok(())
    }
}

impl FromStr for Rdn {
    type Err = DnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DnParseError {
            input: s.to_string(),
        };
        let mut avas = Vec::new();
        for ava in s.split('+') {
            let (attr, value) = ava.split_once('=').ok_or_else(err)?;
            let attr = normalize(attr);
            let value = normalize(value);
            if attr.is_empty() || value.is_empty() {
                return Err(err());
            }
            avas.push((attr, value));
        }
        if avas.is_empty() {
            return Err(err());
        }
        Ok(Rdn { avas })
    }
}

impl FromStr for Dn {
    type Err = DnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Dn::root());
        }
        let mut rdns = Vec::new();
        for part in s.split(',') {
            rdns.push(part.parse::<Rdn>().map_err(|_| DnParseError {
                input: s.to_string(),
            })?);
        }
        Ok(Dn { rdns })
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(s: &str) -> Dn {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let d = dn("cn=Test, dc=Example,dc=com");
        assert_eq!(d.to_string(), "cn=test,dc=example,dc=com");
        assert_eq!(d.depth(), 3);
    }

    #[test]
    fn test_parent_and_rdn() {
        let d = dn("cn=x,dc=test");
        assert_eq!(d.parent().unwrap(), dn("dc=test"));
        assert_eq!(d.rdn().unwrap(), &Rdn::new("cn", "x"));
    }

    #[test]
    fn test_child() {
        let base = dn("dc=test");
        assert_eq!(base.child(Rdn::new("cn", "x")), dn("cn=x,dc=test"));
    }

    #[test]
    fn test_with_rdn_replaces_leaf() {
        let d = dn("cn=x,dc=test");
        assert_eq!(d.with_rdn(Rdn::new("cn", "y")).unwrap(), dn("cn=y,dc=test"));
    }

    #[test]
    fn test_multi_valued_rdn() {
        let d = dn("entryuuid=abc+cn=x,dc=test");
        let rdn = d.rdn().unwrap();
        assert!(rdn.has_attribute("entryuuid"));
        assert!(rdn.has_attribute("cn"));
        assert_eq!(rdn.value_of("cn"), Some("x"));
        assert_eq!(d.to_string(), "entryuuid=abc+cn=x,dc=test");
    }

    #[test]
    fn test_is_child_of_and_is_under() {
        let base = dn("dc=test");
        let child = dn("ou=people,dc=test");
        let grandchild = dn("cn=x,ou=people,dc=test");
        assert!(child.is_child_of(&base));
        assert!(!grandchild.is_child_of(&base));
        assert!(grandchild.is_under(&base));
        assert!(grandchild.is_under(&child));
        assert!(!base.is_under(&child));
    }

    #[test]
    fn test_equality_is_case_insensitive() {
        assert_eq!(dn("CN=Foo,DC=Test"), dn("cn=foo,dc=test"));
    }

    #[test]
    fn test_parse_rejects_missing_value() {
        assert!("cn=,dc=test".parse::<Dn>().is_err());
        assert!("cn,dc=test".parse::<Dn>().is_err());
    }

    #[test]
    fn test_root_has_no_parent() {
        assert_eq!(Dn::root().parent(), None);
        assert_eq!(Dn::root().rdn(), None);
    }
}
