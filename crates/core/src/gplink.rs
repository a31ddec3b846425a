//! `gPLink` codec: the ordered list of GPOs linked to a container.
//!
//! Wire form is a concatenation of `[LDAP://<gpo dn>;<flags>]` entries,
//! where flag bit 0 disables the link and bit 1 enforces it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dn;
use crate::error::CoreError;
use crate::types::GpoId;

const LINK_DISABLED: u32 = 0b01;
const LINK_ENFORCED: u32 = 0b10;

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[LDAP://([^;\]]+);(\d+)\]").expect("valid regex"));

/// One entry of a container's link list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpLink {
    /// GPO DN exactly as stored, so foreign entries survive a rewrite.
    pub dn: String,
    pub flags: u32,
}

impl GpLink {
    /// An enabled, non-enforced link to `id`.
    pub fn new(id: &GpoId, domain_dn: &str) -> Self {
        Self {
            dn: dn::gpo_dn(id, domain_dn),
            flags: 0,
        }
    }

    pub fn gpo_id(&self) -> Option<GpoId> {
        dn::gpo_id_from_dn(&self.dn)
    }

    pub fn enabled(&self) -> bool {
        self.flags & LINK_DISABLED == 0
    }

    pub fn enforced(&self) -> bool {
        self.flags & LINK_ENFORCED != 0
    }

    pub fn points_to(&self, id: &GpoId) -> bool {
        self.gpo_id().as_ref() == Some(id)
    }
}

/// Ordered link list of one container.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerLinks {
    pub links: Vec<GpLink>,
}

impl ContainerLinks {
    /// Parse a `gPLink` value. Anything between entries other than
    /// whitespace makes the value unusable for a safe rewrite.
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut links = Vec::new();
        let mut cursor = 0;
        for caps in LINK_RE.captures_iter(value) {
            let whole = caps.get(0).expect("group 0 always present");
            if !value[cursor..whole.start()].trim().is_empty() {
                return Err(format!("unexpected text at offset {cursor}"));
            }
            cursor = whole.end();
            let flags = caps[2]
                .parse::<u32>()
                .map_err(|_| format!("invalid link flags '{}'", &caps[2]))?;
            links.push(GpLink {
                dn: caps[1].to_string(),
                flags,
            });
        }
        if !value[cursor..].trim().is_empty() {
            return Err(format!("unexpected text at offset {cursor}"));
        }
        Ok(Self { links })
    }

    pub fn render(&self) -> String {
        self.links
            .iter()
            .map(|l| format!("[LDAP://{};{}]", l.dn, l.flags))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn contains(&self, id: &GpoId) -> bool {
        self.links.iter().any(|l| l.points_to(id))
    }

    /// `(gpo, enabled, enforced)` for every entry that names a GPO.
    pub fn entries(&self) -> Vec<(GpoId, bool, bool)> {
        self.links
            .iter()
            .filter_map(|l| l.gpo_id().map(|id| (id, l.enabled(), l.enforced())))
            .collect()
    }

    /// Append a link to `id`; the list never names the same GPO twice.
    pub fn append(&mut self, id: &GpoId, domain_dn: &str) -> Result<(), CoreError> {
        if self.contains(id) {
            return Err(CoreError::Conflict(format!("GPO {id} is already linked")));
        }
        self.links.push(GpLink::new(id, domain_dn));
        Ok(())
    }

    /// Remove the link to `id`, keeping the order of the others.
    pub fn remove(&mut self, id: &GpoId) -> Result<GpLink, CoreError> {
        let index = self
            .links
            .iter()
            .position(|l| l.points_to(id))
            .ok_or_else(|| CoreError::not_found("link", id))?;
        Ok(self.links.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const DOMAIN: &str = "DC=example,DC=com";

    #[test]
    fn parse_reads_entries_and_flags() {
        let a = GpoId::new_random();
        let b = GpoId::new_random();
        let value = format!(
            "[LDAP://{};0] [ldap://{};3]",
            dn::gpo_dn(&a, DOMAIN),
            dn::gpo_dn(&b, DOMAIN).to_lowercase()
        );
        let links = ContainerLinks::parse(&value).unwrap();
        assert_eq!(links.entries(), vec![(a, true, false), (b, false, true)]);
    }

    #[test]
    fn parse_empty_value() {
        assert!(ContainerLinks::parse("").unwrap().is_empty());
        assert!(ContainerLinks::parse("  ").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_garbage_between_entries() {
        let value = format!("[LDAP://{};0]junk", dn::gpo_dn(&GpoId::new_random(), DOMAIN));
        assert!(ContainerLinks::parse(&value).is_err());
        assert!(ContainerLinks::parse("junk").is_err());
    }

    #[test]
    fn foreign_entries_survive_render() {
        let value = "[LDAP://cn=not-a-guid,cn=policies,cn=system,DC=example,DC=com;1]";
        let links = ContainerLinks::parse(value).unwrap();
        assert!(links.entries().is_empty());
        assert_eq!(links.render(), value);
    }

    #[test]
    fn append_rejects_duplicates() {
        let id = GpoId::new_random();
        let mut links = ContainerLinks::default();
        links.append(&id, DOMAIN).unwrap();
        assert_matches!(links.append(&id, DOMAIN), Err(CoreError::Conflict(_)));
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn append_then_remove_restores_previous_value() {
        let existing = [GpoId::new_random(), GpoId::new_random()];
        let mut links = ContainerLinks::default();
        for id in &existing {
            links.append(id, DOMAIN).unwrap();
        }
        let before = links.render();

        let id = GpoId::new_random();
        links.append(&id, DOMAIN).unwrap();
        let removed = links.remove(&id).unwrap();
        assert!(removed.enabled());
        assert!(!removed.enforced());
        assert_eq!(links.render(), before);
    }

    #[test]
    fn remove_missing_is_not_found() {
        let mut links = ContainerLinks::default();
        assert_matches!(
            links.remove(&GpoId::new_random()),
            Err(CoreError::NotFound { .. })
        );
    }
}
