//! In-process directory backend.
//!
//! Holds GPO records and container `gPLink` values behind a single
//! `RwLock`. `gPLink` is kept in its wire form so every read and write goes
//! through the same codec as a real directory.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use soon_core::dn;
use soon_core::error::{CoreError, CoreResult};
use soon_core::gplink::ContainerLinks;
use soon_core::model::{GpoRecord, FUNCTIONALITY_VERSION};
use soon_core::script::Scope;
use soon_core::types::GpoId;
use soon_core::version::GpoVersion;
use tokio::sync::RwLock;

use crate::{DirectoryStore, VersionWrite};

struct Container {
    dn: String,
    gplink: String,
}

#[derive(Default)]
struct State {
    gpos: BTreeMap<GpoId, GpoRecord>,
    /// Keyed by normalized DN.
    containers: HashMap<String, Container>,
    /// Identifiers of deleted GPOs; never handed out again.
    retired: HashSet<GpoId>,
}

pub struct MemoryDirectory {
    domain_dn: String,
    realm: String,
    state: RwLock<State>,
}

impl MemoryDirectory {
    /// Create a directory holding only the domain root container.
    pub fn new(domain_dn: impl Into<String>) -> Self {
        let domain_dn = domain_dn.into();
        let realm = dn::realm_from_domain_dn(&domain_dn);
        let mut state = State::default();
        state.containers.insert(
            dn::normalize(&domain_dn),
            Container {
                dn: domain_dn.clone(),
                gplink: String::new(),
            },
        );
        Self {
            domain_dn,
            realm,
            state: RwLock::new(state),
        }
    }

    /// Add an organizational unit, site or other linkable container.
    pub async fn add_container(&self, container_dn: &str) -> CoreResult<()> {
        dn::validate_container_dn(container_dn)?;
        let mut state = self.state.write().await;
        let key = dn::normalize(container_dn);
        if state.containers.contains_key(&key) {
            return Err(CoreError::Conflict(format!(
                "Container {container_dn} already exists"
            )));
        }
        state.containers.insert(
            key,
            Container {
                dn: container_dn.to_string(),
                gplink: String::new(),
            },
        );
        Ok(())
    }

    /// Raw `gPLink` value of a container, as a directory client would see it.
    pub async fn raw_gplink(&self, container_dn: &str) -> Option<String> {
        self.state
            .read()
            .await
            .containers
            .get(&dn::normalize(container_dn))
            .map(|c| c.gplink.clone())
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    fn domain_dn(&self) -> &str {
        &self.domain_dn
    }

    async fn create_object(&self, display_name: &str) -> CoreResult<GpoRecord> {
        let mut state = self.state.write().await;
        if state
            .gpos
            .values()
            .any(|r| r.display_name.eq_ignore_ascii_case(display_name))
        {
            return Err(CoreError::Conflict(format!(
                "A GPO named '{display_name}' already exists"
            )));
        }

        let id = loop {
            let candidate = GpoId::new_random();
            if !state.gpos.contains_key(&candidate) && !state.retired.contains(&candidate) {
                break candidate;
            }
        };
        let now = chrono::Utc::now();
        let record = GpoRecord {
            id,
            dn: dn::gpo_dn(&id, &self.domain_dn),
            display_name: display_name.to_string(),
            file_sys_path: dn::file_sys_path(&self.realm, &id),
            version: GpoVersion::INITIAL,
            user_extension_names: String::new(),
            machine_extension_names: String::new(),
            functionality_version: FUNCTIONALITY_VERSION,
            flags: 0,
            created_at: now,
            updated_at: now,
        };
        state.gpos.insert(id, record.clone());
        Ok(record)
    }

    async fn read_object(&self, id: &GpoId) -> CoreResult<GpoRecord> {
        self.state
            .read()
            .await
            .gpos
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("GPO", id))
    }

    async fn find_by_display_name(&self, display_name: &str) -> CoreResult<Option<GpoRecord>> {
        Ok(self
            .state
            .read()
            .await
            .gpos
            .values()
            .find(|r| r.display_name.eq_ignore_ascii_case(display_name))
            .cloned())
    }

    async fn list_objects(&self) -> CoreResult<Vec<GpoRecord>> {
        Ok(self.state.read().await.gpos.values().cloned().collect())
    }

    async fn delete_object(&self, id: &GpoId) -> CoreResult<()> {
        let mut state = self.state.write().await;
        state
            .gpos
            .remove(id)
            .ok_or_else(|| CoreError::not_found("GPO", id))?;
        state.retired.insert(*id);
        Ok(())
    }

    async fn write_version(&self, id: &GpoId, write: &VersionWrite) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .gpos
            .get_mut(id)
            .ok_or_else(|| CoreError::not_found("GPO", id))?;
        record.version = write.version;
        if let Some((scope, names)) = &write.extension_names {
            let target = match scope {
                Scope::Machine => &mut record.machine_extension_names,
                Scope::User => &mut record.user_extension_names,
            };
            target.clone_from(names);
        }
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn read_container_links(&self, container_dn: &str) -> CoreResult<ContainerLinks> {
        let state = self.state.read().await;
        let container = state
            .containers
            .get(&dn::normalize(container_dn))
            .ok_or_else(|| CoreError::not_found("container", container_dn))?;
        ContainerLinks::parse(&container.gplink).map_err(|e| {
            CoreError::StoreUnavailable(format!("Malformed gPLink on {}: {e}", container.dn))
        })
    }

    async fn write_container_links(
        &self,
        container_dn: &str,
        links: &ContainerLinks,
    ) -> CoreResult<()> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get_mut(&dn::normalize(container_dn))
            .ok_or_else(|| CoreError::not_found("container", container_dn))?;
        container.gplink = links.render();
        Ok(())
    }

    async fn linked_containers(&self, id: &GpoId) -> CoreResult<Vec<String>> {
        let state = self.state.read().await;
        let mut linked = Vec::new();
        for container in state.containers.values() {
            let links = ContainerLinks::parse(&container.gplink).map_err(|e| {
                CoreError::StoreUnavailable(format!("Malformed gPLink on {}: {e}", container.dn))
            })?;
            if links.contains(id) {
                linked.push(container.dn.clone());
            }
        }
        linked.sort();
        Ok(linked)
    }

    async fn ping(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const DOMAIN: &str = "DC=example,DC=com";

    #[tokio::test]
    async fn create_assigns_dn_and_sysvol_path() {
        let dir = MemoryDirectory::new(DOMAIN);
        let record = dir.create_object("Test").await.unwrap();
        assert_eq!(record.version, GpoVersion::INITIAL);
        assert_eq!(record.dn, dn::gpo_dn(&record.id, DOMAIN));
        assert!(record.file_sys_path.starts_with(r"\\example.com\sysvol\example.com\Policies\{"));
        assert_eq!(dir.read_object(&record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn duplicate_display_name_conflicts() {
        let dir = MemoryDirectory::new(DOMAIN);
        dir.create_object("Test").await.unwrap();
        assert_matches!(dir.create_object("test").await, Err(CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn deleted_object_is_gone() {
        let dir = MemoryDirectory::new(DOMAIN);
        let record = dir.create_object("Test").await.unwrap();
        dir.delete_object(&record.id).await.unwrap();
        assert_matches!(
            dir.read_object(&record.id).await,
            Err(CoreError::NotFound { .. })
        );
        assert_matches!(
            dir.delete_object(&record.id).await,
            Err(CoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn write_version_sets_extension_names() {
        let dir = MemoryDirectory::new(DOMAIN);
        let record = dir.create_object("Test").await.unwrap();
        let names = Scope::User.script_extension_names().to_string();
        let write = VersionWrite {
            version: GpoVersion { machine: 0, user: 1 },
            extension_names: Some((Scope::User, names.clone())),
        };
        dir.write_version(&record.id, &write).await.unwrap();

        let stored = dir.read_object(&record.id).await.unwrap();
        assert_eq!(stored.version.user, 1);
        assert_eq!(stored.user_extension_names, names);
        assert!(stored.machine_extension_names.is_empty());
    }

    #[tokio::test]
    async fn container_links_roundtrip_and_scan() {
        let dir = MemoryDirectory::new(DOMAIN);
        let ou = "OU=Test,DC=example,DC=com";
        dir.add_container(ou).await.unwrap();
        let record = dir.create_object("Test").await.unwrap();

        let mut links = dir.read_container_links(ou).await.unwrap();
        links.append(&record.id, DOMAIN).unwrap();
        dir.write_container_links(ou, &links).await.unwrap();

        assert_eq!(
            dir.raw_gplink(ou).await.unwrap(),
            format!("[LDAP://{};0]", record.dn)
        );
        assert_eq!(dir.linked_containers(&record.id).await.unwrap(), vec![ou.to_string()]);
    }

    #[tokio::test]
    async fn unknown_container_is_not_found() {
        let dir = MemoryDirectory::new(DOMAIN);
        assert_matches!(
            dir.read_container_links("OU=Missing,DC=example,DC=com").await,
            Err(CoreError::NotFound { .. })
        );
        assert_matches!(
            dir.write_container_links("OU=Missing,DC=example,DC=com", &ContainerLinks::default())
                .await,
            Err(CoreError::NotFound { .. })
        );
    }
}
