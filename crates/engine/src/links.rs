//! Link Manager: a GPO's place in container `gPLink` lists.
//!
//! Links live on the container, not the GPO, so linking does not touch
//! `GPT.INI` or `versionNumber`. The GPO section still serializes link
//! changes against other mutations of the same GPO (notably delete), and the
//! nested container section serializes writers of the same `gPLink`.

use soon_core::dn;
use soon_core::error::{CoreError, CoreResult};
use soon_core::types::GpoId;
use soon_directory::DirectoryStore;

use crate::coordinator::VersionCoordinator;

#[derive(Clone)]
pub struct LinkManager {
    coordinator: VersionCoordinator,
}

impl LinkManager {
    pub fn new(coordinator: VersionCoordinator) -> Self {
        Self { coordinator }
    }

    /// Append the GPO, enabled and not enforced, to the end of the container's links.
    pub async fn link(&self, id: GpoId, container_dn: &str) -> CoreResult<()> {
        dn::validate_container_dn(container_dn)?;
        let container_dn = container_dn.to_string();
        self.coordinator
            .with_section(id, move |section| async move {
                let _container = section.lock_container(&container_dn).await?;
                let directory = section.directory();
                let mut links = directory.read_container_links(&container_dn).await?;
                links.append(&id, directory.domain_dn())?;
                directory.write_container_links(&container_dn, &links).await?;
                tracing::info!(gpo = %id, container = %container_dn, position = links.len() - 1, "GPO linked");
                Ok(())
            })
            .await
    }

    /// Remove the GPO from the container's links, keeping the others' order.
    pub async fn unlink(&self, id: GpoId, container_dn: &str) -> CoreResult<()> {
        dn::validate_container_dn(container_dn)?;
        let container_dn = container_dn.to_string();
        self.coordinator
            .with_unverified_section(id, move |section| async move {
                let _container = section.lock_container(&container_dn).await?;
                let directory = section.directory();
                let mut links = directory.read_container_links(&container_dn).await?;
                links.remove(&id)?;
                directory.write_container_links(&container_dn, &links).await?;
                tracing::info!(gpo = %id, container = %container_dn, "GPO unlinked");
                Ok(())
            })
            .await
    }

    /// Link to each container in turn. Containers already linking the GPO
    /// are skipped; any other failure stops the batch with earlier links kept.
    /// Returns the containers that were newly linked.
    pub async fn link_many(&self, id: GpoId, container_dns: &[String]) -> CoreResult<Vec<String>> {
        for container_dn in container_dns {
            dn::validate_container_dn(container_dn)?;
        }
        let mut linked = Vec::new();
        for container_dn in container_dns {
            match self.link(id, container_dn).await {
                Ok(()) => linked.push(container_dn.clone()),
                Err(CoreError::Conflict(_)) => {
                    tracing::debug!(gpo = %id, container = %container_dn, "Already linked, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(linked)
    }

    /// Unlink the GPO from every container that currently links it.
    /// Returns the containers it was removed from.
    pub async fn unlink_all(&self, id: GpoId) -> CoreResult<Vec<String>> {
        let containers = self.coordinator.directory().linked_containers(&id).await?;
        let mut unlinked = Vec::with_capacity(containers.len());
        for container_dn in containers {
            match self.unlink(id, &container_dn).await {
                Ok(()) => unlinked.push(container_dn),
                // Someone else got there first.
                Err(CoreError::NotFound { entity: "link", .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(unlinked)
    }

    /// Containers currently linking the GPO.
    pub async fn links_of(&self, id: &GpoId) -> CoreResult<Vec<String>> {
        self.coordinator.directory().linked_containers(id).await
    }
}
