//! GPO Lifecycle Manager: the facade a transport layer calls.
//!
//! Composes the stores, the coordinator, the link manager and the script
//! engine. Errors from below are passed through unchanged.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use soon_core::dn;
use soon_core::error::{CoreError, CoreResult};
use soon_core::ini;
use soon_core::model::{GpoRecord, GroupPolicyObject};
use soon_core::script::{GpoScripts, ScriptEntry, ScriptKind};
use soon_core::types::{GpoId, Timestamp};
use soon_directory::{DirectoryStore, LdbDirectory};
use soon_sysvol::{FsTemplateStore, TemplateStore};

use crate::config::EngineConfig;
use crate::coordinator::{run_detached, VersionCoordinator};
use crate::links::LinkManager;
use crate::scripts::ScriptEngine;
use crate::signer::ScriptSigner;

/// GPOs verified concurrently during an audit.
const AUDIT_CONCURRENCY: usize = 8;

/// Status of one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub configured: bool,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// True when every configured component is healthy.
    pub healthy: bool,
    pub directory: ComponentHealth,
    pub templates: ComponentHealth,
    pub signer: ComponentHealth,
    pub checked_at: Timestamp,
}

/// Version agreement of one GPO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionCheck {
    pub id: GpoId,
    pub display_name: String,
    pub directory_version: u32,
    /// `None` when the template tree or its `GPT.INI` could not be read.
    pub template_version: Option<u32>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VersionCheck {
    pub fn consistent(&self) -> bool {
        !self.degraded && self.template_version == Some(self.directory_version)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub checked: usize,
    pub inconsistent: Vec<VersionCheck>,
    /// Template trees with no directory object.
    pub orphan_trees: Vec<GpoId>,
    pub audited_at: Timestamp,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.inconsistent.is_empty() && self.orphan_trees.is_empty()
    }
}

/// Facade over the GPO engine. Cheap to clone.
#[derive(Clone)]
pub struct GpoManager {
    directory: Arc<dyn DirectoryStore>,
    templates: Arc<dyn TemplateStore>,
    signer: Option<Arc<dyn ScriptSigner>>,
    coordinator: VersionCoordinator,
    links: LinkManager,
    scripts: ScriptEngine,
}

impl GpoManager {
    pub fn new(
        directory: Arc<dyn DirectoryStore>,
        templates: Arc<dyn TemplateStore>,
        signer: Option<Arc<dyn ScriptSigner>>,
        section_timeout: Duration,
    ) -> Self {
        let coordinator = VersionCoordinator::new(directory.clone(), templates.clone(), section_timeout);
        Self {
            links: LinkManager::new(coordinator.clone()),
            scripts: ScriptEngine::new(coordinator.clone(), signer.clone()),
            directory,
            templates,
            signer,
            coordinator,
        }
    }

    /// Wire up the `ldb*` directory backend, the sysvol tree and the optional signer.
    pub fn from_config(config: &EngineConfig) -> Self {
        let directory: Arc<dyn DirectoryStore> = Arc::new(LdbDirectory::new(config.ldb_config()));
        let templates: Arc<dyn TemplateStore> = Arc::new(FsTemplateStore::new(config.template_root.clone()));
        let signer = config
            .signer()
            .map(|s| Arc::new(s) as Arc<dyn ScriptSigner>);
        Self::new(directory, templates, signer, config.section_timeout)
    }

    pub fn links(&self) -> &LinkManager {
        &self.links
    }

    pub fn scripts(&self) -> &ScriptEngine {
        &self.scripts
    }

    pub fn coordinator(&self) -> &VersionCoordinator {
        &self.coordinator
    }

    pub fn template_path(&self, id: &GpoId) -> PathBuf {
        self.templates.template_path(id)
    }

    // ---- Create / read ----

    /// Create a GPO, optionally linked to `container_dn`.
    ///
    /// The directory object is created first, then the template tree, then
    /// the link. A failure at any step removes what the earlier steps made.
    pub async fn create(&self, display_name: &str, container_dn: Option<&str>) -> CoreResult<GroupPolicyObject> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(CoreError::InvalidArgument("GPO display name must not be empty".into()));
        }
        // Lands in GPT.INI as `displayName=`.
        ini::check_value("GPO display name", display_name)?;
        if let Some(container) = container_dn {
            dn::validate_container_dn(container)?;
            // Fails with NotFound before anything is created.
            self.directory.read_container_links(container).await?;
        }

        let this = self.clone();
        let display_name = display_name.to_string();
        let container_dn = container_dn.map(str::to_string);
        let id = run_detached(async move { this.create_steps(&display_name, container_dn.as_deref()).await })
            .await?;
        self.get(&id).await
    }

    async fn create_steps(&self, display_name: &str, container_dn: Option<&str>) -> CoreResult<GpoId> {
        let record = self.directory.create_object(display_name).await?;
        let id = record.id;

        if let Err(e) = self.templates.create_tree(&id, Some(display_name)).await {
            tracing::warn!(gpo = %id, error = %e, "Template tree creation failed, removing directory object");
            self.compensate_directory(&id).await;
            return Err(e);
        }

        if let Some(container) = container_dn {
            if let Err(e) = self.links.link(id, container).await {
                tracing::warn!(gpo = %id, container, error = %e, "Initial link failed, removing GPO");
                if let Err(tree_err) = self.templates.delete_tree(&id).await {
                    tracing::error!(gpo = %id, error = %tree_err, "Compensating tree removal failed");
                }
                self.compensate_directory(&id).await;
                return Err(e);
            }
        }

        tracing::info!(gpo = %id, display_name, container = ?container_dn, "GPO created");
        Ok(id)
    }

    async fn compensate_directory(&self, id: &GpoId) {
        if let Err(e) = self.directory.delete_object(id).await {
            tracing::error!(gpo = %id, error = %e, "Compensating directory delete failed");
        }
    }

    /// Join a directory record with its links and scripts.
    ///
    /// A missing template tree under a live directory object is
    /// `Inconsistent`; `NotFound` only when the object itself is gone.
    async fn assemble(&self, record: GpoRecord) -> CoreResult<GroupPolicyObject> {
        let id = record.id;
        let links = self.directory.linked_containers(&id).await?;
        let scripts = match self.scripts.list_scripts(&id).await {
            Ok(scripts) => scripts,
            Err(CoreError::NotFound { .. }) => {
                self.directory.read_object(&id).await?;
                return Err(CoreError::inconsistent(id, "directory object has no template tree"));
            }
            Err(e) => return Err(e),
        };
        Ok(GroupPolicyObject::assemble(
            record,
            self.templates.template_path(&id),
            links,
            scripts,
        ))
    }

    pub async fn get(&self, id: &GpoId) -> CoreResult<GroupPolicyObject> {
        let record = self.directory.read_object(id).await?;
        self.assemble(record).await
    }

    pub async fn find_by_name(&self, display_name: &str) -> CoreResult<Option<GroupPolicyObject>> {
        match self.directory.find_by_display_name(display_name).await? {
            Some(record) => Ok(Some(self.assemble(record).await?)),
            None => Ok(None),
        }
    }

    /// Every GPO that can be assembled, sorted by display name.
    ///
    /// GPOs deleted during the listing are left out, and so are GPOs whose
    /// template tree is broken; [`audit`](Self::audit) reports those.
    pub async fn list(&self) -> CoreResult<Vec<GroupPolicyObject>> {
        let records = self.directory.list_objects().await?;
        let mut gpos = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            match self.assemble(record).await {
                Ok(gpo) => gpos.push(gpo),
                Err(CoreError::NotFound { .. }) => {}
                Err(e @ CoreError::Inconsistent { .. }) => {
                    tracing::warn!(gpo = %id, error = %e, "Leaving unreadable GPO out of listing");
                }
                Err(e) => return Err(e),
            }
        }
        gpos.sort_by(|a, b| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()));
        Ok(gpos)
    }

    // ---- Delete ----

    /// Delete a GPO that no container links any more.
    ///
    /// The tree is moved aside first, then the directory object is deleted,
    /// then the tree is purged. If the directory delete fails the tree is
    /// moved back.
    pub async fn delete(&self, id: &GpoId) -> CoreResult<()> {
        let coordinator = self.coordinator.clone();
        self.coordinator
            .with_unverified_section(*id, move |section| async move {
                let id = section.id();
                let directory = section.directory().clone();
                let templates = section.templates().clone();

                let linked = directory.linked_containers(&id).await?;
                if !linked.is_empty() {
                    return Err(CoreError::Conflict(format!(
                        "GPO {id} is still linked to {}",
                        linked.join("; ")
                    )));
                }

                let detached = match templates.detach_tree(&id).await {
                    Ok(detached) => Some(detached),
                    Err(CoreError::NotFound { .. }) => {
                        tracing::warn!(gpo = %id, "Template tree already missing, deleting directory object only");
                        None
                    }
                    Err(e) => return Err(e),
                };

                if let Err(e) = directory.delete_object(&id).await {
                    if let Some(detached) = &detached {
                        if let Err(restore_err) = templates.restore_tree(detached).await {
                            tracing::error!(
                                gpo = %id,
                                path = %detached.path.display(),
                                error = %restore_err,
                                "Failed to restore template tree after directory delete failed"
                            );
                            return Err(CoreError::inconsistent(
                                id,
                                format!("template tree left at {}: {e}", detached.path.display()),
                            ));
                        }
                    }
                    return Err(e);
                }

                if let Some(detached) = &detached {
                    if let Err(e) = templates.purge_tree(detached).await {
                        tracing::warn!(gpo = %id, path = %detached.path.display(), error = %e, "Failed to purge detached tree");
                    }
                }
                coordinator.forget(&id);
                tracing::info!(gpo = %id, "GPO deleted");
                Ok(())
            })
            .await
    }

    // ---- Links ----

    pub async fn link(&self, id: &GpoId, container_dn: &str) -> CoreResult<()> {
        self.links.link(*id, container_dn).await
    }

    pub async fn unlink(&self, id: &GpoId, container_dn: &str) -> CoreResult<()> {
        self.links.unlink(*id, container_dn).await
    }

    pub async fn link_many(&self, id: &GpoId, container_dns: &[String]) -> CoreResult<Vec<String>> {
        self.links.link_many(*id, container_dns).await
    }

    pub async fn unlink_all(&self, id: &GpoId) -> CoreResult<Vec<String>> {
        self.links.unlink_all(*id).await
    }

    // ---- Scripts ----

    /// Add a script of the named kind (`Startup`, `Shutdown`, `Logon` or `Logoff`).
    pub async fn add_script(
        &self,
        id: &GpoId,
        kind: &str,
        content: Vec<u8>,
        parameters: &str,
    ) -> CoreResult<ScriptEntry> {
        let kind = ScriptKind::parse(kind)?;
        self.scripts
            .add_script(*id, kind, content, parameters.to_string())
            .await
    }

    pub async fn remove_script(&self, id: &GpoId, kind: &str, order: u32) -> CoreResult<ScriptEntry> {
        let kind = ScriptKind::parse(kind)?;
        self.scripts.remove_script(*id, kind, order).await
    }

    /// Remove a script by its file name rather than its order.
    pub async fn remove_script_by_path(&self, id: &GpoId, kind: &str, path: &str) -> CoreResult<ScriptEntry> {
        let kind = ScriptKind::parse(kind)?;
        self.scripts
            .remove_script_by_path(*id, kind, path.to_string())
            .await
    }

    pub async fn list_scripts(&self, id: &GpoId) -> CoreResult<GpoScripts> {
        self.directory.read_object(id).await?;
        match self.scripts.list_scripts(id).await {
            Err(CoreError::NotFound { .. }) => {
                Err(CoreError::inconsistent(id, "directory object has no template tree"))
            }
            other => other,
        }
    }

    // ---- Consistency ----

    /// Compare the directory and template versions of one GPO.
    ///
    /// Takes the GPO section just long enough to read both values, so an
    /// in-flight commit is never mistaken for drift.
    pub async fn verify(&self, id: &GpoId) -> CoreResult<VersionCheck> {
        let section = self.coordinator.acquire_unverified(id).await?;
        let record = section.record().clone();
        let template = self.templates.read_version(id).await;
        drop(section);

        let (template_version, error) = match template {
            Ok(version) => (Some(version.raw()), None),
            Err(e @ (CoreError::NotFound { .. } | CoreError::Inconsistent { .. })) => (None, Some(e.to_string())),
            Err(e) => return Err(e),
        };
        Ok(VersionCheck {
            id: *id,
            display_name: record.display_name,
            directory_version: record.version.raw(),
            template_version,
            degraded: self.coordinator.is_degraded(id),
            error,
        })
    }

    /// Verify every GPO and look for template trees without a directory object.
    pub async fn audit(&self) -> CoreResult<AuditReport> {
        let records = self.directory.list_objects().await?;
        let known: std::collections::HashSet<GpoId> = records.iter().map(|r| r.id).collect();

        let checks: Vec<CoreResult<VersionCheck>> = stream::iter(records.iter().map(|r| r.id).collect::<Vec<GpoId>>())
            .map(|id| async move { self.verify(&id).await })
            .buffer_unordered(AUDIT_CONCURRENCY)
            .collect()
            .await;

        let mut inconsistent = Vec::new();
        let mut checked = 0;
        for check in checks {
            match check {
                Ok(check) => {
                    checked += 1;
                    if !check.consistent() {
                        tracing::warn!(
                            gpo = %check.id,
                            directory_version = check.directory_version,
                            template_version = ?check.template_version,
                            degraded = check.degraded,
                            "GPO versions disagree"
                        );
                        inconsistent.push(check);
                    }
                }
                // Deleted while the audit ran.
                Err(CoreError::NotFound { .. }) => {}
                Err(e @ CoreError::Timeout { .. }) => {
                    tracing::warn!(error = %e, "Skipping busy GPO in audit");
                }
                Err(e) => return Err(e),
            }
        }
        inconsistent.sort_by_key(|c| c.id);

        let orphan_trees: Vec<GpoId> = self
            .templates
            .list_trees()
            .await?
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();
        for id in &orphan_trees {
            tracing::warn!(gpo = %id, "Template tree has no directory object");
        }

        Ok(AuditReport {
            checked,
            inconsistent,
            orphan_trees,
            audited_at: chrono::Utc::now(),
        })
    }

    /// Check every dependency. Never fails; problems are reported per component.
    pub async fn health_check(&self) -> HealthReport {
        let directory = probe(self.directory.ping()).await;
        let templates = probe(self.templates.ping()).await;
        let signer = match &self.signer {
            Some(signer) => probe(signer.ping()).await,
            None => ComponentHealth {
                configured: false,
                healthy: true,
                latency_ms: 0,
                error: None,
            },
        };
        HealthReport {
            healthy: directory.healthy && templates.healthy && signer.healthy,
            directory,
            templates,
            signer,
            checked_at: chrono::Utc::now(),
        }
    }
}

async fn probe(check: impl std::future::Future<Output = CoreResult<()>>) -> ComponentHealth {
    let start = std::time::Instant::now();
    let result = check.await;
    ComponentHealth {
        configured: true,
        healthy: result.is_ok(),
        latency_ms: start.elapsed().as_millis() as u64,
        error: result.err().map(|e| e.to_string()),
    }
}
