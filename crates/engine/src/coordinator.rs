//! Version Coordinator: exclusive sections and the two-store version commit.
//!
//! Every mutation of a GPO runs inside a [`GpoSection`]. Sections are keyed
//! by GPO, so unrelated GPOs never contend. Container link lists are shared
//! between GPOs and get their own [`ContainerSection`], which can only be
//! taken from inside a GPO section. The lock order is therefore always
//! GPO, then container.
//!
//! A commit writes `GPT.INI` first and `versionNumber` second. A reader of the
//! directory never sees a version the template tree does not yet reflect.
//! If the directory write fails the template is put back; if that also fails
//! the GPO is marked degraded and every later section on it is refused with
//! `Inconsistent` until the process restarts.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use soon_core::dn;
use soon_core::error::{CoreError, CoreResult};
use soon_core::model::{merge_extension_names, GpoRecord};
use soon_core::script::Scope;
use soon_core::types::GpoId;
use soon_core::version::GpoVersion;
use soon_directory::{DirectoryStore, VersionWrite};
use soon_sysvol::TemplateStore;
use tokio::sync::OwnedMutexGuard;

/// Registry size above which idle entries are pruned on the next acquire.
const PRUNE_THRESHOLD: usize = 256;

/// Named async mutexes, created on first use.
#[derive(Default)]
struct SectionRegistry {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SectionRegistry {
    async fn lock(&self, key: String, timeout: Duration, what: &str) -> CoreResult<OwnedMutexGuard<()>> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > PRUNE_THRESHOLD {
                // Only the registry holds an idle entry.
                locks.retain(|_, m| Arc::strong_count(m) > 1);
            }
            locks.entry(key).or_default().clone()
        };

        let start = Instant::now();
        tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| CoreError::Timeout {
                what: what.to_string(),
                waited_ms: start.elapsed().as_millis() as u64,
            })
    }
}

struct Shared {
    gpo_locks: SectionRegistry,
    container_locks: SectionRegistry,
    degraded: Mutex<HashSet<GpoId>>,
}

/// Hands out sections and commits version bumps across both stores.
///
/// Cheap to clone; clones share the same sections.
#[derive(Clone)]
pub struct VersionCoordinator {
    directory: Arc<dyn DirectoryStore>,
    templates: Arc<dyn TemplateStore>,
    shared: Arc<Shared>,
    timeout: Duration,
}

impl VersionCoordinator {
    pub fn new(
        directory: Arc<dyn DirectoryStore>,
        templates: Arc<dyn TemplateStore>,
        section_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            templates,
            shared: Arc::new(Shared {
                gpo_locks: SectionRegistry::default(),
                container_locks: SectionRegistry::default(),
                degraded: Mutex::new(HashSet::new()),
            }),
            timeout: section_timeout,
        }
    }

    pub fn directory(&self) -> &Arc<dyn DirectoryStore> {
        &self.directory
    }

    pub fn templates(&self) -> &Arc<dyn TemplateStore> {
        &self.templates
    }

    pub fn is_degraded(&self, id: &GpoId) -> bool {
        self.shared
            .degraded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn mark_degraded(&self, id: &GpoId) {
        self.shared
            .degraded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*id);
    }

    /// Drop any degraded mark, e.g. once the GPO is gone.
    pub(crate) fn forget(&self, id: &GpoId) {
        self.shared
            .degraded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    async fn lock_gpo(&self, id: &GpoId) -> CoreResult<(OwnedMutexGuard<()>, GpoRecord)> {
        let guard = self
            .shared
            .gpo_locks
            .lock(id.to_string(), self.timeout, &format!("GPO {id}"))
            .await?;
        tracing::debug!(gpo = %id, "GPO section acquired");
        let record = self.directory.read_object(id).await?;
        Ok((guard, record))
    }

    /// Enter the GPO's exclusive section after checking that both stores
    /// agree on its version.
    pub async fn acquire(&self, id: &GpoId) -> CoreResult<GpoSection> {
        let (guard, record) = self.lock_gpo(id).await?;
        if self.is_degraded(id) {
            return Err(CoreError::inconsistent(
                id,
                "marked degraded after a failed commit rollback",
            ));
        }
        let template_version = self.templates.read_version(id).await?;
        if template_version != record.version {
            return Err(CoreError::inconsistent(
                id,
                format!(
                    "directory version {} does not match template version {}",
                    record.version.raw(),
                    template_version.raw()
                ),
            ));
        }
        Ok(self.section(guard, record))
    }

    /// Enter the section without the version self-check. For operations
    /// that must work on a GPO whose stores already disagree (delete, verify).
    pub async fn acquire_unverified(&self, id: &GpoId) -> CoreResult<GpoSection> {
        let (guard, record) = self.lock_gpo(id).await?;
        Ok(self.section(guard, record))
    }

    fn section(&self, guard: OwnedMutexGuard<()>, record: GpoRecord) -> GpoSection {
        GpoSection {
            coordinator: self.clone(),
            version: record.version,
            record,
            _guard: guard,
        }
    }

    /// Run `op` inside the GPO's verified section.
    ///
    /// Acquisition happens in the caller's task, so abandoning the call while
    /// waiting is harmless. Once acquired, `op` runs on its own task and
    /// always finishes; a caller that goes away just never sees the result.
    pub async fn with_section<T, F, Fut>(&self, id: GpoId, op: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(GpoSection) -> Fut,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let section = self.acquire(&id).await?;
        run_detached(op(section)).await
    }

    /// [`with_section`](Self::with_section) without the version self-check.
    pub async fn with_unverified_section<T, F, Fut>(&self, id: GpoId, op: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(GpoSection) -> Fut,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let section = self.acquire_unverified(&id).await?;
        run_detached(op(section)).await
    }
}

/// Drive `fut` on its own task so that dropping the caller cannot cancel it.
pub(crate) async fn run_detached<T, Fut>(fut: Fut) -> CoreResult<T>
where
    T: Send + 'static,
    Fut: Future<Output = CoreResult<T>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| CoreError::StoreUnavailable(format!("Engine task failed: {e}")))?
}

/// Exclusive hold on one GPO. Released on drop.
pub struct GpoSection {
    coordinator: VersionCoordinator,
    record: GpoRecord,
    /// Version both stores held when the section was entered, or after the
    /// last commit.
    version: GpoVersion,
    _guard: OwnedMutexGuard<()>,
}

impl GpoSection {
    pub fn id(&self) -> GpoId {
        self.record.id
    }

    pub fn record(&self) -> &GpoRecord {
        &self.record
    }

    pub fn version(&self) -> GpoVersion {
        self.version
    }

    pub fn directory(&self) -> &Arc<dyn DirectoryStore> {
        &self.coordinator.directory
    }

    pub fn templates(&self) -> &Arc<dyn TemplateStore> {
        &self.coordinator.templates
    }

    /// Take the container's section, nested in this GPO section.
    pub async fn lock_container(&self, container_dn: &str) -> CoreResult<ContainerSection> {
        let guard = self
            .coordinator
            .shared
            .container_locks
            .lock(
                dn::normalize(container_dn),
                self.coordinator.timeout,
                &format!("container {container_dn}"),
            )
            .await?;
        tracing::debug!(gpo = %self.id(), container = container_dn, "Container section acquired");
        Ok(ContainerSection {
            dn: container_dn.to_string(),
            _guard: guard,
        })
    }

    /// Bump `scope`'s half-version in both stores.
    ///
    /// When `register_extension` is set, the scope's scripts extension group is
    /// merged into its extension-names attribute in the same directory write.
    pub async fn commit(&mut self, scope: Scope, register_extension: bool) -> CoreResult<GpoVersion> {
        let id = self.id();
        let previous = self.version;
        let next = previous.bumped(scope)?;

        let extension_names = register_extension
            .then(|| {
                let current = match scope {
                    Scope::Machine => &self.record.machine_extension_names,
                    Scope::User => &self.record.user_extension_names,
                };
                let merged = merge_extension_names(current, scope.script_extension_names());
                (merged != *current).then_some((scope, merged))
            })
            .flatten();

        let templates = self.coordinator.templates.clone();
        let directory = self.coordinator.directory.clone();

        templates.write_config(&id, next).await?;

        let write = VersionWrite {
            version: next,
            extension_names: extension_names.clone(),
        };
        if let Err(e) = directory.write_version(&id, &write).await {
            tracing::warn!(gpo = %id, error = %e, "Directory version write failed, rolling back template");
            if let Err(rollback) = templates.write_config(&id, previous).await {
                tracing::error!(
                    gpo = %id,
                    error = %rollback,
                    template_version = next.raw(),
                    directory_version = previous.raw(),
                    "Template rollback failed, GPO marked degraded"
                );
                self.coordinator.mark_degraded(&id);
                return Err(CoreError::inconsistent(
                    id,
                    format!("template left at {} after directory write failed: {e}", next.raw()),
                ));
            }
            return Err(e);
        }

        self.version = next;
        self.record.version = next;
        if let Some((scope, names)) = extension_names {
            match scope {
                Scope::Machine => self.record.machine_extension_names = names,
                Scope::User => self.record.user_extension_names = names,
            }
        }
        tracing::info!(
            gpo = %id,
            %scope,
            version = next.raw(),
            machine = next.machine,
            user = next.user,
            "Version committed"
        );
        Ok(next)
    }
}

impl std::fmt::Debug for GpoSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpoSection")
            .field("record", &self.record)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Drop for GpoSection {
    fn drop(&mut self) {
        tracing::debug!(gpo = %self.record.id, "GPO section released");
    }
}

/// Exclusive hold on one container's `gPLink`. Released on drop.
#[derive(Debug)]
pub struct ContainerSection {
    dn: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ContainerSection {
    fn drop(&mut self) {
        tracing::debug!(container = %self.dn, "Container section released");
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use soon_directory::MemoryDirectory;
    use soon_sysvol::FsTemplateStore;

    use super::*;

    const DOMAIN: &str = "DC=example,DC=com";

    struct Fixture {
        _root: tempfile::TempDir,
        directory: Arc<MemoryDirectory>,
        templates: Arc<FsTemplateStore>,
        coordinator: VersionCoordinator,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let directory = Arc::new(MemoryDirectory::new(DOMAIN));
        let templates = Arc::new(FsTemplateStore::new(root.path()));
        let coordinator = VersionCoordinator::new(directory.clone(), templates.clone(), timeout);
        Fixture {
            _root: root,
            directory,
            templates,
            coordinator,
        }
    }

    async fn new_gpo(f: &Fixture) -> GpoId {
        let record = f.directory.create_object("Test").await.unwrap();
        f.templates.create_tree(&record.id, None).await.unwrap();
        record.id
    }

    #[tokio::test]
    async fn commit_bumps_both_stores() {
        let f = fixture(Duration::from_secs(5));
        let id = new_gpo(&f).await;

        let mut section = f.coordinator.acquire(&id).await.unwrap();
        let version = section.commit(Scope::User, true).await.unwrap();
        drop(section);

        assert_eq!(version, GpoVersion { machine: 0, user: 1 });
        let record = f.directory.read_object(&id).await.unwrap();
        assert_eq!(record.version, version);
        assert_eq!(record.user_extension_names, Scope::User.script_extension_names());
        assert_eq!(f.templates.read_version(&id).await.unwrap(), version);
    }

    #[tokio::test]
    async fn acquire_detects_disagreement() {
        let f = fixture(Duration::from_secs(5));
        let id = new_gpo(&f).await;
        f.templates
            .write_config(&id, GpoVersion { machine: 3, user: 0 })
            .await
            .unwrap();

        assert_matches!(
            f.coordinator.acquire(&id).await,
            Err(CoreError::Inconsistent { .. })
        );
        assert!(f.coordinator.acquire_unverified(&id).await.is_ok());
    }

    #[tokio::test]
    async fn same_gpo_waits_and_times_out() {
        let f = fixture(Duration::from_millis(50));
        let id = new_gpo(&f).await;

        let held = f.coordinator.acquire(&id).await.unwrap();
        assert_matches!(f.coordinator.acquire(&id).await, Err(CoreError::Timeout { .. }));
        drop(held);
        assert!(f.coordinator.acquire(&id).await.is_ok());
    }

    #[tokio::test]
    async fn different_gpos_do_not_contend() {
        let f = fixture(Duration::from_millis(50));
        let a = new_gpo(&f).await;
        let b = f.directory.create_object("Other").await.unwrap().id;
        f.templates.create_tree(&b, None).await.unwrap();

        let _held = f.coordinator.acquire(&a).await.unwrap();
        assert!(f.coordinator.acquire(&b).await.is_ok());
    }

    #[tokio::test]
    async fn container_sections_serialize_across_gpos() {
        let f = fixture(Duration::from_millis(50));
        let a = new_gpo(&f).await;
        let b = f.directory.create_object("Other").await.unwrap().id;
        f.templates.create_tree(&b, None).await.unwrap();

        let section_a = f.coordinator.acquire(&a).await.unwrap();
        let section_b = f.coordinator.acquire(&b).await.unwrap();
        let _container = section_a.lock_container("OU=Test,DC=example,DC=com").await.unwrap();
        assert_matches!(
            section_b.lock_container("ou=test, dc=example, dc=com").await,
            Err(CoreError::Timeout { .. })
        );
        assert!(section_b.lock_container("OU=Other,DC=example,DC=com").await.is_ok());
    }

    #[tokio::test]
    async fn missing_gpo_is_not_found() {
        let f = fixture(Duration::from_secs(1));
        assert_matches!(
            f.coordinator.acquire(&GpoId::new_random()).await,
            Err(CoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn detached_op_finishes_after_caller_is_dropped() {
        let f = fixture(Duration::from_secs(5));
        let id = new_gpo(&f).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let coordinator = f.coordinator.clone();
        let call = tokio::spawn(async move {
            coordinator
                .with_section(id, |mut section| async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    section.commit(Scope::Machine, false).await
                })
                .await
        });
        started_rx.await.unwrap();
        call.abort();

        // The section is released only once the commit has landed.
        let section = f.coordinator.acquire(&id).await.unwrap();
        assert_eq!(section.version(), GpoVersion { machine: 1, user: 0 });
    }
}
