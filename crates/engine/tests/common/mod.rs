#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use soon_core::error::{CoreError, CoreResult};
use soon_core::gplink::ContainerLinks;
use soon_core::gpt::GptIni;
use soon_core::model::GpoRecord;
use soon_core::script::{Scope, ScriptIndex, ScriptKind};
use soon_core::types::GpoId;
use soon_core::version::GpoVersion;
use soon_directory::{DirectoryStore, MemoryDirectory, VersionWrite};
use soon_engine::{GpoManager, ScriptSigner};
use soon_sysvol::{DetachedTree, FsTemplateStore, TemplateStore};
use tempfile::TempDir;

pub const DOMAIN: &str = "DC=example,DC=com";
pub const OU_TEST: &str = "OU=Test,DC=example,DC=com";
pub const OU_OTHER: &str = "OU=Other,DC=example,DC=com";

fn injected(what: &str) -> CoreError {
    CoreError::StoreUnavailable(format!("injected failure: {what}"))
}

fn trip(flag: &AtomicBool, what: &str) -> CoreResult<()> {
    if flag.load(Ordering::SeqCst) {
        Err(injected(what))
    } else {
        Ok(())
    }
}

// ---- Directory ----

/// In-memory directory with switchable failures.
pub struct FlakyDirectory {
    pub inner: MemoryDirectory,
    pub fail_write_version: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_write_links: AtomicBool,
    pub fail_ping: AtomicBool,
}

impl FlakyDirectory {
    pub fn new() -> Self {
        Self {
            inner: MemoryDirectory::new(DOMAIN),
            fail_write_version: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_write_links: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DirectoryStore for FlakyDirectory {
    fn domain_dn(&self) -> &str {
        self.inner.domain_dn()
    }

    async fn create_object(&self, display_name: &str) -> CoreResult<GpoRecord> {
        self.inner.create_object(display_name).await
    }

    async fn read_object(&self, id: &GpoId) -> CoreResult<GpoRecord> {
        self.inner.read_object(id).await
    }

    async fn find_by_display_name(&self, display_name: &str) -> CoreResult<Option<GpoRecord>> {
        self.inner.find_by_display_name(display_name).await
    }

    async fn list_objects(&self) -> CoreResult<Vec<GpoRecord>> {
        self.inner.list_objects().await
    }

    async fn delete_object(&self, id: &GpoId) -> CoreResult<()> {
        trip(&self.fail_delete, "delete_object")?;
        self.inner.delete_object(id).await
    }

    async fn write_version(&self, id: &GpoId, write: &VersionWrite) -> CoreResult<()> {
        trip(&self.fail_write_version, "write_version")?;
        self.inner.write_version(id, write).await
    }

    async fn read_container_links(&self, container_dn: &str) -> CoreResult<ContainerLinks> {
        self.inner.read_container_links(container_dn).await
    }

    async fn write_container_links(&self, container_dn: &str, links: &ContainerLinks) -> CoreResult<()> {
        trip(&self.fail_write_links, "write_container_links")?;
        self.inner.write_container_links(container_dn, links).await
    }

    async fn linked_containers(&self, id: &GpoId) -> CoreResult<Vec<String>> {
        self.inner.linked_containers(id).await
    }

    async fn ping(&self) -> CoreResult<()> {
        trip(&self.fail_ping, "ping")?;
        self.inner.ping().await
    }
}

// ---- Template tree ----

/// Filesystem template store with switchable failures.
pub struct FlakyTemplates {
    pub inner: FsTemplateStore,
    pub fail_create_tree: AtomicBool,
    pub fail_write_scripts: AtomicBool,
    /// Remaining `write_config` calls that succeed; `usize::MAX` means no limit.
    pub config_writes_left: AtomicUsize,
}

impl FlakyTemplates {
    pub fn new(root: PathBuf) -> Self {
        Self {
            inner: FsTemplateStore::new(root),
            fail_create_tree: AtomicBool::new(false),
            fail_write_scripts: AtomicBool::new(false),
            config_writes_left: AtomicUsize::new(usize::MAX),
        }
    }
}

#[async_trait]
impl TemplateStore for FlakyTemplates {
    fn template_path(&self, id: &GpoId) -> PathBuf {
        self.inner.template_path(id)
    }

    fn script_folder(&self, id: &GpoId, kind: ScriptKind) -> PathBuf {
        self.inner.script_folder(id, kind)
    }

    async fn create_tree(&self, id: &GpoId, display_name: Option<&str>) -> CoreResult<()> {
        trip(&self.fail_create_tree, "create_tree")?;
        self.inner.create_tree(id, display_name).await
    }

    async fn read_config(&self, id: &GpoId) -> CoreResult<GptIni> {
        self.inner.read_config(id).await
    }

    async fn write_config(&self, id: &GpoId, version: GpoVersion) -> CoreResult<()> {
        let allowed = self
            .config_writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok();
        if !allowed {
            return Err(injected("write_config"));
        }
        self.inner.write_config(id, version).await
    }

    async fn read_scripts(&self, id: &GpoId, scope: Scope) -> CoreResult<ScriptIndex> {
        self.inner.read_scripts(id, scope).await
    }

    async fn write_scripts(&self, id: &GpoId, index: &ScriptIndex) -> CoreResult<()> {
        trip(&self.fail_write_scripts, "write_scripts")?;
        self.inner.write_scripts(id, index).await
    }

    async fn write_script_file(
        &self,
        id: &GpoId,
        kind: ScriptKind,
        preferred_name: &str,
        content: &[u8],
    ) -> CoreResult<String> {
        self.inner.write_script_file(id, kind, preferred_name, content).await
    }

    async fn remove_script_file(&self, id: &GpoId, kind: ScriptKind, name: &str) -> CoreResult<()> {
        self.inner.remove_script_file(id, kind, name).await
    }

    async fn delete_tree(&self, id: &GpoId) -> CoreResult<()> {
        self.inner.delete_tree(id).await
    }

    async fn detach_tree(&self, id: &GpoId) -> CoreResult<DetachedTree> {
        self.inner.detach_tree(id).await
    }

    async fn restore_tree(&self, detached: &DetachedTree) -> CoreResult<()> {
        self.inner.restore_tree(detached).await
    }

    async fn purge_tree(&self, detached: &DetachedTree) -> CoreResult<()> {
        self.inner.purge_tree(detached).await
    }

    async fn list_trees(&self) -> CoreResult<Vec<GpoId>> {
        self.inner.list_trees().await
    }

    async fn ping(&self) -> CoreResult<()> {
        self.inner.ping().await
    }
}

// ---- Signer ----

pub const SIGNATURE_BLOCK: &str = "\r\n# SIG # Begin signature block\r\n";

/// Appends a fake signature block, or refuses when `fail` is set.
pub struct StubSigner {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl StubSigner {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ScriptSigner for StubSigner {
    async fn sign(&self, content: &[u8]) -> CoreResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::SigningFailed("certificate expired".into()));
        }
        let mut signed = content.to_vec();
        signed.extend_from_slice(SIGNATURE_BLOCK.as_bytes());
        Ok(signed)
    }

    async fn ping(&self) -> CoreResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(CoreError::SigningFailed("signer unreachable".into()))
        } else {
            Ok(())
        }
    }
}

// ---- Environment ----

pub struct TestEnv {
    pub root: TempDir,
    pub directory: Arc<FlakyDirectory>,
    pub templates: Arc<FlakyTemplates>,
    pub signer: Option<Arc<StubSigner>>,
    pub manager: GpoManager,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::build(None, Duration::from_secs(10)).await
    }

    pub async fn with_signer() -> Self {
        Self::build(Some(Arc::new(StubSigner::new())), Duration::from_secs(10)).await
    }

    async fn build(signer: Option<Arc<StubSigner>>, section_timeout: Duration) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let directory = Arc::new(FlakyDirectory::new());
        directory.inner.add_container(OU_TEST).await.expect("add OU=Test");
        directory.inner.add_container(OU_OTHER).await.expect("add OU=Other");
        let templates = Arc::new(FlakyTemplates::new(root.path().to_path_buf()));
        let manager = GpoManager::new(
            directory.clone(),
            templates.clone(),
            signer.clone().map(|s| s as Arc<dyn ScriptSigner>),
            section_timeout,
        );
        Self {
            root,
            directory,
            templates,
            signer,
            manager,
        }
    }

    /// Directory and template versions of `id`.
    pub async fn versions(&self, id: &GpoId) -> (GpoVersion, GpoVersion) {
        let record = self.directory.read_object(id).await.expect("directory object");
        let template = self.templates.read_version(id).await.expect("template version");
        (record.version, template)
    }

    /// Panics unless both stores agree; returns the shared version.
    pub async fn assert_consistent(&self, id: &GpoId) -> GpoVersion {
        let (directory, template) = self.versions(id).await;
        assert_eq!(directory, template, "directory and template versions differ");
        directory
    }

    /// Names of the files in a script folder, sorted.
    pub fn script_files(&self, id: &GpoId, kind: ScriptKind) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.templates.script_folder(id, kind))
            .expect("script folder")
            .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    /// Number of entries under the template root, hidden ones included.
    pub fn root_entries(&self) -> usize {
        std::fs::read_dir(self.root.path()).expect("template root").count()
    }
}
