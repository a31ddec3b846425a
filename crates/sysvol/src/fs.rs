//! Filesystem-backed template trees.
//!
//! Every file replacement goes through a temp file in the same folder and a
//! rename, so a reader sees either the old or the new content. Whole-tree
//! create and delete also happen by rename: trees are built in a hidden
//! staging folder and removed by first moving them aside.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use soon_core::error::{CoreError, CoreResult};
use soon_core::gpt::GptIni;
use soon_core::ini;
use soon_core::script::{Scope, ScriptIndex, ScriptKind};
use soon_core::types::GpoId;
use soon_core::version::GpoVersion;
use tokio::io::AsyncWriteExt;

use crate::{DetachedTree, TemplateStore, GPT_INI, SCRIPTS_DIR, SCRIPT_INDEX};

/// Attempts at finding a free script file name before giving up.
const MAX_NAME_ATTEMPTS: usize = 8;

pub struct FsTemplateStore {
    root: PathBuf,
}

impl FsTemplateStore {
    /// `root` is the `Policies` folder; it must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scripts_dir(&self, id: &GpoId, scope: Scope) -> PathBuf {
        self.template_path(id).join(scope.folder()).join(SCRIPTS_DIR)
    }

    /// Path of the tree, or `NotFound` when it does not exist.
    async fn require_tree(&self, id: &GpoId) -> CoreResult<PathBuf> {
        let path = self.template_path(id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => Err(CoreError::inconsistent(id, format!("{} is not a folder", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CoreError::not_found("template tree", id)),
            Err(e) => Err(io_error("Cannot stat", &path, e)),
        }
    }

    async fn build_tree(&self, staging: &Path, display_name: Option<&str>) -> std::io::Result<()> {
        for scope in Scope::ALL {
            let scripts = staging.join(scope.folder()).join(SCRIPTS_DIR);
            for kind in scope.kinds() {
                tokio::fs::create_dir_all(scripts.join(kind.as_str())).await?;
            }
            let index = ScriptIndex::empty(scope).render();
            write_atomic(&scripts.join(SCRIPT_INDEX), &ini::encode_utf16le(&index)).await?;
        }
        let gpt = GptIni::new(GpoVersion::INITIAL, display_name);
        write_atomic(&staging.join(GPT_INI), gpt.render().as_bytes()).await
    }
}

fn io_error(context: &str, path: &Path, err: std::io::Error) -> CoreError {
    CoreError::StoreUnavailable(format!("{context} {}: {err}", path.display()))
}

fn short_suffix() -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(8);
    s
}

/// Reject anything that is not a bare file name.
fn check_file_name(name: &str) -> CoreResult<()> {
    let bare = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.starts_with('.');
    if bare {
        Ok(())
    } else {
        Err(CoreError::InvalidArgument(format!("Invalid script file name '{name}'")))
    }
}

/// Candidate name for attempt `n`: `script0.ps1`, then `script0-1a2b3c4d.ps1`, ...
fn candidate_name(preferred: &str, attempt: usize) -> String {
    if attempt == 0 {
        return preferred.to_string();
    }
    let path = Path::new(preferred);
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    match path.extension() {
        Some(ext) => format!("{stem}-{}.{}", short_suffix(), ext.to_string_lossy()),
        None => format!("{stem}-{}", short_suffix()),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.tmp", short_suffix()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

async fn read_optional(path: &Path) -> CoreResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("Cannot read", path, e)),
    }
}

#[async_trait]
impl TemplateStore for FsTemplateStore {
    fn template_path(&self, id: &GpoId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn script_folder(&self, id: &GpoId, kind: ScriptKind) -> PathBuf {
        self.scripts_dir(id, kind.scope()).join(kind.as_str())
    }

    async fn create_tree(&self, id: &GpoId, display_name: Option<&str>) -> CoreResult<()> {
        self.ping().await?;
        let target = self.template_path(id);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(CoreError::Conflict(format!(
                "Template tree {} already exists",
                target.display()
            )));
        }

        let staging = self.root.join(format!(".staging-{id}-{}", short_suffix()));
        let built = match self.build_tree(&staging, display_name).await {
            Ok(()) => tokio::fs::rename(&staging, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = built {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                return Err(CoreError::Conflict(format!(
                    "Template tree {} already exists",
                    target.display()
                )));
            }
            return Err(io_error("Cannot create template tree", &target, e));
        }

        tracing::debug!(gpo = %id, path = %target.display(), "Template tree created");
        Ok(())
    }

    async fn read_config(&self, id: &GpoId) -> CoreResult<GptIni> {
        let tree = self.require_tree(id).await?;
        let path = tree.join(GPT_INI);
        let bytes = read_optional(&path)
            .await?
            .ok_or_else(|| CoreError::inconsistent(id, "GPT.INI is missing"))?;
        let text = ini::decode(&bytes)
            .map_err(|e| CoreError::inconsistent(id, format!("GPT.INI is unreadable: {e}")))?;
        GptIni::parse(&text).map_err(|e| CoreError::inconsistent(id, format!("GPT.INI: {e}")))
    }

    async fn write_config(&self, id: &GpoId, version: GpoVersion) -> CoreResult<()> {
        let mut gpt = self.read_config(id).await?;
        gpt.set_version(version);
        let path = self.template_path(id).join(GPT_INI);
        write_atomic(&path, gpt.render().as_bytes())
            .await
            .map_err(|e| io_error("Cannot write", &path, e))
    }

    async fn read_scripts(&self, id: &GpoId, scope: Scope) -> CoreResult<ScriptIndex> {
        self.require_tree(id).await?;
        let path = self.scripts_dir(id, scope).join(SCRIPT_INDEX);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(ScriptIndex::empty(scope));
        };
        let text = ini::decode(&bytes)
            .map_err(|e| CoreError::inconsistent(id, format!("{scope} {SCRIPT_INDEX} is unreadable: {e}")))?;
        ScriptIndex::parse(scope, &text)
            .map_err(|e| CoreError::inconsistent(id, format!("{scope} {SCRIPT_INDEX}: {e}")))
    }

    async fn write_scripts(&self, id: &GpoId, index: &ScriptIndex) -> CoreResult<()> {
        self.require_tree(id).await?;
        let dir = self.scripts_dir(id, index.scope());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("Cannot create", &dir, e))?;
        let path = dir.join(SCRIPT_INDEX);
        write_atomic(&path, &ini::encode_utf16le(&index.render()))
            .await
            .map_err(|e| io_error("Cannot write", &path, e))
    }

    async fn write_script_file(
        &self,
        id: &GpoId,
        kind: ScriptKind,
        preferred_name: &str,
        content: &[u8],
    ) -> CoreResult<String> {
        check_file_name(preferred_name)?;
        self.require_tree(id).await?;
        let folder = self.script_folder(id, kind);
        tokio::fs::create_dir_all(&folder)
            .await
            .map_err(|e| io_error("Cannot create", &folder, e))?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = candidate_name(preferred_name, attempt);
            let path = folder.join(&name);
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(io_error("Cannot create", &path, e)),
            };

            let written = async {
                file.write_all(content).await?;
                file.sync_all().await
            }
            .await;
            if let Err(e) = written {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(io_error("Cannot write", &path, e));
            }
            return Ok(name);
        }

        Err(CoreError::Conflict(format!(
            "No free file name for '{preferred_name}' in {}",
            folder.display()
        )))
    }

    async fn remove_script_file(&self, id: &GpoId, kind: ScriptKind, name: &str) -> CoreResult<()> {
        check_file_name(name)?;
        let path = self.script_folder(id, kind).join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("Cannot remove", &path, e)),
        }
    }

    async fn delete_tree(&self, id: &GpoId) -> CoreResult<()> {
        let detached = self.detach_tree(id).await?;
        self.purge_tree(&detached).await
    }

    async fn detach_tree(&self, id: &GpoId) -> CoreResult<DetachedTree> {
        let tree = self.require_tree(id).await?;
        let aside = self.root.join(format!(".deleted-{id}-{}", short_suffix()));
        tokio::fs::rename(&tree, &aside)
            .await
            .map_err(|e| io_error("Cannot move aside", &tree, e))?;
        Ok(DetachedTree { id: *id, path: aside })
    }

    async fn restore_tree(&self, detached: &DetachedTree) -> CoreResult<()> {
        let target = self.template_path(&detached.id);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(CoreError::Conflict(format!(
                "Cannot restore over existing tree {}",
                target.display()
            )));
        }
        tokio::fs::rename(&detached.path, &target)
            .await
            .map_err(|e| io_error("Cannot restore", &target, e))
    }

    async fn purge_tree(&self, detached: &DetachedTree) -> CoreResult<()> {
        match tokio::fs::remove_dir_all(&detached.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("Cannot remove", &detached.path, e)),
        }
    }

    async fn list_trees(&self) -> CoreResult<Vec<GpoId>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error("Cannot list", &self.root, e))?;
        let mut ids = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_error("Cannot list", &self.root, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if let (true, Ok(id)) = (is_dir, GpoId::parse(name)) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn ping(&self) -> CoreResult<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(CoreError::StoreUnavailable(format!(
                "Template root {} is not a folder",
                self.root.display()
            ))),
            Err(e) => Err(io_error("Template root unavailable", &self.root, e)),
        }
    }
}

// ---- Tests ----
