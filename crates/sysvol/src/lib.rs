//! Template Tree Store: the per-GPO folder under the sysvol `Policies` root.
//!
//! Layout of one tree:
//!
//! ```text
//! {GUID}/
//!   GPT.INI
//!   Machine/Scripts/psscripts.ini
//!   Machine/Scripts/{Startup,Shutdown}/
//!   User/Scripts/psscripts.ini
//!   User/Scripts/{Logon,Logoff}/
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use soon_core::error::CoreResult;
use soon_core::gpt::GptIni;
use soon_core::script::{Scope, ScriptIndex, ScriptKind};
use soon_core::types::GpoId;
use soon_core::version::GpoVersion;

pub mod fs;

pub use fs::FsTemplateStore;

pub const GPT_INI: &str = "GPT.INI";
pub const SCRIPTS_DIR: &str = "Scripts";
pub const SCRIPT_INDEX: &str = "psscripts.ini";

/// A tree moved aside by [`TemplateStore::detach_tree`], pending purge or restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedTree {
    pub id: GpoId,
    pub path: PathBuf,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Root folder of the GPO's tree.
    fn template_path(&self, id: &GpoId) -> PathBuf;

    /// Folder holding the script files of `kind`.
    fn script_folder(&self, id: &GpoId, kind: ScriptKind) -> PathBuf;

    /// Create the full tree with `GPT.INI` at version 0. `Conflict` if present.
    async fn create_tree(&self, id: &GpoId, display_name: Option<&str>) -> CoreResult<()>;

    async fn read_config(&self, id: &GpoId) -> CoreResult<GptIni>;

    async fn read_version(&self, id: &GpoId) -> CoreResult<GpoVersion> {
        Ok(self.read_config(id).await?.version())
    }

    /// Atomically replace the version in `GPT.INI`, keeping its other keys.
    async fn write_config(&self, id: &GpoId, version: GpoVersion) -> CoreResult<()>;

    async fn read_scripts(&self, id: &GpoId, scope: Scope) -> CoreResult<ScriptIndex>;

    /// Atomically replace the scope's `psscripts.ini`.
    async fn write_scripts(&self, id: &GpoId, index: &ScriptIndex) -> CoreResult<()>;

    /// Write a new script file, never overwriting. Returns the file name used,
    /// which differs from `preferred_name` when that name is taken.
    async fn write_script_file(
        &self,
        id: &GpoId,
        kind: ScriptKind,
        preferred_name: &str,
        content: &[u8],
    ) -> CoreResult<String>;

    /// Remove a script file. A file that is already gone is not an error.
    async fn remove_script_file(&self, id: &GpoId, kind: ScriptKind, name: &str) -> CoreResult<()>;

    /// Remove the whole tree. `NotFound` if absent.
    async fn delete_tree(&self, id: &GpoId) -> CoreResult<()>;

    /// Move the tree out of the way in one rename. `NotFound` if absent.
    async fn detach_tree(&self, id: &GpoId) -> CoreResult<DetachedTree>;

    /// Put a detached tree back at its original place.
    async fn restore_tree(&self, detached: &DetachedTree) -> CoreResult<()>;

    /// Remove a detached tree for good.
    async fn purge_tree(&self, detached: &DetachedTree) -> CoreResult<()>;

    /// Identifiers of every tree under the root.
    async fn list_trees(&self) -> CoreResult<Vec<GpoId>>;

    async fn ping(&self) -> CoreResult<()>;
}
