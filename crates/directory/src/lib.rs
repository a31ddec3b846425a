//! Directory Object Store: GPO objects and container `gPLink` attributes.
//!
//! [`DirectoryStore`] is the seam the engine talks through. Two backends
//! ship here: [`MemoryDirectory`] for embedding and tests, and
//! [`LdbDirectory`] which drives Samba's `ldb*` command-line tools.

use async_trait::async_trait;
use soon_core::error::CoreResult;
use soon_core::gplink::ContainerLinks;
use soon_core::model::GpoRecord;
use soon_core::script::Scope;
use soon_core::types::GpoId;
use soon_core::version::GpoVersion;

pub mod ldb;
pub mod ldif;
pub mod memory;

pub use ldb::{LdbConfig, LdbDirectory};
pub use memory::MemoryDirectory;

/// A version commit for one GPO object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionWrite {
    pub version: GpoVersion,
    /// New extension-names value for one scope, when it changes.
    pub extension_names: Option<(Scope, String)>,
}

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Naming context all DNs live under, e.g. `DC=example,DC=com`.
    fn domain_dn(&self) -> &str;

    /// Create a GPO object with version 0 and a freshly allocated identifier.
    ///
    /// Fails with `Conflict` if another GPO already has `display_name`.
    async fn create_object(&self, display_name: &str) -> CoreResult<GpoRecord>;

    async fn read_object(&self, id: &GpoId) -> CoreResult<GpoRecord>;

    async fn find_by_display_name(&self, display_name: &str) -> CoreResult<Option<GpoRecord>>;

    async fn list_objects(&self) -> CoreResult<Vec<GpoRecord>>;

    /// Remove the GPO object. Link checks are the caller's job.
    async fn delete_object(&self, id: &GpoId) -> CoreResult<()>;

    async fn write_version(&self, id: &GpoId, write: &VersionWrite) -> CoreResult<()>;

    /// Fails with `NotFound` if the container does not exist.
    async fn read_container_links(&self, container_dn: &str) -> CoreResult<ContainerLinks>;

    /// Replace the container's whole link list.
    async fn write_container_links(&self, container_dn: &str, links: &ContainerLinks)
        -> CoreResult<()>;

    /// DNs of every container whose `gPLink` names `id`.
    async fn linked_containers(&self, id: &GpoId) -> CoreResult<Vec<String>>;

    async fn ping(&self) -> CoreResult<()>;
}
