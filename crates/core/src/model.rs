//! Directory record and the assembled GPO view.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::script::GpoScripts;
use crate::types::{GpoId, Timestamp};
use crate::version::GpoVersion;

/// Value of `gPCFunctionalityVersion` on every GPO this engine creates.
pub const FUNCTIONALITY_VERSION: u32 = 2;

/// A GPO as stored in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpoRecord {
    pub id: GpoId,
    pub dn: String,
    pub display_name: String,
    pub file_sys_path: String,
    pub version: GpoVersion,
    pub user_extension_names: String,
    pub machine_extension_names: String,
    pub functionality_version: u32,
    pub flags: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Full view of a GPO assembled from both stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicyObject {
    pub id: GpoId,
    pub dn: String,
    pub display_name: String,
    pub file_sys_path: String,
    pub template_path: PathBuf,
    pub version: u32,
    pub machine_version: u16,
    pub user_version: u16,
    pub user_extension_names: String,
    pub machine_extension_names: String,
    pub functionality_version: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// DNs of the containers whose `gPLink` names this GPO.
    pub links: Vec<String>,
    pub scripts: GpoScripts,
}

impl GroupPolicyObject {
    pub fn assemble(
        record: GpoRecord,
        template_path: PathBuf,
        links: Vec<String>,
        scripts: GpoScripts,
    ) -> Self {
        Self {
            id: record.id,
            dn: record.dn,
            display_name: record.display_name,
            file_sys_path: record.file_sys_path,
            template_path,
            version: record.version.raw(),
            machine_version: record.version.machine,
            user_version: record.version.user,
            user_extension_names: record.user_extension_names,
            machine_extension_names: record.machine_extension_names,
            functionality_version: record.functionality_version,
            created_at: record.created_at,
            updated_at: record.updated_at,
            links,
            scripts,
        }
    }
}

static CSE_GROUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\[\]]*\]").expect("valid regex"));

/// Merge one `[{CSE}{TOOL}]` group into an extension-names attribute.
///
/// Groups are kept sorted case-insensitively, which is the order Windows
/// clients expect; an already present group leaves the value unchanged.
pub fn merge_extension_names(existing: &str, group: &str) -> String {
    let mut groups: Vec<String> = CSE_GROUP_RE
        .find_iter(existing)
        .map(|m| m.as_str().to_string())
        .collect();
    if groups.iter().any(|g| g.eq_ignore_ascii_case(group)) {
        return existing.trim().to_string();
    }
    groups.push(group.to_string());
    groups.sort_by_key(|g| g.to_ascii_uppercase());
    groups.concat()
}
