//! Directory backend driving Samba's `ldbsearch`/`ldbadd`/`ldbmodify`/`ldbdel`.
//!
//! Every call is one tool invocation. Changes are fed as LDIF on stdin and
//! search results come back as LDIF on stdout. Credentials, when configured,
//! are passed as `-U <user>` with the password in the `PASSWD` environment
//! variable so they never show up in the process list.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use soon_core::dn;
use soon_core::error::{CoreError, CoreResult};
use soon_core::gplink::ContainerLinks;
use soon_core::model::{GpoRecord, FUNCTIONALITY_VERSION};
use soon_core::process::{run_tool, ToolCommand, ToolError, ToolOutput};
use soon_core::script::Scope;
use soon_core::types::{GpoId, Timestamp};
use soon_core::version::GpoVersion;

use crate::ldif::{self, LdifEntry, Modification};
use crate::{DirectoryStore, VersionWrite};

const GPO_ATTRS: &[&str] = &[
    "name",
    "displayName",
    "gPCFileSysPath",
    "versionNumber",
    "gPCUserExtensionNames",
    "gPCMachineExtensionNames",
    "gPCFunctionalityVersion",
    "flags",
    "whenCreated",
    "whenChanged",
];

const GPO_FILTER: &str = "(objectClass=groupPolicyContainer)";

/// Connection settings for the `ldb*` tools.
#[derive(Debug, Clone)]
pub struct LdbConfig {
    /// `-H` argument: a `sam.ldb` path or an `ldap://` URL.
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Directory holding the tools; `None` resolves them from `PATH`.
    pub tools_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub domain_dn: String,
}

#[derive(Debug, Clone, Copy)]
enum SearchScope {
    Base,
    One,
    Sub,
}

impl SearchScope {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::One => "one",
            Self::Sub => "sub",
        }
    }
}

pub struct LdbDirectory {
    config: LdbConfig,
    realm: String,
}

impl LdbDirectory {
    pub fn new(config: LdbConfig) -> Self {
        let realm = dn::realm_from_domain_dn(&config.domain_dn);
        Self { config, realm }
    }

    fn tool(&self, name: &str) -> ToolCommand {
        let program = match &self.config.tools_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        let mut cmd = ToolCommand::new(program, self.config.timeout).args(["-H", self.config.url.as_str()]);
        if let Some(user) = &self.config.user {
            cmd = cmd.args(["-U", user.as_str()]);
            if let Some(password) = &self.config.password {
                cmd = cmd.env("PASSWD", password.as_str());
            }
        }
        cmd
    }

    /// Run a tool; `Ok(Err(output))` carries a non-zero exit for the caller to classify.
    async fn exec(&self, cmd: ToolCommand, what: &str) -> CoreResult<Result<ToolOutput, ToolOutput>> {
        let program = cmd.program.display().to_string();
        match run_tool(cmd).await {
            Ok(out) if out.success() => {
                tracing::debug!(%program, duration_ms = out.duration_ms, "{what} succeeded");
                Ok(Ok(out))
            }
            Ok(out) => {
                tracing::debug!(%program, exit_code = out.exit_code, stderr = %out.stderr.trim(), "{what} failed");
                Ok(Err(out))
            }
            Err(ToolError::Timeout { elapsed_ms }) => Err(CoreError::Timeout {
                what: format!("{what} ({program})"),
                waited_ms: elapsed_ms,
            }),
            Err(e) => Err(CoreError::unavailable(what, e)),
        }
    }

    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[&str],
    ) -> CoreResult<Option<Vec<LdifEntry>>> {
        let cmd = self
            .tool("ldbsearch")
            .args(["-b", base, "-s", scope.as_arg(), filter])
            .args(attrs.iter().copied());
        match self.exec(cmd, "ldbsearch").await? {
            Ok(out) => ldif::parse(&out.stdout_lossy())
                .map(Some)
                .map_err(|e| CoreError::unavailable("Unreadable ldbsearch output", e)),
            Err(out) if is_no_such_object(&out) => Ok(None),
            Err(out) => Err(tool_failure("ldbsearch", &out)),
        }
    }

    async fn apply(&self, tool: &str, ldif_text: String) -> CoreResult<Result<(), ToolOutput>> {
        let cmd = self.tool(tool).stdin(ldif_text.into_bytes());
        Ok(self.exec(cmd, tool).await?.map(|_| ()))
    }

    fn record_from_entry(&self, entry: &LdifEntry) -> CoreResult<GpoRecord> {
        let malformed = |why: &str| {
            CoreError::StoreUnavailable(format!("Malformed GPO entry {}: {why}", entry.dn))
        };
        let id = entry
            .first("name")
            .and_then(|n| GpoId::parse(n).ok())
            .or_else(|| dn::gpo_id_from_dn(&entry.dn))
            .ok_or_else(|| malformed("no GUID name"))?;
        let raw_version = match entry.first("versionNumber") {
            Some(v) => v
                .trim()
                .parse::<i64>()
                .map_err(|_| malformed("versionNumber is not a number"))?,
            None => 0,
        };
        let created_at = entry.first("whenCreated").and_then(parse_generalized_time);
        let updated_at = entry.first("whenChanged").and_then(parse_generalized_time);
        let now = chrono::Utc::now();

        Ok(GpoRecord {
            id,
            dn: entry.dn.clone(),
            display_name: entry.first("displayName").unwrap_or_default().to_string(),
            file_sys_path: entry
                .first("gPCFileSysPath")
                .map(str::to_string)
                .unwrap_or_else(|| dn::file_sys_path(&self.realm, &id)),
            // The attribute is a signed 32-bit integer on the wire.
            version: GpoVersion::from_raw(raw_version as u32),
            user_extension_names: entry
                .first("gPCUserExtensionNames")
                .unwrap_or_default()
                .to_string(),
            machine_extension_names: entry
                .first("gPCMachineExtensionNames")
                .unwrap_or_default()
                .to_string(),
            functionality_version: entry
                .first("gPCFunctionalityVersion")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(FUNCTIONALITY_VERSION),
            flags: entry
                .first("flags")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            created_at: created_at.unwrap_or(now),
            updated_at: updated_at.or(created_at).unwrap_or(now),
        })
    }

    async fn search_gpos(&self, filter: &str) -> CoreResult<Vec<GpoRecord>> {
        let base = dn::policies_dn(&self.config.domain_dn);
        let entries = self
            .search(&base, SearchScope::One, filter, GPO_ATTRS)
            .await?
            .ok_or_else(|| CoreError::StoreUnavailable(format!("Policies container {base} is missing")))?;
        entries.iter().map(|e| self.record_from_entry(e)).collect()
    }
}

fn is_no_such_object(out: &ToolOutput) -> bool {
    let text = format!("{}\n{}", out.stderr, out.stdout_lossy()).to_ascii_lowercase();
    text.contains("no such object") || text.contains("no_such_object") || text.contains("no such base dn")
}

fn already_exists(out: &ToolOutput) -> bool {
    let text = out.stderr.to_ascii_lowercase();
    text.contains("already exists") || text.contains("entry_already_exists")
}

fn tool_failure(tool: &str, out: &ToolOutput) -> CoreError {
    CoreError::StoreUnavailable(format!(
        "{tool} exited with {}: {}",
        out.exit_code,
        out.stderr.trim()
    ))
}

/// Parse LDAP GeneralizedTime, e.g. `20240131120000.0Z`.
fn parse_generalized_time(value: &str) -> Option<Timestamp> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S%.fZ")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%SZ"))
        .ok()
        .map(|t| t.and_utc())
}

#[async_trait]
impl DirectoryStore for LdbDirectory {
    fn domain_dn(&self) -> &str {
        &self.config.domain_dn
    }

    async fn create_object(&self, display_name: &str) -> CoreResult<GpoRecord> {
        if self.find_by_display_name(display_name).await?.is_some() {
            return Err(CoreError::Conflict(format!(
                "A GPO named '{display_name}' already exists"
            )));
        }

        let id = GpoId::new_random();
        let gpo_dn = dn::gpo_dn(&id, &self.config.domain_dn);
        let records = [
            ldif::add_record(
                &gpo_dn,
                &[
                    ("objectClass", "groupPolicyContainer".to_string()),
                    ("displayName", display_name.to_string()),
                    ("gPCFileSysPath", dn::file_sys_path(&self.realm, &id)),
                    ("versionNumber", "0".to_string()),
                    ("gPCFunctionalityVersion", FUNCTIONALITY_VERSION.to_string()),
                    ("flags", "0".to_string()),
                ],
            ),
            ldif::add_record(
                &format!("CN=User,{gpo_dn}"),
                &[("objectClass", "container".to_string())],
            ),
            ldif::add_record(
                &format!("CN=Machine,{gpo_dn}"),
                &[("objectClass", "container".to_string())],
            ),
        ];

        if let Err(out) = self.apply("ldbadd", ldif::join_records(&records)).await? {
            // ldbadd stops at the first failing record; clear whatever landed.
            if let Err(e) = self.delete_dns(&gpo_dn).await {
                tracing::warn!(gpo = %id, error = %e, "Cleanup after failed ldbadd failed");
            }
            return Err(if already_exists(&out) {
                CoreError::Conflict(format!("GPO object {gpo_dn} already exists"))
            } else {
                tool_failure("ldbadd", &out)
            });
        }

        tracing::info!(gpo = %id, display_name, "GPO object created");
        self.read_object(&id).await
    }

    async fn read_object(&self, id: &GpoId) -> CoreResult<GpoRecord> {
        let gpo_dn = dn::gpo_dn(id, &self.config.domain_dn);
        let entries = self
            .search(&gpo_dn, SearchScope::Base, GPO_FILTER, GPO_ATTRS)
            .await?
            .unwrap_or_default();
        match entries.first() {
            Some(entry) => self.record_from_entry(entry),
            None => Err(CoreError::not_found("GPO", id)),
        }
    }

    async fn find_by_display_name(&self, display_name: &str) -> CoreResult<Option<GpoRecord>> {
        let filter = format!(
            "(&{GPO_FILTER}(displayName={}))",
            ldif::escape_filter_value(display_name)
        );
        Ok(self.search_gpos(&filter).await?.into_iter().next())
    }

    async fn list_objects(&self) -> CoreResult<Vec<GpoRecord>> {
        self.search_gpos(GPO_FILTER).await
    }

    async fn delete_object(&self, id: &GpoId) -> CoreResult<()> {
        self.read_object(id).await?;
        let gpo_dn = dn::gpo_dn(id, &self.config.domain_dn);
        self.delete_dns(&gpo_dn).await?;
        tracing::info!(gpo = %id, "GPO object deleted");
        Ok(())
    }

    async fn write_version(&self, id: &GpoId, write: &VersionWrite) -> CoreResult<()> {
        let gpo_dn = dn::gpo_dn(id, &self.config.domain_dn);
        let mut mods = vec![Modification::Replace(
            "versionNumber".into(),
            vec![write.version.raw().to_string()],
        )];
        if let Some((scope, names)) = &write.extension_names {
            let attr = match scope {
                Scope::Machine => "gPCMachineExtensionNames",
                Scope::User => "gPCUserExtensionNames",
            };
            mods.push(Modification::Replace(attr.into(), vec![names.clone()]));
        }

        match self.apply("ldbmodify", ldif::modify_record(&gpo_dn, &mods)).await? {
            Ok(()) => Ok(()),
            Err(out) if is_no_such_object(&out) => Err(CoreError::not_found("GPO", id)),
            Err(out) => Err(tool_failure("ldbmodify", &out)),
        }
    }

    async fn read_container_links(&self, container_dn: &str) -> CoreResult<ContainerLinks> {
        let entries = self
            .search(container_dn, SearchScope::Base, "(objectClass=*)", &["gPLink"])
            .await?
            .unwrap_or_default();
        let entry = entries
            .first()
            .ok_or_else(|| CoreError::not_found("container", container_dn))?;
        ContainerLinks::parse(entry.first("gPLink").unwrap_or_default()).map_err(|e| {
            CoreError::StoreUnavailable(format!("Malformed gPLink on {container_dn}: {e}"))
        })
    }

    async fn write_container_links(
        &self,
        container_dn: &str,
        links: &ContainerLinks,
    ) -> CoreResult<()> {
        let values = if links.is_empty() {
            Vec::new()
        } else {
            vec![links.render()]
        };
        let record = ldif::modify_record(container_dn, &[Modification::Replace("gPLink".into(), values)]);
        match self.apply("ldbmodify", record).await? {
            Ok(()) => Ok(()),
            Err(out) if is_no_such_object(&out) => Err(CoreError::not_found("container", container_dn)),
            Err(out) => Err(tool_failure("ldbmodify", &out)),
        }
    }

    async fn linked_containers(&self, id: &GpoId) -> CoreResult<Vec<String>> {
        let gpo_dn = dn::gpo_dn(id, &self.config.domain_dn);
        let filter = format!("(gPLink=*{}*)", ldif::escape_filter_value(&gpo_dn));
        let entries = self
            .search(&self.config.domain_dn, SearchScope::Sub, &filter, &["gPLink"])
            .await?
            .unwrap_or_default();

        let mut linked = Vec::new();
        for entry in entries {
            let links = ContainerLinks::parse(entry.first("gPLink").unwrap_or_default())
                .map_err(|e| CoreError::StoreUnavailable(format!("Malformed gPLink on {}: {e}", entry.dn)))?;
            if links.contains(id) {
                linked.push(entry.dn);
            }
        }
        linked.sort();
        Ok(linked)
    }

    async fn ping(&self) -> CoreResult<()> {
        self.search(&self.config.domain_dn, SearchScope::Base, "(objectClass=*)", &["dn"])
            .await?
            .map(|_| ())
            .ok_or_else(|| {
                CoreError::StoreUnavailable(format!(
                    "Domain {} not present at {}",
                    self.config.domain_dn, self.config.url
                ))
            })
    }
}

impl LdbDirectory {
    /// Delete a GPO object and its `User`/`Machine` children, children first.
    async fn delete_dns(&self, gpo_dn: &str) -> CoreResult<()> {
        for target in [
            format!("CN=User,{gpo_dn}"),
            format!("CN=Machine,{gpo_dn}"),
            gpo_dn.to_string(),
        ] {
            let cmd = self.tool("ldbdel").arg(target.as_str());
            match self.exec(cmd, "ldbdel").await? {
                Ok(_) => {}
                Err(out) if is_no_such_object(&out) => {}
                Err(out) => return Err(tool_failure("ldbdel", &out)),
            }
        }
        Ok(())
    }
}
