use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use soon_core::dn;
use soon_core::error::{CoreError, CoreResult};
use soon_directory::LdbConfig;

use crate::signer::OsslSigncodeSigner;

/// Characters allowed in the directory bind user name.
static BIND_USER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._@\\$-]{1,256}$").expect("valid regex"));

/// Engine configuration loaded from environment variables.
///
/// Defaults target a local Samba domain controller.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub domain_dn: String,
    /// DNS realm used in `gPCFileSysPath`.
    pub realm: String,
    /// The sysvol `Policies` folder.
    pub template_root: PathBuf,
    pub ldb_url: String,
    pub ldb_user: Option<String>,
    pub ldb_password: Option<String>,
    pub ldb_tools_dir: Option<PathBuf>,
    /// PKCS#12 signing key; `None` stores scripts unsigned.
    pub signer_pkcs12: Option<PathBuf>,
    pub signer_password: Option<String>,
    pub signer_bin: PathBuf,
    /// Bounded wait to acquire a GPO or container section.
    pub section_timeout: Duration,
    pub subprocess_timeout: Duration,
    /// Worker audit period; zero runs one audit and exits.
    pub audit_interval: Duration,
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                                  |
    /// |--------------------------------|------------------------------------------|
    /// | `SOON_DOMAIN_DN`               | `DC=example,DC=com`                      |
    /// | `SOON_REALM`                   | derived from the domain DN               |
    /// | `SOON_TEMPLATE_ROOT`           | `/var/lib/samba/sysvol/<realm>/Policies` |
    /// | `SOON_LDB_URL`                 | `ldap://127.0.0.1`                       |
    /// | `SOON_LDB_USER`                | unset                                    |
    /// | `SOON_LDB_PASSWORD`            | unset                                    |
    /// | `SOON_LDB_TOOLS_DIR`           | unset (`PATH`)                           |
    /// | `SOON_SIGNER_PKCS12`           | unset (signing disabled)                 |
    /// | `SOON_SIGNER_PASSWORD`         | unset                                    |
    /// | `SOON_SIGNER_BIN`              | `osslsigncode`                           |
    /// | `SOON_SECTION_TIMEOUT_SECS`    | `30`                                     |
    /// | `SOON_SUBPROCESS_TIMEOUT_SECS` | `60`                                     |
    /// | `SOON_AUDIT_INTERVAL_SECS`     | `300`                                    |
    ///
    /// Panics on invalid values; use [`EngineConfig::try_from_env`] to handle them.
    pub fn from_env() -> Self {
        Self::try_from_env().unwrap_or_else(|e| panic!("Invalid engine configuration: {e}"))
    }

    pub fn try_from_env() -> CoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CoreResult<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str, default: u64| -> CoreResult<Duration> {
            match get(key) {
                Some(raw) => raw.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                    CoreError::InvalidArgument(format!("{key} must be a whole number of seconds, got '{raw}'"))
                }),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let domain_dn = get("SOON_DOMAIN_DN").unwrap_or_else(|| "DC=example,DC=com".into());
        dn::validate_container_dn(&domain_dn)
            .map_err(|e| CoreError::InvalidArgument(format!("SOON_DOMAIN_DN: {e}")))?;
        let realm = get("SOON_REALM").unwrap_or_else(|| dn::realm_from_domain_dn(&domain_dn));
        let template_root = get("SOON_TEMPLATE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/var/lib/samba/sysvol/{realm}/Policies")));

        let ldb_user = get("SOON_LDB_USER");
        if let Some(user) = &ldb_user {
            if !BIND_USER_RE.is_match(user) {
                return Err(CoreError::InvalidArgument(format!(
                    "SOON_LDB_USER contains unsupported characters: '{user}'"
                )));
            }
        }

        let section_timeout = secs("SOON_SECTION_TIMEOUT_SECS", 30)?;
        if section_timeout.is_zero() {
            return Err(CoreError::InvalidArgument(
                "SOON_SECTION_TIMEOUT_SECS must be greater than zero".into(),
            ));
        }

        Ok(Self {
            domain_dn,
            realm,
            template_root,
            ldb_url: get("SOON_LDB_URL").unwrap_or_else(|| "ldap://127.0.0.1".into()),
            ldb_user,
            ldb_password: get("SOON_LDB_PASSWORD"),
            ldb_tools_dir: get("SOON_LDB_TOOLS_DIR").map(PathBuf::from),
            signer_pkcs12: get("SOON_SIGNER_PKCS12").map(PathBuf::from),
            signer_password: get("SOON_SIGNER_PASSWORD"),
            signer_bin: get("SOON_SIGNER_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("osslsigncode")),
            section_timeout,
            subprocess_timeout: secs("SOON_SUBPROCESS_TIMEOUT_SECS", 60)?,
            audit_interval: secs("SOON_AUDIT_INTERVAL_SECS", 300)?,
        })
    }

    pub fn ldb_config(&self) -> LdbConfig {
        LdbConfig {
            url: self.ldb_url.clone(),
            user: self.ldb_user.clone(),
            password: self.ldb_password.clone(),
            tools_dir: self.ldb_tools_dir.clone(),
            timeout: self.subprocess_timeout,
            domain_dn: self.domain_dn.clone(),
        }
    }

    /// The configured signer, if a signing key is set.
    pub fn signer(&self) -> Option<OsslSigncodeSigner> {
        self.signer_pkcs12.as_ref().map(|key| {
            OsslSigncodeSigner::new(
                self.signer_bin.clone(),
                key.clone(),
                self.signer_password.clone(),
                self.subprocess_timeout,
            )
        })
    }
}
