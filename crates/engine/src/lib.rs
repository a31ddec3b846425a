//! GPO state synchronization engine.
//!
//! A GPO lives in two stores at once: its directory object (attributes,
//! `versionNumber`, container `gPLink` backlinks) and its template tree
//! (`GPT.INI` and the script folders). Everything here exists to keep the
//! two in lock-step.
//!
//! - [`coordinator`]: per-GPO and per-container exclusive sections and the
//!   two-store version commit.
//! - [`links`]: add/remove a GPO in a container's `gPLink`.
//! - [`scripts`]: register and remove startup/shutdown/logon/logoff scripts.
//! - [`lifecycle`]: the [`GpoManager`] facade callers use.

pub mod config;
pub mod coordinator;
pub mod lifecycle;
pub mod links;
pub mod scripts;
pub mod signer;

pub use config::EngineConfig;
pub use coordinator::{ContainerSection, GpoSection, VersionCoordinator};
pub use lifecycle::{AuditReport, ComponentHealth, GpoManager, HealthReport, VersionCheck};
pub use links::LinkManager;
pub use scripts::ScriptEngine;
pub use signer::{OsslSigncodeSigner, ScriptSigner};
