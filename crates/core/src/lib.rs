//! Domain model shared by the GPO stores and engine.
//!
//! Identifiers, error kinds, version arithmetic and the codecs for `gPLink`,
//! `GPT.INI` and `psscripts.ini`. The only I/O is the [`process`] runner used
//! by store adapters that drive external tools.

pub mod dn;
pub mod error;
pub mod gplink;
pub mod gpt;
pub mod ini;
pub mod model;
pub mod process;
pub mod script;
pub mod types;
pub mod version;
