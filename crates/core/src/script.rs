//! Script kinds, scopes and the per-scope `psscripts.ini` index.
//!
//! The index lists scripts per kind as `<n>CmdLine` / `<n>Parameters` pairs.
//! `n` is the execution order and is kept contiguous from 0: removing an
//! entry shifts every later entry down by one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ini::{self, IniDocument, IniSection};

/// Machine or User half of a GPO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    Machine,
    User,
}

impl Scope {
    pub const ALL: [Scope; 2] = [Scope::Machine, Scope::User];

    /// Folder name under the template root.
    pub fn folder(self) -> &'static str {
        match self {
            Self::Machine => "Machine",
            Self::User => "User",
        }
    }

    pub fn kinds(self) -> [ScriptKind; 2] {
        match self {
            Self::Machine => [ScriptKind::Startup, ScriptKind::Shutdown],
            Self::User => [ScriptKind::Logon, ScriptKind::Logoff],
        }
    }

    /// Scripts client-side extension paired with its editor tool extension,
    /// as registered in `gPCMachineExtensionNames` / `gPCUserExtensionNames`.
    pub fn script_extension_names(self) -> &'static str {
        match self {
            Self::Machine => {
                "[{42B5FAAE-6536-11D2-AE5A-0000F87571E3}{40B6664F-4972-11D1-A7CA-0000F87571E3}]"
            }
            Self::User => {
                "[{42B5FAAE-6536-11D2-AE5A-0000F87571E3}{40B66650-4972-11D1-A7CA-0000F87571E3}]"
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder())
    }
}

/// When a script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScriptKind {
    Startup,
    Shutdown,
    Logon,
    Logoff,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 4] = [
        ScriptKind::Startup,
        ScriptKind::Shutdown,
        ScriptKind::Logon,
        ScriptKind::Logoff,
    ];

    /// Parse a kind name, case-insensitively. `Login` is accepted as an
    /// alias of `Logon`.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "startup" => Ok(Self::Startup),
            "shutdown" => Ok(Self::Shutdown),
            "logon" | "login" => Ok(Self::Logon),
            "logoff" => Ok(Self::Logoff),
            _ => Err(CoreError::InvalidArgument(format!(
                "Unknown script kind '{value}'. Must be one of: Startup, Shutdown, Logon, Logoff"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "Startup",
            Self::Shutdown => "Shutdown",
            Self::Logon => "Logon",
            Self::Logoff => "Logoff",
        }
    }

    pub fn scope(self) -> Scope {
        match self {
            Self::Startup | Self::Shutdown => Scope::Machine,
            Self::Logon | Self::Logoff => Scope::User,
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A script registered for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    /// File name inside the kind's script folder.
    pub path: String,
    pub parameters: String,
    /// 0-based execution order.
    pub order: u32,
}

/// All scripts of a GPO, grouped by kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpoScripts {
    pub startup: Vec<ScriptEntry>,
    pub shutdown: Vec<ScriptEntry>,
    pub logon: Vec<ScriptEntry>,
    pub logoff: Vec<ScriptEntry>,
}

impl GpoScripts {
    pub fn from_indexes(machine: &ScriptIndex, user: &ScriptIndex) -> Self {
        Self {
            startup: machine.entries(ScriptKind::Startup),
            shutdown: machine.entries(ScriptKind::Shutdown),
            logon: user.entries(ScriptKind::Logon),
            logoff: user.entries(ScriptKind::Logoff),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexedScript {
    path: String,
    parameters: String,
}

/// Parsed `psscripts.ini` for one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptIndex {
    scope: Scope,
    lists: BTreeMap<ScriptKind, Vec<IndexedScript>>,
    /// Sections that are not script kinds (e.g. `ScriptsConfig`), kept verbatim.
    other: Vec<IniSection>,
}

impl ScriptIndex {
    pub fn empty(scope: Scope) -> Self {
        Self {
            scope,
            lists: scope.kinds().into_iter().map(|k| (k, Vec::new())).collect(),
            other: Vec::new(),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Parse the index file text.
    ///
    /// Every `<n>CmdLine` must have a matching `<n>Parameters` and vice
    /// versa. Gaps in `n` (left by tools that do not compact) are closed,
    /// keeping relative order.
    pub fn parse(scope: Scope, text: &str) -> Result<Self, String> {
        let doc = IniDocument::parse(text);
        let mut index = Self::empty(scope);

        for section in doc.sections {
            let kind = match ScriptKind::parse(&section.name) {
                Ok(kind) if kind.scope() == scope => kind,
                Ok(kind) => {
                    return Err(format!("section [{kind}] does not belong to {scope} scripts"))
                }
                Err(_) => {
                    index.other.push(section);
                    continue;
                }
            };

            let mut slots: BTreeMap<u32, (Option<String>, Option<String>)> = BTreeMap::new();
            for (key, value) in section.entries {
                let digits = key.chars().take_while(char::is_ascii_digit).count();
                let Ok(n) = key[..digits].parse::<u32>() else {
                    continue;
                };
                let slot = slots.entry(n).or_default();
                match key[digits..].to_ascii_lowercase().as_str() {
                    "cmdline" => slot.0 = Some(value),
                    "parameters" => slot.1 = Some(value),
                    _ => {}
                }
            }

            let list = index.lists.entry(kind).or_default();
            for (n, slot) in slots {
                match slot {
                    (Some(path), Some(parameters)) => list.push(IndexedScript { path, parameters }),
                    (Some(_), None) => return Err(format!("[{kind}] {n}CmdLine has no {n}Parameters")),
                    (None, Some(_)) => return Err(format!("[{kind}] {n}Parameters has no {n}CmdLine")),
                    (None, None) => {}
                }
            }
        }

        Ok(index)
    }

    pub fn render(&self) -> String {
        let mut doc = IniDocument::default();
        for (kind, list) in &self.lists {
            if list.is_empty() {
                continue;
            }
            let section = doc.section_mut(kind.as_str());
            for (n, script) in list.iter().enumerate() {
                section.set(&format!("{n}CmdLine"), script.path.clone());
                section.set(&format!("{n}Parameters"), script.parameters.clone());
            }
        }
        doc.sections.extend(self.other.iter().cloned());
        doc.render()
    }

    pub fn entries(&self, kind: ScriptKind) -> Vec<ScriptEntry> {
        self.lists
            .get(&kind)
            .map(|list| {
                list.iter()
                    .enumerate()
                    .map(|(n, s)| ScriptEntry {
                        path: s.path.clone(),
                        parameters: s.parameters.clone(),
                        order: n as u32,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, kind: ScriptKind) -> usize {
        self.lists.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.lists.values().all(Vec::is_empty)
    }

    /// Whether any kind of this scope already uses `path` (case-insensitive).
    pub fn contains_path(&self, path: &str) -> bool {
        self.lists
            .values()
            .flatten()
            .any(|s| s.path.eq_ignore_ascii_case(path))
    }

    /// Order of the entry whose file name is `path`.
    pub fn find(&self, kind: ScriptKind, path: &str) -> Option<u32> {
        self.lists.get(&kind).and_then(|list| {
            list.iter()
                .position(|s| s.path.eq_ignore_ascii_case(path))
                .map(|n| n as u32)
        })
    }

    /// Append a script and return its order.
    pub fn push(&mut self, kind: ScriptKind, path: &str, parameters: &str) -> Result<u32, CoreError> {
        self.check_kind(kind)?;
        ini::check_value("script path", path)?;
        ini::check_value("script parameters", parameters)?;
        if self.contains_path(path) {
            return Err(CoreError::Conflict(format!(
                "Script '{path}' is already registered for {} scripts",
                self.scope
            )));
        }
        let list = self.lists.entry(kind).or_default();
        list.push(IndexedScript {
            path: path.to_string(),
            parameters: parameters.to_string(),
        });
        Ok((list.len() - 1) as u32)
    }

    /// Remove the entry at `order`, shifting later entries down.
    pub fn remove(&mut self, kind: ScriptKind, order: u32) -> Result<ScriptEntry, CoreError> {
        self.check_kind(kind)?;
        let list = self.lists.entry(kind).or_default();
        let index = order as usize;
        if index >= list.len() {
            return Err(CoreError::not_found("script", format!("{kind} #{order}")));
        }
        let removed = list.remove(index);
        Ok(ScriptEntry {
            path: removed.path,
            parameters: removed.parameters,
            order,
        })
    }

    fn check_kind(&self, kind: ScriptKind) -> Result<(), CoreError> {
        if kind.scope() == self.scope {
            Ok(())
        } else {
            Err(CoreError::InvalidArgument(format!(
                "{kind} scripts belong to the {} scope, not {}",
                kind.scope(),
                self.scope
            )))
        }
    }
}
