//! `GPT.INI` codec: the template tree's copy of the version counter.

use crate::ini::IniDocument;
use crate::version::GpoVersion;

const GENERAL: &str = "General";
const VERSION_KEY: &str = "Version";
const DISPLAY_NAME_KEY: &str = "displayName";

/// Parsed `GPT.INI`. Keys other than `Version` and `displayName` survive a
/// rewrite untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptIni {
    doc: IniDocument,
    version: GpoVersion,
}

impl GptIni {
    pub fn new(version: GpoVersion, display_name: Option<&str>) -> Self {
        let mut doc = IniDocument::default();
        let general = doc.section_mut(GENERAL);
        general.set(VERSION_KEY, version.raw().to_string());
        if let Some(name) = display_name {
            general.set(DISPLAY_NAME_KEY, name);
        }
        Self { doc, version }
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let doc = IniDocument::parse(text);
        let raw = doc
            .section(GENERAL)
            .and_then(|s| s.get(VERSION_KEY))
            .ok_or_else(|| "missing [General] Version".to_string())?
            .trim();
        // Some writers store the counter as a signed 32-bit value.
        let version = match raw.parse::<u32>() {
            Ok(v) => v,
            Err(_) => raw
                .parse::<i32>()
                .map(|v| v as u32)
                .map_err(|_| format!("invalid Version '{raw}'"))?,
        };
        Ok(Self {
            doc,
            version: GpoVersion::from_raw(version),
        })
    }

    pub fn version(&self) -> GpoVersion {
        self.version
    }

    pub fn display_name(&self) -> Option<&str> {
        self.doc.section(GENERAL).and_then(|s| s.get(DISPLAY_NAME_KEY))
    }

    pub fn set_version(&mut self, version: GpoVersion) {
        self.doc
            .section_mut(GENERAL)
            .set(VERSION_KEY, version.raw().to_string());
        self.version = version;
    }

    pub fn render(&self) -> String {
        self.doc.render()
    }
}
