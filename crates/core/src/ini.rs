//! Minimal INI codec for the policy template files (`GPT.INI`, `psscripts.ini`).
//!
//! Section and key order is preserved so a rewrite only changes what the
//! caller changed. Lines are emitted with CRLF endings.

use crate::error::CoreError;

/// One `[Section]` and its `key=value` entries in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl IniSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Case-insensitive key lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first entry for `key`, or append one.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IniDocument {
    pub sections: Vec<IniSection>,
}

impl IniDocument {
    /// Parse INI text. Entries appearing before the first section header
    /// and comment lines (`;` or `#`) are dropped.
    ///
    /// Keys are trimmed; values are kept exactly as written after the `=`.
    pub fn parse(text: &str) -> Self {
        let mut sections: Vec<IniSection> = Vec::new();
        for raw in text.lines() {
            let raw = raw.strip_suffix('\r').unwrap_or(raw);
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.push(IniSection::new(name.trim()));
                continue;
            }
            let Some(current) = sections.last_mut() else {
                continue;
            };
            match raw.split_once('=') {
                Some((key, value)) => current
                    .entries
                    .push((key.trim().to_string(), value.to_string())),
                None => current.entries.push((line.to_string(), String::new())),
            }
        }
        Self { sections }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push_str("\r\n");
            }
            out.push('[');
            out.push_str(&section.name);
            out.push_str("]\r\n");
            for (key, value) in &section.entries {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push_str("\r\n");
            }
        }
        out
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn section_mut(&mut self, name: &str) -> &mut IniSection {
        let index = match self
            .sections
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
        {
            Some(index) => index,
            None => {
                self.sections.push(IniSection::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[index]
    }
}

/// Reject values that cannot be stored on one INI line.
///
/// A line break would end the entry early and turn the rest into new keys
/// or sections; NUL truncates the value for most readers.
pub fn check_value(field: &str, value: &str) -> Result<(), CoreError> {
    match value.chars().find(|c| matches!(c, '\r' | '\n' | '\0')) {
        Some(c) => Err(CoreError::InvalidArgument(format!(
            "{field} must not contain control character {c:?}"
        ))),
        None => Ok(()),
    }
}

/// Decode file bytes as UTF-16LE (with BOM) or UTF-8 (BOM optional).
///
/// Windows tooling writes `psscripts.ini` as UTF-16LE, Samba tooling as UTF-8.
pub fn decode(bytes: &[u8]) -> Result<String, String> {
    if let Some(body) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        if body.len() % 2 != 0 {
            return Err("odd byte count in UTF-16 file".to_string());
        }
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16(&units).map_err(|e| e.to_string());
    }
    let body = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    String::from_utf8(body.to_vec()).map_err(|e| e.to_string())
}

/// Encode text as UTF-16LE with a byte-order mark.
pub fn encode_utf16le(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + text.len() * 2);
    out.extend_from_slice(&[0xFF, 0xFE]);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}
