//! Minimal LDIF reader and writer for talking to the `ldb*` tools.
//!
//! Covers what `ldbsearch` prints (comments, folded lines, `::` base64
//! values, `ref:` referrals) and the add/modify records `ldbadd` and
//! `ldbmodify` accept.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// One entry from search output. Attribute names keep the server's case;
/// lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdifEntry {
    pub dn: String,
    pub attrs: Vec<(String, String)>,
}

impl LdifEntry {
    pub fn first(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse search output into entries. Referrals and comments are skipped.
pub fn parse(text: &str) -> Result<Vec<LdifEntry>, String> {
    let mut entries = Vec::new();
    let mut current: Option<LdifEntry> = None;

    for line in unfold(text) {
        if line.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let (name, value) = split_attr(&line)?;
        if name.eq_ignore_ascii_case("dn") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(LdifEntry {
                dn: value,
                attrs: Vec::new(),
            });
        } else if name.eq_ignore_ascii_case("ref") || name.eq_ignore_ascii_case("version") {
            continue;
        } else {
            match current.as_mut() {
                Some(entry) => entry.attrs.push((name, value)),
                None => return Err(format!("attribute '{name}' before any dn line")),
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    Ok(entries)
}

/// Join continuation lines (leading single space) onto their parent.
fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        match (raw.strip_prefix(' '), lines.last_mut()) {
            (Some(rest), Some(prev)) if !prev.is_empty() => prev.push_str(rest),
            _ => lines.push(raw.to_string()),
        }
    }
    lines
}

fn split_attr(line: &str) -> Result<(String, String), String> {
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| format!("malformed LDIF line: {line}"))?;
    let value = if let Some(encoded) = rest.strip_prefix(':') {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("bad base64 in '{name}': {e}"))?;
        String::from_utf8(bytes).map_err(|e| format!("non-UTF-8 value in '{name}': {e}"))?
    } else {
        rest.strip_prefix(' ').unwrap_or(rest).to_string()
    };
    Ok((name.to_string(), value))
}

/// Whether `value` can be written as a plain `name: value` line.
fn is_safe(value: &str) -> bool {
    let Some(first) = value.bytes().next() else {
        return true;
    };
    if matches!(first, b' ' | b':' | b'<') || value.ends_with(' ') {
        return false;
    }
    value
        .bytes()
        .all(|b| b.is_ascii() && b != b'\0' && b != b'\n' && b != b'\r')
}

/// Render one `name: value` line, base64-encoding when required.
pub fn attr_line(name: &str, value: &str) -> String {
    if is_safe(value) {
        format!("{name}: {value}\n")
    } else {
        format!("{name}:: {}\n", STANDARD.encode(value.as_bytes()))
    }
}

/// Modify operation within a `changetype: modify` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Replace all values; an empty list deletes the attribute.
    Replace(String, Vec<String>),
}

pub fn add_record(dn: &str, attrs: &[(&str, String)]) -> String {
    let mut out = attr_line("dn", dn);
    out.push_str("changetype: add\n");
    for (name, value) in attrs {
        out.push_str(&attr_line(name, value));
    }
    out
}

pub fn modify_record(dn: &str, mods: &[Modification]) -> String {
    let mut out = attr_line("dn", dn);
    out.push_str("changetype: modify\n");
    for (i, m) in mods.iter().enumerate() {
        if i > 0 {
            out.push_str("-\n");
        }
        match m {
            Modification::Replace(name, values) => {
                out.push_str(&format!("replace: {name}\n"));
                for value in values {
                    out.push_str(&attr_line(name, value));
                }
            }
        }
    }
    out
}

/// Join records with the blank line LDIF requires between them.
pub fn join_records(records: &[String]) -> String {
    records.join("\n")
}

/// Escape a value for use inside an LDAP search filter (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            other => out.push(other),
        }
    }
    out
}
