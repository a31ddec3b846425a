//! Distinguished-name helpers for GPO and container objects.

use crate::error::CoreError;
use crate::types::GpoId;

/// Split a DN into `(attribute, value)` pairs on unescaped commas.
fn split_rdns(dn: &str) -> Option<Vec<(String, String)>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in dn.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' => {
                current.push(c);
                escaped = true;
            }
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .map(|rdn| {
            let (attr, value) = rdn.split_once('=')?;
            let attr = attr.trim();
            let value = value.trim();
            let valid_attr = attr.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
            (valid_attr && !value.is_empty()).then(|| (attr.to_string(), value.to_string()))
        })
        .collect()
}

/// Check that `dn` is a well-formed container reference.
///
/// The DN must parse into `attr=value` components, end in the domain
/// (`DC=` components) and must not contain the `[`, `]` or `;` characters
/// that delimit `gPLink` entries.
pub fn validate_container_dn(dn: &str) -> Result<(), CoreError> {
    let invalid = |why: &str| CoreError::InvalidArgument(format!("Malformed container DN '{dn}': {why}"));

    if dn.trim().is_empty() {
        return Err(invalid("empty"));
    }
    if dn.contains(['[', ']', ';']) {
        return Err(invalid("contains a gPLink delimiter"));
    }
    let rdns = split_rdns(dn).ok_or_else(|| invalid("every component must be attr=value"))?;
    if !rdns.last().is_some_and(|(attr, _)| attr.eq_ignore_ascii_case("DC")) {
        return Err(invalid("must end with the domain's DC= components"));
    }
    Ok(())
}

/// Canonical comparison key: lowercase, whitespace around separators removed.
pub fn normalize(dn: &str) -> String {
    match split_rdns(dn) {
        Some(rdns) => rdns
            .iter()
            .map(|(a, v)| format!("{}={}", a.to_ascii_lowercase(), v.to_lowercase()))
            .collect::<Vec<_>>()
            .join(","),
        None => dn.trim().to_lowercase(),
    }
}

pub fn same_dn(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// `CN=Policies,CN=System,<domain>`.
pub fn policies_dn(domain_dn: &str) -> String {
    format!("CN=Policies,CN=System,{domain_dn}")
}

pub fn gpo_dn(id: &GpoId, domain_dn: &str) -> String {
    format!("CN={id},{}", policies_dn(domain_dn))
}

/// Extract the GPO identifier from the leading `CN={GUID}` component.
pub fn gpo_id_from_dn(dn: &str) -> Option<GpoId> {
    let rdns = split_rdns(dn)?;
    let (attr, value) = rdns.first()?;
    if !attr.eq_ignore_ascii_case("CN") {
        return None;
    }
    GpoId::parse(value).ok()
}

/// `DC=example,DC=com` -> `example.com`.
pub fn realm_from_domain_dn(domain_dn: &str) -> String {
    split_rdns(domain_dn)
        .unwrap_or_default()
        .into_iter()
        .filter(|(attr, _)| attr.eq_ignore_ascii_case("DC"))
        .map(|(_, value)| value.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

/// UNC path published in `gPCFileSysPath`.
pub fn file_sys_path(realm: &str, id: &GpoId) -> String {
    format!(r"\\{realm}\sysvol\{realm}\Policies\{id}")
}
