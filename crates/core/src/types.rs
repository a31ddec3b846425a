use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a Group Policy Object.
///
/// Accepts the GUID with or without braces in any case, and always renders
/// in the directory's canonical `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GpoId(Uuid);

impl GpoId {
    /// Allocate a fresh random identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse `{GUID}` or bare `GUID` text. Only the hyphenated form is accepted.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        let trimmed = value.trim();
        let inner = match trimmed.strip_prefix('{') {
            Some(rest) => rest.strip_suffix('}').ok_or_else(|| invalid_id(value))?,
            None if trimmed.ends_with('}') => return Err(invalid_id(value)),
            None => trimmed,
        };
        if inner.len() != 36 {
            return Err(invalid_id(value));
        }
        Uuid::parse_str(inner)
            .map(Self)
            .map_err(|_| invalid_id(value))
    }
}

fn invalid_id(value: &str) -> CoreError {
    CoreError::InvalidArgument(format!("Invalid GPO identifier: '{value}'"))
}

impl fmt::Display for GpoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:X}}}", self.0.hyphenated())
    }
}

impl FromStr for GpoId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for GpoId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<GpoId> for String {
    fn from(id: GpoId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const DEFAULT_DOMAIN_POLICY: &str = "{31B2F340-016D-11D2-945F-00C04FB984F9}";

    #[test]
    fn parses_braced_and_bare_forms() {
        let braced = GpoId::parse(DEFAULT_DOMAIN_POLICY).unwrap();
        let bare = GpoId::parse("31b2f340-016d-11d2-945f-00c04fb984f9").unwrap();
        assert_eq!(braced, bare);
    }

    #[test]
    fn displays_uppercase_with_braces() {
        let id = GpoId::parse("31b2f340-016d-11d2-945f-00c04fb984f9").unwrap();
        assert_eq!(id.to_string(), DEFAULT_DOMAIN_POLICY);
    }

    #[test]
    fn rejects_unbalanced_braces_and_simple_form() {
        assert_matches!(
            GpoId::parse("{31B2F340-016D-11D2-945F-00C04FB984F9"),
            Err(CoreError::InvalidArgument(_))
        );
        assert_matches!(
            GpoId::parse("31B2F340016D11D2945F00C04FB984F9"),
            Err(CoreError::InvalidArgument(_))
        );
        assert_matches!(GpoId::parse("; drop"), Err(CoreError::InvalidArgument(_)));
    }

    #[test]
    fn serde_uses_canonical_text() {
        let id = GpoId::parse(DEFAULT_DOMAIN_POLICY).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{DEFAULT_DOMAIN_POLICY}\""));
        let back: GpoId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
