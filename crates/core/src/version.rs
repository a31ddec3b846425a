//! GPO version counter arithmetic.
//!
//! The 32-bit `versionNumber` is split into a machine half (high 16 bits)
//! and a user half (low 16 bits). Each half only ever moves forward.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::script::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpoVersion {
    pub machine: u16,
    pub user: u16,
}

impl GpoVersion {
    pub const INITIAL: GpoVersion = GpoVersion { machine: 0, user: 0 };

    pub fn from_raw(raw: u32) -> Self {
        Self {
            machine: (raw >> 16) as u16,
            user: (raw & 0xFFFF) as u16,
        }
    }

    pub fn raw(self) -> u32 {
        (u32::from(self.machine) << 16) | u32::from(self.user)
    }

    /// Return the version with the half belonging to `scope` incremented.
    ///
    /// A half that has reached `u16::MAX` cannot move forward without
    /// wrapping, which clients would read as an older policy.
    pub fn bumped(self, scope: Scope) -> Result<Self, CoreError> {
        let exhausted = || CoreError::Conflict(format!("{scope} version counter exhausted"));
        match scope {
            Scope::Machine => Ok(Self {
                machine: self.machine.checked_add(1).ok_or_else(exhausted)?,
                ..self
            }),
            Scope::User => Ok(Self {
                user: self.user.checked_add(1).ok_or_else(exhausted)?,
                ..self
            }),
        }
    }
}

impl std::fmt::Display for GpoVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (machine {}, user {})", self.raw(), self.machine, self.user)
    }
}
