//! Confirmation realms
//!
//! A realm scopes which confirmations count as equivalent. The global realm is
//! shared by every form, so an address confirmed once is pre-confirmed for new
//! submissions; a per-submission realm never shares confirmation state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state::SubmissionId;
use crate::OptInError;

/// Realm shared across all forms
pub const GLOBAL_REALM: &str = "webform_double_opt_in";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfirmationRealm(String);

impl ConfirmationRealm {
    pub fn global() -> Self {
        Self(GLOBAL_REALM.to_string())
    }

    /// Realm scoped to a single submission: `webform_double_opt_in_<id>`
    pub fn for_submission(id: &SubmissionId) -> Result<Self, OptInError> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(OptInError::InvalidRealmState(raw.to_string()));
        }
        Ok(Self(format!("{GLOBAL_REALM}_{raw}")))
    }

    /// Pick the realm for a submission according to the global opt-in flag
    pub fn resolve(opt_in_globally: bool, id: &SubmissionId) -> Result<Self, OptInError> {
        if opt_in_globally {
            Ok(Self::global())
        } else {
            Self::for_submission(id)
        }
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_REALM
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfirmationRealm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
