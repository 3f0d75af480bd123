//! Submission State Types
//!
//! Submission records, lifecycle states, resolved trigger states and the typed
//! opt-in status with its transition history.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::OptInError;

/// Reserved data key holding the opt-in status in legacy data bags
pub const OPT_IN_STATUS_FIELD: &str = "opt_in_status";

/// Opaque submission identifier, owned by the storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(String);

impl SubmissionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubmissionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<u64> for SubmissionId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Opt-in status
// ─────────────────────────────────────────────────────────────────────────────

/// Double opt-in status of a submission
///
/// Moves forward only: `PendingMail -> Pending -> Confirmed`. A failed dispatch
/// parks the submission in `DispatchFailed`, from which a new dispatch claim
/// moves it back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptInStatus {
    /// Confirmation e-mail not yet sent
    PendingMail,
    /// Confirmation e-mail sent, awaiting the recipient
    Pending,
    /// Recipient confirmed, now or previously under the same realm
    Confirmed,
    /// The confirmation delegate failed; eligible for another dispatch
    DispatchFailed,
}

impl OptInStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptInStatus::PendingMail => "pending_mail",
            OptInStatus::Pending => "pending",
            OptInStatus::Confirmed => "confirmed",
            OptInStatus::DispatchFailed => "dispatch_failed",
        }
    }

    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            OptInStatus::PendingMail => "Double opt-in confirmation mail pending",
            OptInStatus::Pending => "Double opt-in confirmation pending",
            OptInStatus::Confirmed => "Double opt-in confirmed",
            OptInStatus::DispatchFailed => "Double opt-in confirmation mail failed",
        }
    }

    /// Whether a confirmation request may be dispatched from this status
    pub fn is_dispatch_eligible(&self) -> bool {
        matches!(self, OptInStatus::PendingMail | OptInStatus::DispatchFailed)
    }

    /// Check a transition against the forward-only status graph
    pub fn can_transition_to(self, to: OptInStatus) -> bool {
        matches!(
            (self, to),
            (OptInStatus::PendingMail, OptInStatus::Pending)
                | (OptInStatus::Pending, OptInStatus::Confirmed)
                | (OptInStatus::Pending, OptInStatus::DispatchFailed)
                | (OptInStatus::DispatchFailed, OptInStatus::Pending)
        )
    }
}

impl fmt::Display for OptInStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for OptInStatus {
    type Error = OptInError;

    /// Accepts both the status keys and the labels stored in legacy data bags
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        [
            OptInStatus::PendingMail,
            OptInStatus::Pending,
            OptInStatus::Confirmed,
            OptInStatus::DispatchFailed,
        ]
        .into_iter()
        .find(|s| s.as_str() == value || s.label() == value)
        .ok_or_else(|| OptInError::InvalidStatus(value.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle and resolved states
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse submission status in the hosting form system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Draft,
    Converted,
    Completed,
    Updated,
    Deleted,
    Locked,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::Draft,
        LifecycleState::Converted,
        LifecycleState::Completed,
        LifecycleState::Updated,
        LifecycleState::Deleted,
        LifecycleState::Locked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Draft => "draft",
            LifecycleState::Converted => "converted",
            LifecycleState::Completed => "completed",
            LifecycleState::Updated => "updated",
            LifecycleState::Deleted => "deleted",
            LifecycleState::Locked => "locked",
        }
    }

    /// Label offered by trigger-state selection surfaces
    pub fn option_label(&self) -> &'static str {
        match self {
            LifecycleState::Draft => "…when draft is saved.",
            LifecycleState::Converted => "…when anonymous submission is converted to authenticated.",
            LifecycleState::Completed => "…when submission is completed.",
            LifecycleState::Updated => "…when submission is updated.",
            LifecycleState::Deleted => "…when submission is deleted.",
            LifecycleState::Locked => "…when submission is locked.",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == key)
    }
}

/// State a handler matches its trigger states against
///
/// Starts as the lifecycle state and may be replaced by state resolvers,
/// either with the synthetic `OptInConfirmed` or with a custom key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubmissionState {
    Lifecycle(LifecycleState),
    OptInConfirmed,
    Custom(String),
}

impl SubmissionState {
    pub const OPT_IN_CONFIRMED_KEY: &'static str = "opt_in_confirmed";

    pub fn key(&self) -> &str {
        match self {
            SubmissionState::Lifecycle(state) => state.as_str(),
            SubmissionState::OptInConfirmed => Self::OPT_IN_CONFIRMED_KEY,
            SubmissionState::Custom(key) => key,
        }
    }

    pub fn is_lifecycle(&self, state: LifecycleState) -> bool {
        *self == SubmissionState::Lifecycle(state)
    }
}

impl From<LifecycleState> for SubmissionState {
    fn from(state: LifecycleState) -> Self {
        SubmissionState::Lifecycle(state)
    }
}

impl From<String> for SubmissionState {
    fn from(key: String) -> Self {
        if let Some(state) = LifecycleState::from_key(&key) {
            SubmissionState::Lifecycle(state)
        } else if key == Self::OPT_IN_CONFIRMED_KEY {
            SubmissionState::OptInConfirmed
        } else {
            SubmissionState::Custom(key)
        }
    }
}

impl From<&str> for SubmissionState {
    fn from(key: &str) -> Self {
        SubmissionState::from(key.to_string())
    }
}

impl From<SubmissionState> for String {
    fn from(state: SubmissionState) -> Self {
        state.key().to_string()
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Submission record
// ─────────────────────────────────────────────────────────────────────────────

/// Record of an opt-in status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Status transitioned from (`None` when first initialised)
    pub from: Option<OptInStatus>,
    /// Status transitioned to
    pub to: OptInStatus,
    /// When the transition occurred
    pub at: DateTime<Utc>,
    /// Optional reason for the transition
    pub reason: Option<String>,
}

/// One instance of user-provided data for a form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    /// Form this submission belongs to
    pub form_id: String,
    /// Lifecycle state, set by the storage collaborator
    pub state: LifecycleState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    opt_in_status: Option<OptInStatus>,

    #[serde(default, deserialize_with = "deserialize_data")]
    data: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    status_history: Vec<StatusTransition>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data bag with the reserved status key rejected
fn deserialize_data<'de, D>(deserializer: D) -> Result<BTreeMap<String, serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let data = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    if data.contains_key(OPT_IN_STATUS_FIELD) {
        return Err(de::Error::custom(OptInError::ReservedField(
            OPT_IN_STATUS_FIELD.to_string(),
        )));
    }
    Ok(data)
}

impl Submission {
    pub fn new(id: SubmissionId, form_id: impl Into<String>, state: LifecycleState) -> Self {
        let now = Utc::now();
        Self {
            id,
            form_id: form_id.into(),
            state,
            opt_in_status: None,
            data: BTreeMap::new(),
            status_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a submission from a raw data bag
    ///
    /// A legacy `opt_in_status` entry is lifted out of the bag into the typed
    /// status field.
    pub fn from_data(
        id: SubmissionId,
        form_id: impl Into<String>,
        state: LifecycleState,
        mut data: BTreeMap<String, serde_json::Value>,
    ) -> Result<Self, OptInError> {
        let mut submission = Self::new(id, form_id, state);

        if let Some(raw) = data.remove(OPT_IN_STATUS_FIELD) {
            let status = match &raw {
                serde_json::Value::String(s) => OptInStatus::try_from(s.as_str())?,
                other => return Err(OptInError::InvalidStatus(other.to_string())),
            };
            submission.opt_in_status = Some(status);
        }

        submission.data = data;
        Ok(submission)
    }

    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Self, OptInError> {
        self.set_field(key, value)?;
        Ok(self)
    }

    /// Set a form field value; the opt-in status key is reserved
    pub fn set_field(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), OptInError> {
        let key = key.into();
        if key == OPT_IN_STATUS_FIELD {
            return Err(OptInError::ReservedField(key));
        }
        self.data.insert(key, value);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Field value as a string, if it is one
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.data
    }

    pub fn opt_in_status(&self) -> Option<OptInStatus> {
        self.opt_in_status
    }

    pub fn status_history(&self) -> &[StatusTransition] {
        &self.status_history
    }

    /// Set the initial `PendingMail` status if none is present
    ///
    /// Returns `true` when the status was initialised.
    pub fn init_opt_in_status(&mut self) -> bool {
        if self.opt_in_status.is_some() {
            return false;
        }
        self.record_status(None, OptInStatus::PendingMail, None);
        true
    }

    /// Apply a status transition, rejecting anything off the forward graph
    pub fn transition_status(
        &mut self,
        to: OptInStatus,
        reason: Option<String>,
    ) -> Result<(), OptInError> {
        match self.opt_in_status {
            Some(from) if from.can_transition_to(to) => {
                self.record_status(Some(from), to, reason);
                Ok(())
            }
            from => Err(OptInError::InvalidStatusTransition {
                from: from.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()),
                to: to.to_string(),
            }),
        }
    }

    /// Take over another copy's status and history
    pub(crate) fn adopt_status_from(&mut self, other: &Submission) {
        self.opt_in_status = other.opt_in_status;
        self.status_history = other.status_history.clone();
    }

    fn record_status(&mut self, from: Option<OptInStatus>, to: OptInStatus, reason: Option<String>) {
        let now = Utc::now();
        self.opt_in_status = Some(to);
        self.status_history.push(StatusTransition {
            from,
            to,
            at: now,
            reason,
        });
        self.updated_at = now;
    }
}
