//! Submission handlers
//!
//! Handlers react to the save pipeline's lifecycle hooks. The
//! [`DoubleOptInHandler`] drives the opt-in state machine; the
//! [`NotificationHandler`] sends the real notification once the resolved
//! state matches its trigger states.

mod double_opt_in;
mod notification;

pub use double_opt_in::DoubleOptInHandler;
pub use notification::NotificationHandler;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::{FormSettings, HandlerConfig};
use crate::realm::ConfirmationRealm;
use crate::state::{LifecycleState, OptInStatus, Submission, SubmissionState};
use crate::OptInError;

/// What a handler did in response to a hook
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum HandlerOutcome {
    /// Resolved state is not a trigger state
    NotTriggered { state: SubmissionState },
    /// Triggered, nothing to do for the current status
    NoAction,
    /// Another save claimed the dispatch first
    ClaimLost,
    /// A confirmation request was issued
    ConfirmationRequested {
        realm: ConfirmationRealm,
        confirmation_id: Uuid,
    },
    /// The address was already confirmed in the realm; no request issued
    AlreadyConfirmed { realm: ConfirmationRealm },
    /// A pending confirmation was found completed by the delegate
    ConfirmationObserved { realm: ConfirmationRealm },
    /// Still waiting on the recipient
    AwaitingConfirmation { realm: ConfirmationRealm },
    /// The notification e-mail was sent
    NotificationSent { to_mail: String },
}

/// Settings summary shown to operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerSummary {
    pub handler_id: String,
    pub label: String,
    pub settings: BTreeMap<String, serde_json::Value>,
    pub warnings: Vec<String>,
}

impl HandlerSummary {
    fn from_config(handler_id: &str, label: &str, config: &HandlerConfig) -> Self {
        let mut settings = BTreeMap::new();
        settings.insert(
            "states".to_string(),
            serde_json::json!(config.states.iter().map(|s| s.key()).collect::<Vec<_>>()),
        );
        settings.insert("to_mail".to_string(), serde_json::json!(config.message.to_mail));
        settings.insert("subject".to_string(), serde_json::json!(config.message.subject));

        Self {
            handler_id: handler_id.to_string(),
            label: label.to_string(),
            settings,
            warnings: config.warnings(),
        }
    }
}

/// What the pipeline knew about the record before a `post_save` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveContext {
    /// The record existed before this run
    pub update: bool,
    /// Stored opt-in status before this run
    pub prior_status: Option<OptInStatus>,
}

impl SaveContext {
    /// First save of a new record
    pub fn insert() -> Self {
        Self::default()
    }

    pub fn update(prior_status: Option<OptInStatus>) -> Self {
        Self {
            update: true,
            prior_status,
        }
    }

    /// Whether the opt-in reached `Confirmed` during this run
    pub fn confirmed_in_run(&self, submission: &Submission) -> bool {
        submission.opt_in_status() == Some(OptInStatus::Confirmed)
            && self.prior_status != Some(OptInStatus::Confirmed)
    }
}

/// Lifecycle hooks invoked by the save pipeline
#[async_trait]
pub trait SubmissionHandler: Send + Sync {
    fn id(&self) -> &str;

    fn summary(&self) -> HandlerSummary;

    /// Runs before the submission is persisted
    async fn pre_save(&self, _submission: &mut Submission) -> Result<(), OptInError> {
        Ok(())
    }

    /// Runs after the submission is persisted
    async fn post_save(
        &self,
        submission: &mut Submission,
        context: &SaveContext,
    ) -> Result<HandlerOutcome, OptInError>;

    /// Runs after the submission was removed from the store
    async fn post_delete(&self, _submission: &Submission) -> Result<HandlerOutcome, OptInError> {
        Ok(HandlerOutcome::NoAction)
    }
}

/// Lifecycle state as seen by a handler bound to `form`
///
/// Forms that do not retain results act once at submission time, so the
/// state is always treated as completed.
fn effective_lifecycle(form: &FormSettings, submission: &Submission) -> LifecycleState {
    if form.results_disabled {
        LifecycleState::Completed
    } else {
        submission.state
    }
}

/// Forms that do not retain results only act on the initial save
fn acts_on(form: &FormSettings, context: &SaveContext) -> bool {
    !(form.results_disabled && context.update)
}
