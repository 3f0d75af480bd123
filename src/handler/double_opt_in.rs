//! Double opt-in e-mail handler
//!
//! On every triggering save the handler inspects the opt-in status:
//!
//! - `PendingMail` / `DispatchFailed`: claim the dispatch (`-> Pending`) with a
//!   compare-and-swap, then either short-circuit on an existing confirmation
//!   (`-> Confirmed`) or ask the delegate for a new one.
//! - `Pending`: ask the delegate whether the recipient has confirmed since.
//! - `Confirmed`: nothing left to do.
//!
//! The claim is durable before the delegate is called, so a concurrent or
//! repeated save cannot issue a second request.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    acts_on, effective_lifecycle, HandlerOutcome, HandlerSummary, SaveContext, SubmissionHandler,
};
use crate::config::{DispatchFailurePolicy, FormSettings, HandlerConfig};
use crate::delegate::{ConfirmationDelegate, ConfirmationMetadata, ConfirmationRequest};
use crate::mail::{FieldComposer, Message, MessageComposer};
use crate::realm::ConfirmationRealm;
use crate::state::{OptInStatus, Submission, SubmissionId, SubmissionState};
use crate::store::SubmissionStore;
use crate::OptInError;

pub struct DoubleOptInHandler {
    id: String,
    form: FormSettings,
    config: HandlerConfig,
    store: Arc<dyn SubmissionStore>,
    confirmer: Arc<dyn ConfirmationDelegate>,
    composer: Arc<dyn MessageComposer>,
}

impl DoubleOptInHandler {
    pub const LABEL: &'static str = "Double opt-in email";

    pub fn new(
        id: impl Into<String>,
        form: FormSettings,
        config: HandlerConfig,
        store: Arc<dyn SubmissionStore>,
        confirmer: Arc<dyn ConfirmationDelegate>,
    ) -> Self {
        Self {
            id: id.into(),
            form,
            config,
            store,
            confirmer,
            composer: Arc::new(FieldComposer),
        }
    }

    pub fn with_composer(mut self, composer: Arc<dyn MessageComposer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn form(&self) -> &FormSettings {
        &self.form
    }

    /// Realm confirmations for this submission are looked up and issued in
    pub fn realm_for(&self, submission: &Submission) -> Result<ConfirmationRealm, OptInError> {
        ConfirmationRealm::resolve(self.config.opt_in_globally, &submission.id)
    }

    /// State matched against the trigger states
    ///
    /// The opt-in handler itself reacts to the plain lifecycle state; state
    /// resolvers only affect notification handlers.
    pub fn trigger_state(&self, submission: &Submission) -> SubmissionState {
        effective_lifecycle(&self.form, submission).into()
    }

    /// Dispatch again for a submission whose earlier dispatch failed
    ///
    /// This is the manual resend path: it ignores the trigger states.
    pub async fn retry_dispatch(&self, id: &SubmissionId) -> Result<HandlerOutcome, OptInError> {
        let mut submission = self
            .store
            .load(id)
            .await
            .map_err(OptInError::Store)?
            .ok_or_else(|| OptInError::SubmissionNotFound(id.clone()))?;

        match submission.opt_in_status() {
            Some(status) if status.is_dispatch_eligible() => {
                self.dispatch(&mut submission, status).await
            }
            other => Err(OptInError::InvalidStatusTransition {
                from: other
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                to: OptInStatus::Pending.to_string(),
            }),
        }
    }

    async fn dispatch(
        &self,
        submission: &mut Submission,
        claim_from: OptInStatus,
    ) -> Result<HandlerOutcome, OptInError> {
        // Compose before claiming so a bad recipient never strands the claim
        let message = self.composer.compose(&self.config.message, submission)?;
        let realm = self.realm_for(submission)?;

        if !self
            .settle(submission, claim_from, OptInStatus::Pending, "confirmation dispatch claimed")
            .await?
        {
            return Ok(HandlerOutcome::ClaimLost);
        }

        match self.request_confirmation(submission, &message, &realm).await {
            Ok(None) => {
                self.settle(
                    submission,
                    OptInStatus::Pending,
                    OptInStatus::Confirmed,
                    "address already confirmed in realm",
                )
                .await?;
                info!(
                    submission_id = %submission.id,
                    realm = %realm,
                    "Address already confirmed, skipping confirmation request"
                );
                Ok(HandlerOutcome::AlreadyConfirmed { realm })
            }
            Ok(Some(request)) => {
                info!(
                    submission_id = %submission.id,
                    realm = %realm,
                    confirmation_id = %request.confirmation_id,
                    "Confirmation requested"
                );
                Ok(HandlerOutcome::ConfirmationRequested {
                    realm,
                    confirmation_id: request.confirmation_id,
                })
            }
            Err(source) => {
                warn!(
                    submission_id = %submission.id,
                    realm = %realm,
                    policy = ?self.config.dispatch_failure,
                    error = %source,
                    "Confirmation dispatch failed"
                );
                if self.config.dispatch_failure == DispatchFailurePolicy::MarkFailed {
                    self.settle(
                        submission,
                        OptInStatus::Pending,
                        OptInStatus::DispatchFailed,
                        "confirmation dispatch failed",
                    )
                    .await?;
                }
                Err(OptInError::ConfirmationDispatchFailed {
                    submission_id: submission.id.clone(),
                    realm: realm.to_string(),
                    source,
                })
            }
        }
    }

    /// Returns `None` when the address is already confirmed in the realm
    async fn request_confirmation(
        &self,
        submission: &Submission,
        message: &Message,
        realm: &ConfirmationRealm,
    ) -> anyhow::Result<Option<ConfirmationRequest>> {
        let existing = self
            .confirmer
            .get_confirmation(&message.to_mail, false, realm)
            .await?;
        if existing.is_some_and(|record| record.is_confirmed()) {
            return Ok(None);
        }

        let metadata = ConfirmationMetadata {
            submission_id: submission.id.clone(),
            form_id: submission.form_id.clone(),
        };
        let request = self
            .confirmer
            .confirm(&message.to_mail, metadata, realm, message)
            .await?;
        Ok(Some(request))
    }

    /// Pick up a confirmation completed out of band since the last save
    async fn observe_confirmation(
        &self,
        submission: &mut Submission,
    ) -> Result<HandlerOutcome, OptInError> {
        let message = self.composer.compose(&self.config.message, submission)?;
        let realm = self.realm_for(submission)?;

        let record = self
            .confirmer
            .get_confirmation(&message.to_mail, true, &realm)
            .await
            .map_err(OptInError::Delegate)?;

        if record.is_some_and(|r| r.is_confirmed())
            && self
                .settle(
                    submission,
                    OptInStatus::Pending,
                    OptInStatus::Confirmed,
                    "confirmation observed",
                )
                .await?
        {
            info!(submission_id = %submission.id, realm = %realm, "Confirmation observed");
            return Ok(HandlerOutcome::ConfirmationObserved { realm });
        }

        Ok(HandlerOutcome::AwaitingConfirmation { realm })
    }

    /// Compare-and-swap the stored status, syncing the local copy on success
    async fn settle(
        &self,
        submission: &mut Submission,
        from: OptInStatus,
        to: OptInStatus,
        reason: &str,
    ) -> Result<bool, OptInError> {
        let updated = self
            .store
            .compare_and_set_status(&submission.id, from, to, Some(reason.to_string()))
            .await
            .map_err(OptInError::Store)?;

        match updated {
            Some(updated) => {
                *submission = updated;
                Ok(true)
            }
            None => {
                warn!(
                    submission_id = %submission.id,
                    from = %from,
                    to = %to,
                    "Opt-in status changed concurrently, transition skipped"
                );
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl SubmissionHandler for DoubleOptInHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn summary(&self) -> HandlerSummary {
        let mut summary = HandlerSummary::from_config(&self.id, Self::LABEL, &self.config);
        summary.settings.insert(
            "opt_in_globally".to_string(),
            serde_json::json!(self.config.opt_in_globally),
        );
        summary.settings.insert(
            "dispatch_failure".to_string(),
            serde_json::json!(self.config.dispatch_failure),
        );
        summary
    }

    async fn pre_save(&self, submission: &mut Submission) -> Result<(), OptInError> {
        if submission.init_opt_in_status() {
            debug!(submission_id = %submission.id, "Opt-in status initialised");
        }
        Ok(())
    }

    async fn post_save(
        &self,
        submission: &mut Submission,
        context: &SaveContext,
    ) -> Result<HandlerOutcome, OptInError> {
        if !acts_on(&self.form, context) {
            debug!(submission_id = %submission.id, "Results disabled, update ignored");
            return Ok(HandlerOutcome::NoAction);
        }

        let state = self.trigger_state(submission);
        if !self.config.triggers(&state) {
            debug!(submission_id = %submission.id, state = %state, "Handler not triggered");
            return Ok(HandlerOutcome::NotTriggered { state });
        }

        match submission.opt_in_status() {
            Some(status) if status.is_dispatch_eligible() => self.dispatch(submission, status).await,
            Some(OptInStatus::Pending) => self.observe_confirmation(submission).await,
            _ => Ok(HandlerOutcome::NoAction),
        }
    }

    async fn post_delete(&self, submission: &Submission) -> Result<HandlerOutcome, OptInError> {
        debug!(submission_id = %submission.id, "Submission deleted, no e-mail sent");
        Ok(HandlerOutcome::NoAction)
    }
}
