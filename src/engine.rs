//! Submission Pipeline
//!
//! Orchestrates the handlers around store writes: `pre_save` hooks, the
//! store write, then `post_save` hooks in registration order. Handlers share
//! the persisted copy, so a status change made by the opt-in handler is
//! visible to notification handlers registered after it.
//!
//! The first handler error stops the run and is returned to the caller.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::delegate::ConfirmationMetadata;
use crate::events::{StateOptionProviders, StateOptions};
use crate::handler::{
    DoubleOptInHandler, HandlerOutcome, HandlerSummary, SaveContext, SubmissionHandler,
};
use crate::state::{OptInStatus, Submission, SubmissionId};
use crate::store::SubmissionStore;
use crate::OptInError;

/// Result of a pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    /// Stored copy after every handler ran
    pub submission: Submission,
    /// Whether the record existed before this run
    pub update: bool,
    /// `(handler_id, outcome)` in handler order
    pub outcomes: Vec<(String, HandlerOutcome)>,
}

impl SaveReport {
    pub fn outcome(&self, handler_id: &str) -> Option<&HandlerOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == handler_id)
            .map(|(_, outcome)| outcome)
    }
}

pub struct SubmissionPipeline {
    store: Arc<dyn SubmissionStore>,
    handlers: Vec<Arc<dyn SubmissionHandler>>,
    opt_in_handlers: HashMap<String, Arc<DoubleOptInHandler>>,
    options: Arc<StateOptionProviders>,
}

impl SubmissionPipeline {
    pub fn new(store: Arc<dyn SubmissionStore>) -> Self {
        Self {
            store,
            handlers: Vec::new(),
            opt_in_handlers: HashMap::new(),
            options: Arc::new(StateOptionProviders::with_defaults()),
        }
    }

    /// Append a handler; hooks run in the order handlers were added
    pub fn with_handler(mut self, handler: Arc<dyn SubmissionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Append an opt-in handler, also making it reachable by
    /// [`Self::retry_dispatch`]
    pub fn with_opt_in_handler(mut self, handler: Arc<DoubleOptInHandler>) -> Self {
        self.opt_in_handlers
            .insert(handler.id().to_string(), handler.clone());
        self.handlers.push(handler);
        self
    }

    pub fn with_option_providers(mut self, options: Arc<StateOptionProviders>) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }

    /// Trigger-state options offered to configuration surfaces
    pub fn state_options(&self) -> StateOptions {
        self.options.collect()
    }

    pub fn summaries(&self) -> Vec<HandlerSummary> {
        self.handlers.iter().map(|h| h.summary()).collect()
    }

    pub async fn load(&self, id: &SubmissionId) -> Result<Submission, OptInError> {
        self.store
            .load(id)
            .await
            .map_err(OptInError::Store)?
            .ok_or_else(|| OptInError::SubmissionNotFound(id.clone()))
    }

    /// Save a submission and run every handler against the stored copy
    pub async fn save(&self, mut submission: Submission) -> Result<SaveReport, OptInError> {
        let context = match self
            .store
            .load(&submission.id)
            .await
            .map_err(OptInError::Store)?
        {
            Some(existing) => SaveContext::update(existing.opt_in_status()),
            None => SaveContext::insert(),
        };

        for handler in &self.handlers {
            handler
                .pre_save(&mut submission)
                .await
                .inspect_err(|e| log_failure(handler.id(), &submission.id, e))?;
        }

        let mut persisted = self
            .store
            .save(&submission)
            .await
            .map_err(OptInError::Store)?;
        debug!(submission_id = %persisted.id, update = context.update, "Submission saved");

        let outcomes = self.run_post_save(&mut persisted, &context).await?;
        self.report(persisted, context.update, outcomes).await
    }

    /// Delete a submission and run the `post_delete` hooks
    pub async fn delete(
        &self,
        id: &SubmissionId,
    ) -> Result<Vec<(String, HandlerOutcome)>, OptInError> {
        let submission = self.load(id).await?;
        self.store.delete(id).await.map_err(OptInError::Store)?;
        info!(submission_id = %id, "Submission deleted");

        let mut outcomes = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            let outcome = handler
                .post_delete(&submission)
                .await
                .inspect_err(|e| log_failure(handler.id(), id, e))?;
            outcomes.push((handler.id().to_string(), outcome));
        }
        Ok(outcomes)
    }

    /// Record a confirmation reported by the delegate
    ///
    /// Moves the submission `Pending -> Confirmed` and re-runs the
    /// `post_save` hooks so notification handlers can fire. Repeated
    /// callbacks for a confirmed submission run nothing. The callback must
    /// name the form the submission belongs to.
    pub async fn handle_confirmation(
        &self,
        metadata: &ConfirmationMetadata,
    ) -> Result<SaveReport, OptInError> {
        let id = &metadata.submission_id;
        let current = self.load(id).await?;

        if current.form_id != metadata.form_id {
            warn!(
                submission_id = %id,
                form_id = %current.form_id,
                callback_form_id = %metadata.form_id,
                "Confirmation callback names another form"
            );
            return Err(OptInError::ConfirmationFormMismatch {
                submission_id: id.clone(),
                expected: current.form_id,
                actual: metadata.form_id.clone(),
            });
        }

        match current.opt_in_status() {
            Some(OptInStatus::Confirmed) => {
                debug!(submission_id = %id, "Submission already confirmed");
                return Ok(SaveReport {
                    submission: current,
                    update: true,
                    outcomes: Vec::new(),
                });
            }
            status => {
                let claimed = self
                    .store
                    .compare_and_set_status(
                        id,
                        OptInStatus::Pending,
                        OptInStatus::Confirmed,
                        Some("confirmation received".to_string()),
                    )
                    .await
                    .map_err(OptInError::Store)?;

                let Some(mut confirmed) = claimed else {
                    return Err(OptInError::InvalidStatusTransition {
                        from: status
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "none".to_string()),
                        to: OptInStatus::Confirmed.to_string(),
                    });
                };

                info!(submission_id = %id, form_id = %metadata.form_id, "Opt-in confirmed");
                let context = SaveContext::update(status);
                let outcomes = self.run_post_save(&mut confirmed, &context).await?;
                self.report(confirmed, true, outcomes).await
            }
        }
    }

    /// Dispatch again through the named opt-in handler
    ///
    /// When the retry finds the address already confirmed, the `post_save`
    /// hooks run as for a delegate confirmation.
    pub async fn retry_dispatch(
        &self,
        handler_id: &str,
        id: &SubmissionId,
    ) -> Result<SaveReport, OptInError> {
        let handler = self
            .opt_in_handlers
            .get(handler_id)
            .ok_or_else(|| OptInError::UnknownHandler(handler_id.to_string()))?;

        let prior_status = self.load(id).await?.opt_in_status();
        let outcome = handler.retry_dispatch(id).await?;
        let mut submission = self.load(id).await?;

        let mut outcomes = Vec::new();
        let confirmed = matches!(outcome, HandlerOutcome::AlreadyConfirmed { .. });
        outcomes.push((handler_id.to_string(), outcome));
        if confirmed {
            let context = SaveContext::update(prior_status);
            outcomes.extend(self.run_post_save(&mut submission, &context).await?);
        }
        self.report(submission, true, outcomes).await
    }

    async fn run_post_save(
        &self,
        submission: &mut Submission,
        context: &SaveContext,
    ) -> Result<Vec<(String, HandlerOutcome)>, OptInError> {
        let mut outcomes = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            let outcome = handler
                .post_save(submission, context)
                .await
                .inspect_err(|e| log_failure(handler.id(), &submission.id, e))?;
            outcomes.push((handler.id().to_string(), outcome));
        }
        Ok(outcomes)
    }

    async fn report(
        &self,
        fallback: Submission,
        update: bool,
        outcomes: Vec<(String, HandlerOutcome)>,
    ) -> Result<SaveReport, OptInError> {
        let submission = self
            .store
            .load(&fallback.id)
            .await
            .map_err(OptInError::Store)?
            .unwrap_or(fallback);
        Ok(SaveReport {
            submission,
            update,
            outcomes,
        })
    }
}

fn log_failure(handler_id: &str, submission_id: &SubmissionId, error: &OptInError) {
    warn!(
        handler_id = %handler_id,
        submission_id = %submission_id,
        error = %error,
        "Handler failed"
    );
}
