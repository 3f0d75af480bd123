//! Notification e-mail handler
//!
//! Sends the real notification once the resolved state of a submission is
//! one of its trigger states. With the default resolvers, a handler triggered
//! on `opt_in_confirmed` fires when the double opt-in completes and not on
//! the bare `completed` save that started it. The confirmation is notified in
//! the run that confirms it; later saves of the confirmed submission resolve
//! to the same state and are skipped.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    acts_on, effective_lifecycle, HandlerOutcome, HandlerSummary, SaveContext, SubmissionHandler,
};
use crate::config::{FormSettings, HandlerConfig};
use crate::events::{StateOptionProviders, StateOptions, StateResolvers};
use crate::mail::{FieldComposer, Mailer, MessageComposer};
use crate::state::{LifecycleState, Submission, SubmissionState};
use crate::OptInError;

pub struct NotificationHandler {
    id: String,
    form: FormSettings,
    config: HandlerConfig,
    resolvers: Arc<StateResolvers>,
    options: Arc<StateOptionProviders>,
    mailer: Arc<dyn Mailer>,
    composer: Arc<dyn MessageComposer>,
}

impl NotificationHandler {
    pub const LABEL: &'static str = "Email";

    pub fn new(
        id: impl Into<String>,
        form: FormSettings,
        config: HandlerConfig,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            id: id.into(),
            form,
            config,
            resolvers: Arc::new(StateResolvers::with_defaults()),
            options: Arc::new(StateOptionProviders::with_defaults()),
            mailer,
            composer: Arc::new(FieldComposer),
        }
    }

    pub fn with_resolvers(mut self, resolvers: Arc<StateResolvers>) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn with_option_providers(mut self, options: Arc<StateOptionProviders>) -> Self {
        self.options = options;
        self
    }

    pub fn with_composer(mut self, composer: Arc<dyn MessageComposer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// State the submission is matched against the trigger states in
    ///
    /// Forms without retained results skip the resolvers and are always
    /// considered completed.
    pub fn resolve_state(&self, submission: &Submission) -> SubmissionState {
        let lifecycle = effective_lifecycle(&self.form, submission);
        if self.form.results_disabled {
            return lifecycle.into();
        }
        self.resolvers.resolve(submission, lifecycle.into())
    }

    /// Trigger-state options offered for this handler
    pub fn state_options(&self) -> StateOptions {
        self.options.collect()
    }

    /// Check the configured trigger states against [`Self::state_options`]
    pub fn validate(&self) -> Result<(), OptInError> {
        self.config.validate(&self.state_options())
    }

    async fn send(&self, submission: &Submission) -> Result<HandlerOutcome, OptInError> {
        let message = self.composer.compose(&self.config.message, submission)?;
        self.mailer.send(&message).await.map_err(OptInError::Mail)?;

        info!(
            handler_id = %self.id,
            submission_id = %submission.id,
            to_mail = %message.to_mail,
            "Notification sent"
        );
        Ok(HandlerOutcome::NotificationSent {
            to_mail: message.to_mail,
        })
    }
}

#[async_trait]
impl SubmissionHandler for NotificationHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn summary(&self) -> HandlerSummary {
        HandlerSummary::from_config(&self.id, Self::LABEL, &self.config)
    }

    async fn post_save(
        &self,
        submission: &mut Submission,
        context: &SaveContext,
    ) -> Result<HandlerOutcome, OptInError> {
        if !acts_on(&self.form, context) {
            debug!(
                handler_id = %self.id,
                submission_id = %submission.id,
                "Results disabled, update ignored"
            );
            return Ok(HandlerOutcome::NoAction);
        }

        let state = self.resolve_state(submission);
        if !self.config.triggers(&state) {
            debug!(
                handler_id = %self.id,
                submission_id = %submission.id,
                state = %state,
                "Handler not triggered"
            );
            return Ok(HandlerOutcome::NotTriggered { state });
        }
        if state == SubmissionState::OptInConfirmed && !context.confirmed_in_run(submission) {
            debug!(
                handler_id = %self.id,
                submission_id = %submission.id,
                "Confirmation already notified"
            );
            return Ok(HandlerOutcome::NoAction);
        }
        self.send(submission).await
    }

    async fn post_delete(&self, submission: &Submission) -> Result<HandlerOutcome, OptInError> {
        if self.config.triggers(&LifecycleState::Deleted.into()) {
            self.send(submission).await
        } else {
            Ok(HandlerOutcome::NoAction)
        }
    }
}
