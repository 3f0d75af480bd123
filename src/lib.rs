//! Webform Double Opt-In
//!
//! Double opt-in confirmation workflow for form submission e-mail handlers.
//!
//! When a submission is saved, the [`DoubleOptInHandler`] asks an external
//! [`ConfirmationDelegate`] to send a confirmation request instead of sending
//! the notification straight away. Once the recipient confirms, the
//! [`NotificationHandler`] fires the real notification. Two ordered extension
//! points, [`StateResolvers`] and [`StateOptionProviders`], let other code
//! override the resolved submission state and extend the trigger-state options.

pub mod config;
pub mod delegate;
pub mod delegate_memory;
pub mod engine;
pub mod events;
pub mod handler;
pub mod mail;
pub mod realm;
pub mod state;
pub mod store;
pub mod store_memory;

pub use config::{DispatchFailurePolicy, FormSettings, HandlerConfig};
pub use delegate::{
    ConfirmationDelegate, ConfirmationMetadata, ConfirmationRecord, ConfirmationRequest,
    ConfirmationStatus,
};
pub use delegate_memory::MemoryConfirmer;
pub use engine::{SaveReport, SubmissionPipeline};
pub use events::{
    opt_in_confirmed_option, opt_in_confirmed_resolver, StateOptionProvider,
    StateOptionProviders, StateOptions, StateResolver, StateResolvers,
};
pub use handler::{
    DoubleOptInHandler, HandlerOutcome, HandlerSummary, NotificationHandler, SaveContext,
    SubmissionHandler,
};
pub use mail::{FieldComposer, Mailer, MemoryMailer, Message, MessageComposer, MessageTemplate, Recipient};
pub use realm::ConfirmationRealm;
pub use state::{
    LifecycleState, OptInStatus, StatusTransition, Submission, SubmissionId, SubmissionState,
    OPT_IN_STATUS_FIELD,
};
pub use store::SubmissionStore;
pub use store_memory::MemorySubmissionStore;

/// Errors raised by the double opt-in workflow
#[derive(Debug, thiserror::Error)]
pub enum OptInError {
    #[error("Confirmation dispatch failed for submission {submission_id} in realm {realm}: {source}")]
    ConfirmationDispatchFailed {
        submission_id: SubmissionId,
        realm: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Submission id cannot scope a confirmation realm: {0:?}")]
    InvalidRealmState(String),

    #[error("Field '{0}' is reserved for the opt-in status")]
    ReservedField(String),

    #[error("Unknown opt-in status: {0:?}")]
    InvalidStatus(String),

    #[error("Message has no usable recipient address")]
    MissingRecipient,

    #[error("Invalid opt-in status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Submission not found: {0}")]
    SubmissionNotFound(SubmissionId),

    #[error("Confirmation for submission {submission_id} names form {actual}, expected {expected}")]
    ConfirmationFormMismatch {
        submission_id: SubmissionId,
        expected: String,
        actual: String,
    },

    #[error("Trigger state '{0}' is not offered by any state option provider")]
    UnknownTriggerState(String),

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Confirmation delegate error: {0}")]
    Delegate(#[source] anyhow::Error),

    #[error("Mail error: {0}")]
    Mail(#[source] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
