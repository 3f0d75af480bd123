//! Handler Configuration and YAML Loading
//!
//! Handler settings are plain serde structs, loadable from YAML.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::events::StateOptions;
use crate::mail::MessageTemplate;
use crate::state::{LifecycleState, SubmissionState};
use crate::OptInError;

/// What happens to the opt-in status when the confirmation delegate fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchFailurePolicy {
    /// Park the submission in `DispatchFailed` so a later save or an explicit
    /// retry dispatches again
    #[default]
    MarkFailed,
    /// Leave the submission in `Pending`; the request is not retried
    KeepPending,
}

/// Settings of an e-mail handler attached to a form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// States that make the handler act
    #[serde(default = "default_states")]
    pub states: Vec<SubmissionState>,

    /// Share confirmations across all forms per address
    #[serde(default)]
    pub opt_in_globally: bool,

    #[serde(default)]
    pub dispatch_failure: DispatchFailurePolicy,

    /// Message used for the confirmation request and the notification
    pub message: MessageTemplate,
}

fn default_states() -> Vec<SubmissionState> {
    vec![SubmissionState::Lifecycle(LifecycleState::Completed)]
}

impl HandlerConfig {
    pub fn new(message: MessageTemplate) -> Self {
        Self {
            states: default_states(),
            opt_in_globally: false,
            dispatch_failure: DispatchFailurePolicy::default(),
            message,
        }
    }

    /// Parse a handler configuration from YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self, OptInError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a handler configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptInError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubmissionState>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    pub fn opt_in_globally(mut self, enabled: bool) -> Self {
        self.opt_in_globally = enabled;
        self
    }

    pub fn dispatch_failure(mut self, policy: DispatchFailurePolicy) -> Self {
        self.dispatch_failure = policy;
        self
    }

    /// Whether `state` is one of the configured trigger states
    pub fn triggers(&self, state: &SubmissionState) -> bool {
        self.states.contains(state)
    }

    /// Operator-facing warnings about this configuration
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.states.is_empty() {
            warnings.push(
                "No trigger states selected: e-mails can only be sent through a manual resend"
                    .to_string(),
            );
        }
        warnings
    }

    /// Reject trigger states that no option provider offers
    pub fn validate(&self, options: &StateOptions) -> Result<(), OptInError> {
        match self.states.iter().find(|s| !options.contains(s)) {
            Some(unknown) => Err(OptInError::UnknownTriggerState(unknown.to_string())),
            None => Ok(()),
        }
    }
}

/// Form-level settings a handler is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSettings {
    pub form_id: String,
    /// Submissions are not retained; handlers act once at submission time
    #[serde(default)]
    pub results_disabled: bool,
}

impl FormSettings {
    pub fn new(form_id: impl Into<String>) -> Self {
        Self {
            form_id: form_id.into(),
            results_disabled: false,
        }
    }

    pub fn results_disabled(mut self, disabled: bool) -> Self {
        self.results_disabled = disabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StateOptionProviders;
    use crate::mail::Recipient;
    use std::io::Write;

    const YAML: &str = r#"
states: [completed, opt_in_confirmed]
opt_in_globally: true
message:
  to_mail:
    field: email
  subject: Please confirm your subscription
  body: Follow the link to confirm.
"#;

    #[test]
    fn test_parse_yaml() {
        let config = HandlerConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(
            config.states,
            vec![
                SubmissionState::Lifecycle(LifecycleState::Completed),
                SubmissionState::OptInConfirmed
            ]
        );
        assert!(config.opt_in_globally);
        assert_eq!(config.dispatch_failure, DispatchFailurePolicy::MarkFailed);
        assert_eq!(config.message.to_mail, Recipient::field("email"));
        assert!(!config.message.html);
    }

    #[test]
    fn test_defaults() {
        let config = HandlerConfig::from_yaml_str(
            "message: {to_mail: {address: ops@example.com}, subject: s, body: b}",
        )
        .unwrap();
        assert_eq!(config.states, default_states());
        assert!(!config.opt_in_globally);
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();

        let config = HandlerConfig::load(file.path()).unwrap();
        assert!(config.opt_in_globally);
    }

    #[test]
    fn test_missing_file() {
        let err = HandlerConfig::load("/nonexistent/handler.yaml").unwrap_err();
        assert!(matches!(err, OptInError::Io(_)));
    }

    #[test]
    fn test_empty_states_warns_and_never_triggers() {
        let config = HandlerConfig::from_yaml_str(YAML)
            .unwrap()
            .states(Vec::<SubmissionState>::new());
        assert_eq!(config.warnings().len(), 1);
        assert!(!config.triggers(&LifecycleState::Completed.into()));
    }

    #[test]
    fn test_validate_against_options() {
        let options = StateOptionProviders::with_defaults().collect();
        let config = HandlerConfig::from_yaml_str(YAML).unwrap();
        assert!(config.validate(&options).is_ok());

        let config = config.states(["completed", "archived"]);
        let err = config.validate(&options).unwrap_err();
        assert!(matches!(err, OptInError::UnknownTriggerState(ref key) if key == "archived"));
    }
}
