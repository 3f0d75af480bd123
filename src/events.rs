//! State extension points
//!
//! Two ordered pipelines of pure functions replace an open event bus:
//!
//! - [`StateResolvers`]: `(submission, state) -> state`, used by handlers to
//!   decide which state a submission is in for trigger matching.
//! - [`StateOptionProviders`]: `(options) -> options`, used to build the list
//!   of trigger-state options offered to configuration surfaces.
//!
//! Both run lowest priority first; equal priorities keep registration order.
//! Later entries see earlier results and may override them.

use std::sync::Arc;

use crate::state::{LifecycleState, OptInStatus, Submission, SubmissionState};

/// Priority of the resolver and option provider bundled with this crate
pub const DEFAULT_PRIORITY: i32 = 0;

/// Entries kept sorted by priority, stable for equal priorities
struct Ordered<T> {
    entries: Vec<(i32, T)>,
}

impl<T> Ordered<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn insert(&mut self, priority: i32, item: T) {
        let at = self.entries.partition_point(|(p, _)| *p <= priority);
        self.entries.insert(at, (priority, item));
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, item)| item)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Overrides the state a submission is considered to be in
pub trait StateResolver: Send + Sync {
    fn resolve(&self, submission: &Submission, state: SubmissionState) -> SubmissionState;
}

impl<F> StateResolver for F
where
    F: Fn(&Submission, SubmissionState) -> SubmissionState + Send + Sync,
{
    fn resolve(&self, submission: &Submission, state: SubmissionState) -> SubmissionState {
        self(submission, state)
    }
}

/// Replaces `Completed` with `OptInConfirmed` once the opt-in is confirmed
pub fn opt_in_confirmed_resolver(submission: &Submission, state: SubmissionState) -> SubmissionState {
    if submission.opt_in_status() == Some(OptInStatus::Confirmed)
        && state.is_lifecycle(LifecycleState::Completed)
    {
        SubmissionState::OptInConfirmed
    } else {
        state
    }
}

/// Ordered state resolver pipeline
pub struct StateResolvers {
    resolvers: Ordered<Arc<dyn StateResolver>>,
}

impl StateResolvers {
    /// Empty pipeline: the lifecycle state passes through untouched
    pub fn new() -> Self {
        Self {
            resolvers: Ordered::new(),
        }
    }

    /// Pipeline with [`opt_in_confirmed_resolver`] registered
    pub fn with_defaults() -> Self {
        let mut resolvers = Self::new();
        resolvers.register(DEFAULT_PRIORITY, opt_in_confirmed_resolver);
        resolvers
    }

    pub fn register(&mut self, priority: i32, resolver: impl StateResolver + 'static) -> &mut Self {
        self.resolvers.insert(priority, Arc::new(resolver));
        self
    }

    pub fn with(mut self, priority: i32, resolver: impl StateResolver + 'static) -> Self {
        self.register(priority, resolver);
        self
    }

    /// Fold the submission's state through every resolver
    pub fn resolve(&self, submission: &Submission, state: SubmissionState) -> SubmissionState {
        self.resolvers
            .iter()
            .fold(state, |state, resolver| resolver.resolve(submission, state))
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.len() == 0
    }
}

impl Default for StateResolvers {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State options
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered state key → label list, merged by key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateOptions {
    options: Vec<(SubmissionState, String)>,
}

impl StateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels for every lifecycle state
    pub fn lifecycle_defaults() -> Self {
        let mut options = Self::new();
        for state in LifecycleState::ALL {
            options.merge(state.into(), state.option_label());
        }
        options
    }

    /// Insert or relabel an option; an existing key keeps its position
    pub fn merge(&mut self, key: SubmissionState, label: impl Into<String>) {
        let label = label.into();
        match self.options.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = label,
            None => self.options.push((key, label)),
        }
    }

    pub fn with(mut self, key: SubmissionState, label: impl Into<String>) -> Self {
        self.merge(key, label);
        self
    }

    pub fn label(&self, key: &SubmissionState) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, label)| label.as_str())
    }

    pub fn contains(&self, key: &SubmissionState) -> bool {
        self.label(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SubmissionState> {
        self.options.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SubmissionState, &str)> {
        self.options.iter().map(|(k, l)| (k, l.as_str()))
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

/// Extends the trigger-state options
pub trait StateOptionProvider: Send + Sync {
    fn provide(&self, options: StateOptions) -> StateOptions;
}

impl<F> StateOptionProvider for F
where
    F: Fn(StateOptions) -> StateOptions + Send + Sync,
{
    fn provide(&self, options: StateOptions) -> StateOptions {
        self(options)
    }
}

/// Adds the synthetic double opt-in confirmed option
pub fn opt_in_confirmed_option(options: StateOptions) -> StateOptions {
    options.with(
        SubmissionState::OptInConfirmed,
        "…when double opt-in is confirmed",
    )
}

/// Ordered option provider pipeline
pub struct StateOptionProviders {
    providers: Ordered<Arc<dyn StateOptionProvider>>,
}

impl StateOptionProviders {
    pub fn new() -> Self {
        Self {
            providers: Ordered::new(),
        }
    }

    /// Pipeline with [`opt_in_confirmed_option`] registered
    pub fn with_defaults() -> Self {
        let mut providers = Self::new();
        providers.register(DEFAULT_PRIORITY, opt_in_confirmed_option);
        providers
    }

    pub fn register(
        &mut self,
        priority: i32,
        provider: impl StateOptionProvider + 'static,
    ) -> &mut Self {
        self.providers.insert(priority, Arc::new(provider));
        self
    }

    pub fn with(mut self, priority: i32, provider: impl StateOptionProvider + 'static) -> Self {
        self.register(priority, provider);
        self
    }

    /// Lifecycle defaults folded through every provider
    pub fn collect(&self) -> StateOptions {
        self.providers
            .iter()
            .fold(StateOptions::lifecycle_defaults(), |options, provider| {
                provider.provide(options)
            })
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.len() == 0
    }
}

impl Default for StateOptionProviders {
    fn default() -> Self {
        Self::with_defaults()
    }
}
