//! Double opt-in workflow integration tests
//!
//! Drive the full save pipeline (opt-in handler followed by a notification
//! handler) against the in-memory store, confirmer and mailer.

use std::sync::Arc;

use serde_json::json;
use webform_double_opt_in::{
    ConfirmationRealm, DoubleOptInHandler, FormSettings, HandlerConfig, HandlerOutcome,
    LifecycleState, MemoryConfirmer, MemoryMailer, MemorySubmissionStore, MessageTemplate,
    NotificationHandler, OptInError, OptInStatus, Recipient, Submission, SubmissionId,
    SubmissionPipeline, SubmissionState, SubmissionStore,
};

const ADDRESS: &str = "a@example.com";

struct Harness {
    pipeline: SubmissionPipeline,
    store: Arc<MemorySubmissionStore>,
    confirmer: Arc<MemoryConfirmer>,
    mailer: Arc<MemoryMailer>,
}

fn opt_in_config(opt_in_globally: bool, states: &[&str]) -> HandlerConfig {
    HandlerConfig::new(MessageTemplate::new(
        Recipient::field("email"),
        "Please confirm your subscription",
        "Follow the link to confirm.",
    ))
    .opt_in_globally(opt_in_globally)
    .states(states.iter().copied())
}

fn harness_with(form: FormSettings, opt_in: HandlerConfig, notify_states: &[&str]) -> Harness {
    let store = Arc::new(MemorySubmissionStore::new());
    let confirmer = Arc::new(MemoryConfirmer::new());
    let mailer = Arc::new(MemoryMailer::new());

    let opt_in = DoubleOptInHandler::new(
        "double_opt_in",
        form.clone(),
        opt_in,
        store.clone(),
        confirmer.clone(),
    );
    let notify = NotificationHandler::new(
        "email",
        form,
        HandlerConfig::new(MessageTemplate::new(
            Recipient::address("ops@example.com"),
            "New subscriber",
            "Someone subscribed.",
        ))
        .states(notify_states.iter().copied()),
        mailer.clone(),
    );

    let pipeline = SubmissionPipeline::new(store.clone())
        .with_opt_in_handler(Arc::new(opt_in))
        .with_handler(Arc::new(notify));

    Harness {
        pipeline,
        store,
        confirmer,
        mailer,
    }
}

fn harness(opt_in_globally: bool) -> Harness {
    harness_with(
        FormSettings::new("newsletter"),
        opt_in_config(opt_in_globally, &["completed"]),
        &["opt_in_confirmed"],
    )
}

fn submission(id: &str, state: LifecycleState) -> Submission {
    Submission::new(SubmissionId::from(id), "newsletter", state)
        .with_field("email", json!(ADDRESS))
        .unwrap()
}

fn submission_realm(id: &str) -> ConfirmationRealm {
    ConfirmationRealm::for_submission(&SubmissionId::from(id)).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Worked examples
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_new_submission_requests_confirmation_in_own_realm() {
    let h = harness(false);

    let report = h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();

    assert_eq!(report.submission.opt_in_status(), Some(OptInStatus::Pending));
    let history: Vec<_> = report
        .submission
        .status_history()
        .iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(history, vec![OptInStatus::PendingMail, OptInStatus::Pending]);

    let requests = h.confirmer.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].address, ADDRESS);
    assert_eq!(requests[0].realm.as_str(), "webform_double_opt_in_S1");
    assert_eq!(requests[0].message.subject, "Please confirm your subscription");
    assert_eq!(h.mailer.sent_count().await, 0);
}

#[tokio::test]
async fn test_globally_confirmed_address_skips_request() {
    let h = harness(true);
    h.confirmer
        .seed_confirmed(ADDRESS, &ConfirmationRealm::global())
        .await;

    let report = h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();

    assert_eq!(report.submission.opt_in_status(), Some(OptInStatus::Confirmed));
    assert_eq!(
        report.outcome("double_opt_in"),
        Some(&HandlerOutcome::AlreadyConfirmed {
            realm: ConfirmationRealm::global()
        })
    );
    assert_eq!(h.confirmer.request_count().await, 0);

    // The notification handler sees the confirmed status within the same run
    assert!(matches!(
        report.outcome("email"),
        Some(HandlerOutcome::NotificationSent { .. })
    ));
    assert_eq!(h.mailer.sent_count().await, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Status and trigger properties
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_status_only_moves_forward() {
    let h = harness(false);
    let report = h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();
    let requests = h.confirmer.mark_confirmed(ADDRESS, &submission_realm("S1")).await;
    h.pipeline
        .handle_confirmation(&requests[0].metadata)
        .await
        .unwrap();

    // A stale copy still carrying Pending cannot move the stored status back
    let mut stale = report.submission;
    stale.state = LifecycleState::Updated;
    let report = h.pipeline.save(stale).await.unwrap();
    assert_eq!(report.submission.opt_in_status(), Some(OptInStatus::Confirmed));

    // Nor can a direct compare-and-swap
    for (from, to) in [
        (OptInStatus::Confirmed, OptInStatus::Pending),
        (OptInStatus::Confirmed, OptInStatus::PendingMail),
    ] {
        assert!(h
            .store
            .compare_and_set_status(&SubmissionId::from("S1"), from, to, None)
            .await
            .is_err());
    }

    let history = report.submission.status_history();
    for pair in history.windows(2) {
        assert!(pair[0].to.can_transition_to(pair[1].to));
    }
    assert_eq!(history.last().map(|t| t.to), Some(OptInStatus::Confirmed));
}

#[tokio::test]
async fn test_untriggered_save_does_nothing() {
    let h = harness(false);

    let report = h.pipeline.save(submission("S1", LifecycleState::Draft)).await.unwrap();

    assert_eq!(
        report.outcome("double_opt_in"),
        Some(&HandlerOutcome::NotTriggered {
            state: LifecycleState::Draft.into()
        })
    );
    assert_eq!(h.confirmer.request_count().await, 0);
    assert_eq!(report.submission.opt_in_status(), Some(OptInStatus::PendingMail));
    assert_eq!(report.submission.status_history().len(), 1);
}

#[tokio::test]
async fn test_empty_trigger_states_never_dispatch() {
    let h = harness_with(
        FormSettings::new("newsletter"),
        opt_in_config(false, &[]),
        &["opt_in_confirmed"],
    );

    h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();

    assert_eq!(h.confirmer.request_count().await, 0);
    let summaries = h.pipeline.summaries();
    assert_eq!(summaries[0].warnings.len(), 1);
}

#[tokio::test]
async fn test_draft_then_completed_dispatches_once() {
    let h = harness(false);

    let report = h.pipeline.save(submission("S1", LifecycleState::Draft)).await.unwrap();
    assert_eq!(h.confirmer.request_count().await, 0);

    let mut completed = report.submission;
    completed.state = LifecycleState::Completed;
    let report = h.pipeline.save(completed).await.unwrap();
    assert!(report.update);
    assert!(matches!(
        report.outcome("double_opt_in"),
        Some(HandlerOutcome::ConfirmationRequested { .. })
    ));

    h.pipeline.save(report.submission).await.unwrap();
    assert_eq!(h.confirmer.request_count().await, 1);
}

#[tokio::test]
async fn test_results_disabled_form_acts_at_submission_time() {
    let h = harness_with(
        FormSettings::new("newsletter").results_disabled(true),
        opt_in_config(false, &["completed"]),
        &["opt_in_confirmed"],
    );

    let report = h.pipeline.save(submission("S1", LifecycleState::Draft)).await.unwrap();
    assert!(matches!(
        report.outcome("double_opt_in"),
        Some(HandlerOutcome::ConfirmationRequested { .. })
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Realms
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_per_submission_realms_do_not_share_confirmations() {
    let h = harness(false);

    h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();
    h.pipeline.save(submission("S2", LifecycleState::Completed)).await.unwrap();

    let requests = h.confirmer.requests().await;
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[0].realm, requests[1].realm);

    let confirmed = h.confirmer.mark_confirmed(ADDRESS, &submission_realm("S1")).await;
    h.pipeline
        .handle_confirmation(&confirmed[0].metadata)
        .await
        .unwrap();

    // S2 is refreshed on its next save and still waits for its own confirmation
    let s2 = h.pipeline.load(&SubmissionId::from("S2")).await.unwrap();
    let report = h.pipeline.save(s2).await.unwrap();
    assert_eq!(
        report.outcome("double_opt_in"),
        Some(&HandlerOutcome::AwaitingConfirmation {
            realm: submission_realm("S2")
        })
    );
    assert_eq!(report.submission.opt_in_status(), Some(OptInStatus::Pending));
}

#[tokio::test]
async fn test_global_realm_shares_confirmations() {
    let h = harness(true);

    h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();
    let confirmed = h
        .confirmer
        .mark_confirmed(ADDRESS, &ConfirmationRealm::global())
        .await;
    h.pipeline
        .handle_confirmation(&confirmed[0].metadata)
        .await
        .unwrap();

    let report = h.pipeline.save(submission("S2", LifecycleState::Completed)).await.unwrap();
    assert_eq!(report.submission.opt_in_status(), Some(OptInStatus::Confirmed));
    assert_eq!(h.confirmer.request_count().await, 1);
}

#[tokio::test]
async fn test_malformed_id_fails_before_claim() {
    let h = harness(false);

    let err = h
        .pipeline
        .save(submission("bad id", LifecycleState::Completed))
        .await
        .unwrap_err();
    assert!(matches!(err, OptInError::InvalidRealmState(_)));

    let stored = h.pipeline.load(&SubmissionId::from("bad id")).await.unwrap();
    assert_eq!(stored.opt_in_status(), Some(OptInStatus::PendingMail));
    assert_eq!(h.confirmer.request_count().await, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Delete and notifications
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_delete_never_sends() {
    let h = harness_with(
        FormSettings::new("newsletter"),
        opt_in_config(false, &["completed", "deleted"]),
        &["opt_in_confirmed"],
    );

    h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();
    h.pipeline.save(submission("S2", LifecycleState::Draft)).await.unwrap();
    let sent_before = h.confirmer.request_count().await;

    for id in ["S1", "S2"] {
        let outcomes = h.pipeline.delete(&SubmissionId::from(id)).await.unwrap();
        assert!(outcomes
            .iter()
            .all(|(_, outcome)| *outcome == HandlerOutcome::NoAction));
    }

    assert_eq!(h.confirmer.request_count().await, sent_before);
    assert_eq!(h.mailer.sent_count().await, 0);
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn test_notification_fires_once_on_confirmation() {
    let h = harness(false);

    let report = h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();
    assert_eq!(
        report.outcome("email"),
        Some(&HandlerOutcome::NotTriggered {
            state: LifecycleState::Completed.into()
        })
    );

    let confirmed = h.confirmer.mark_confirmed(ADDRESS, &submission_realm("S1")).await;
    let report = h
        .pipeline
        .handle_confirmation(&confirmed[0].metadata)
        .await
        .unwrap();
    assert_eq!(
        report.outcome("email"),
        Some(&HandlerOutcome::NotificationSent {
            to_mail: "ops@example.com".into()
        })
    );

    // Duplicate callbacks and later updates do not re-send
    h.pipeline
        .handle_confirmation(&confirmed[0].metadata)
        .await
        .unwrap();
    let mut updated = report.submission;
    updated.state = LifecycleState::Updated;
    h.pipeline.save(updated).await.unwrap();

    assert_eq!(h.mailer.sent_count().await, 1);
}

#[tokio::test]
async fn test_confirmed_resaves_do_not_renotify() {
    let h = harness(true);
    h.confirmer
        .seed_confirmed(ADDRESS, &ConfirmationRealm::global())
        .await;

    for _ in 0..3 {
        h.pipeline
            .save(submission("S1", LifecycleState::Completed))
            .await
            .unwrap();
    }

    let report = h
        .pipeline
        .save(submission("S1", LifecycleState::Completed))
        .await
        .unwrap();
    assert_eq!(report.outcome("email"), Some(&HandlerOutcome::NoAction));
    assert_eq!(h.mailer.sent_count().await, 1);
}

#[tokio::test]
async fn test_results_disabled_form_notifies_once() {
    let h = harness_with(
        FormSettings::new("newsletter").results_disabled(true),
        opt_in_config(false, &["completed"]),
        &["completed"],
    );

    h.pipeline
        .save(submission("S1", LifecycleState::Completed))
        .await
        .unwrap();
    assert_eq!(h.mailer.sent_count().await, 1);

    let confirmed = h.confirmer.mark_confirmed(ADDRESS, &submission_realm("S1")).await;
    let report = h
        .pipeline
        .handle_confirmation(&confirmed[0].metadata)
        .await
        .unwrap();
    assert_eq!(report.submission.opt_in_status(), Some(OptInStatus::Confirmed));
    assert!(report
        .outcomes
        .iter()
        .all(|(_, outcome)| *outcome == HandlerOutcome::NoAction));
    assert_eq!(h.mailer.sent_count().await, 1);
}

#[tokio::test]
async fn test_confirmation_observed_on_next_save() {
    let h = harness(false);

    let report = h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();
    h.confirmer.mark_confirmed(ADDRESS, &submission_realm("S1")).await;

    let report = h.pipeline.save(report.submission).await.unwrap();
    assert_eq!(
        report.outcome("double_opt_in"),
        Some(&HandlerOutcome::ConfirmationObserved {
            realm: submission_realm("S1")
        })
    );
    assert_eq!(report.submission.opt_in_status(), Some(OptInStatus::Confirmed));
    assert_eq!(h.mailer.sent_count().await, 1);
}

#[tokio::test]
async fn test_revoked_confirmation_is_not_observed() {
    let h = harness(false);

    let report = h.pipeline.save(submission("S1", LifecycleState::Completed)).await.unwrap();
    let realm = submission_realm("S1");
    h.confirmer.mark_confirmed(ADDRESS, &realm).await;
    h.confirmer.revoke(ADDRESS, &realm).await;

    let report = h.pipeline.save(report.submission).await.unwrap();
    assert_eq!(
        report.outcome("double_opt_in"),
        Some(&HandlerOutcome::AwaitingConfirmation { realm })
    );
    assert_eq!(h.mailer.sent_count().await, 0);
}

#[tokio::test]
async fn test_confirmation_without_dispatch_is_rejected() {
    let h = harness(false);
    let report = h.pipeline.save(submission("S1", LifecycleState::Draft)).await.unwrap();

    let err = h
        .pipeline
        .handle_confirmation(&webform_double_opt_in::ConfirmationMetadata {
            submission_id: report.submission.id.clone(),
            form_id: "newsletter".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OptInError::InvalidStatusTransition { ref from, .. } if from == "pending_mail"
    ));
}

#[tokio::test]
async fn test_validate_notification_states() {
    let h = harness(false);
    let options = h.pipeline.state_options();
    assert!(options.contains(&SubmissionState::OptInConfirmed));
    assert!(opt_in_config(false, &["opt_in_confirmed", "locked"])
        .validate(&options)
        .is_ok());
    assert!(opt_in_config(false, &["archived"]).validate(&options).is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_saves_dispatch_once() {
    let h = Arc::new(harness(false));
    let s = submission("S1", LifecycleState::Completed);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let h = h.clone();
            let s = s.clone();
            tokio::spawn(async move { h.pipeline.save(s).await })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.confirmer.request_count().await, 1);
    let stored = h.pipeline.load(&SubmissionId::from("S1")).await.unwrap();
    assert_eq!(stored.opt_in_status(), Some(OptInStatus::Pending));
}
