use crate::state::{OptInStatus, Submission, SubmissionId};
use async_trait::async_trait;
use anyhow::Result;

/// Persistence trait for submission records.
///
/// Handlers and the pipeline operate exclusively through this trait, so the
/// storage collaborator can be swapped (MemorySubmissionStore for embedding
/// and tests, a database-backed store in production).
///
/// The opt-in status is owned by [`SubmissionStore::compare_and_set_status`]:
/// `save` on an existing record keeps the stored status and history, so a
/// stale copy can never move the status backwards.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Insert or update a record and return the persisted copy.
    async fn save(&self, submission: &Submission) -> Result<Submission>;
    async fn load(&self, id: &SubmissionId) -> Result<Option<Submission>>;
    /// Remove a record. Returns `false` when it did not exist.
    async fn delete(&self, id: &SubmissionId) -> Result<bool>;

    /// Atomically move the status from `expected` to `to`.
    ///
    /// Returns the updated record, or `None` when the stored status is not
    /// `expected` (another save claimed it first) or the record is gone.
    async fn compare_and_set_status(
        &self,
        id: &SubmissionId,
        expected: OptInStatus,
        to: OptInStatus,
        reason: Option<String>,
    ) -> Result<Option<Submission>>;
}
