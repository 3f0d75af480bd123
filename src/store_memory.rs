//! In-memory submission store

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::state::{OptInStatus, Submission, SubmissionId};
use crate::store::SubmissionStore;

#[derive(Debug, Default)]
pub struct MemorySubmissionStore {
    submissions: RwLock<HashMap<SubmissionId, Submission>>,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.submissions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.submissions.read().await.is_empty()
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn save(&self, submission: &Submission) -> Result<Submission> {
        let mut submissions = self.submissions.write().await;

        let persisted = match submissions.get(&submission.id) {
            // Stored status is authoritative once set
            Some(existing) if existing.opt_in_status().is_some() => {
                let mut merged = submission.clone();
                merged.adopt_status_from(existing);
                merged.updated_at = Utc::now();
                merged
            }
            _ => submission.clone(),
        };

        submissions.insert(persisted.id.clone(), persisted.clone());
        Ok(persisted)
    }

    async fn load(&self, id: &SubmissionId) -> Result<Option<Submission>> {
        Ok(self.submissions.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &SubmissionId) -> Result<bool> {
        Ok(self.submissions.write().await.remove(id).is_some())
    }

    async fn compare_and_set_status(
        &self,
        id: &SubmissionId,
        expected: OptInStatus,
        to: OptInStatus,
        reason: Option<String>,
    ) -> Result<Option<Submission>> {
        let mut submissions = self.submissions.write().await;

        let Some(submission) = submissions.get_mut(id) else {
            return Ok(None);
        };
        if submission.opt_in_status() != Some(expected) {
            return Ok(None);
        }

        submission.transition_status(to, reason)?;
        Ok(Some(submission.clone()))
    }
}
