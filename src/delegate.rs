//! Confirmation delegate seam
//!
//! The delegate issues and verifies e-mail address confirmations. It owns the
//! whole token lifecycle; this crate only asks whether an address is already
//! confirmed in a realm and requests new confirmations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mail::Message;
use crate::realm::ConfirmationRealm;
use crate::state::SubmissionId;

/// Status of a confirmation held by the delegate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// A confirmation known to the delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub confirmation_id: Uuid,
    pub address: String,
    pub realm: ConfirmationRealm,
    pub status: ConfirmationStatus,
    /// Set when the record was revoked after confirmation
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl ConfirmationRecord {
    pub fn is_confirmed(&self) -> bool {
        self.status == ConfirmationStatus::Confirmed
    }

    /// Neither cancelled, revoked nor expired at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status != ConfirmationStatus::Cancelled
            && !self.revoked
            && self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// Correlation payload handed to the delegate with a confirmation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationMetadata {
    pub submission_id: SubmissionId,
    pub form_id: String,
}

/// A confirmation challenge issued by the delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub confirmation_id: Uuid,
    pub address: String,
    pub realm: ConfirmationRealm,
    pub metadata: ConfirmationMetadata,
    /// Message reused for the notification once confirmed
    pub message: Message,
    pub requested_at: DateTime<Utc>,
}

/// External confirmation service
#[async_trait]
pub trait ConfirmationDelegate: Send + Sync {
    /// Look up a confirmation for `address` in `realm`
    ///
    /// With `only_valid`, cancelled, revoked and expired records are ignored.
    async fn get_confirmation(
        &self,
        address: &str,
        only_valid: bool,
        realm: &ConfirmationRealm,
    ) -> anyhow::Result<Option<ConfirmationRecord>>;

    /// Issue a new confirmation challenge
    async fn confirm(
        &self,
        address: &str,
        metadata: ConfirmationMetadata,
        realm: &ConfirmationRealm,
        message: &Message,
    ) -> anyhow::Result<ConfirmationRequest>;
}
