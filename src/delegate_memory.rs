//! In-memory confirmation delegate
//!
//! Keeps confirmation records and issued requests in memory. The recipient's
//! out-of-band action is simulated with [`MemoryConfirmer::mark_confirmed`].

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::delegate::{
    ConfirmationDelegate, ConfirmationMetadata, ConfirmationRecord, ConfirmationRequest,
    ConfirmationStatus,
};
use crate::mail::Message;
use crate::realm::ConfirmationRealm;

#[derive(Debug, Default)]
pub struct MemoryConfirmer {
    records: RwLock<Vec<ConfirmationRecord>>,
    requests: RwLock<Vec<ConfirmationRequest>>,
}

fn normalize(address: &str) -> String {
    address.trim().to_lowercase()
}

impl MemoryConfirmer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a confirmed record, as if the address had opted in earlier
    pub async fn seed_confirmed(&self, address: &str, realm: &ConfirmationRealm) {
        let now = Utc::now();
        self.records.write().await.push(ConfirmationRecord {
            confirmation_id: Uuid::new_v4(),
            address: normalize(address),
            realm: realm.clone(),
            status: ConfirmationStatus::Confirmed,
            revoked: false,
            expires_at: None,
            created_at: now,
            confirmed_at: Some(now),
        });
    }

    /// Confirm every pending record for `address` in `realm`
    ///
    /// Returns the requests that were confirmed so callers can route their
    /// metadata back to the submission pipeline.
    pub async fn mark_confirmed(
        &self,
        address: &str,
        realm: &ConfirmationRealm,
    ) -> Vec<ConfirmationRequest> {
        let address = normalize(address);
        let now = Utc::now();

        let mut confirmed_ids = Vec::new();
        for record in self.records.write().await.iter_mut() {
            if record.address == address
                && record.realm == *realm
                && record.status == ConfirmationStatus::Pending
            {
                record.status = ConfirmationStatus::Confirmed;
                record.confirmed_at = Some(now);
                confirmed_ids.push(record.confirmation_id);
            }
        }

        self.requests
            .read()
            .await
            .iter()
            .filter(|r| confirmed_ids.contains(&r.confirmation_id))
            .cloned()
            .collect()
    }

    /// Revoke every record for `address` in `realm`
    pub async fn revoke(&self, address: &str, realm: &ConfirmationRealm) -> usize {
        let address = normalize(address);
        let mut revoked = 0;
        for record in self.records.write().await.iter_mut() {
            if record.address == address && record.realm == *realm {
                record.revoked = true;
                revoked += 1;
            }
        }
        revoked
    }

    pub async fn requests(&self) -> Vec<ConfirmationRequest> {
        self.requests.read().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.read().await.len()
    }
}

#[async_trait]
impl ConfirmationDelegate for MemoryConfirmer {
    async fn get_confirmation(
        &self,
        address: &str,
        only_valid: bool,
        realm: &ConfirmationRealm,
    ) -> anyhow::Result<Option<ConfirmationRecord>> {
        let address = normalize(address);
        let now = Utc::now();
        let records = self.records.read().await;

        let matching = records
            .iter()
            .filter(|r| r.address == address && r.realm == *realm)
            .filter(|r| !only_valid || r.is_valid_at(now));

        // A confirmed record anywhere in the realm wins over newer pending ones
        let mut latest: Option<&ConfirmationRecord> = None;
        for record in matching {
            if record.is_confirmed() {
                return Ok(Some(record.clone()));
            }
            latest = Some(record);
        }
        Ok(latest.cloned())
    }

    async fn confirm(
        &self,
        address: &str,
        metadata: ConfirmationMetadata,
        realm: &ConfirmationRealm,
        message: &Message,
    ) -> anyhow::Result<ConfirmationRequest> {
        let address = normalize(address);
        anyhow::ensure!(!address.is_empty(), "cannot confirm an empty address");

        let now = Utc::now();
        let confirmation_id = Uuid::new_v4();

        self.records.write().await.push(ConfirmationRecord {
            confirmation_id,
            address: address.clone(),
            realm: realm.clone(),
            status: ConfirmationStatus::Pending,
            revoked: false,
            expires_at: None,
            created_at: now,
            confirmed_at: None,
        });

        let request = ConfirmationRequest {
            confirmation_id,
            address,
            realm: realm.clone(),
            metadata,
            message: message.clone(),
            requested_at: now,
        };
        self.requests.write().await.push(request.clone());

        Ok(request)
    }
}
