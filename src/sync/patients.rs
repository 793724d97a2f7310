//! Patient identity resolution.
//!
//! A read-only lookup: the registry is searched by national identity
//! number and the matching patient's IHS number is written back. No
//! resource is ever created on the remote side.

use async_trait::async_trait;
use serde_json::Value;

use super::{ResourceSync, SyncOutcome};
use crate::registry::extract::{extract_id, IdStrategy};
use crate::registry::{RegistryApi, RegistryError};
use crate::store::{ClinicalStore, IdentifierColumn, PendingPatient, StoreError};

/// A NIK is a fixed-width all-digit string; the registry rejects anything
/// else outright.
pub const NIK_LENGTH: usize = 16;

pub struct PatientIdentitySync;

fn valid_nik(nik: &str) -> bool {
    nik.len() == NIK_LENGTH && nik.bytes().all(|b| b.is_ascii_digit())
}

fn search_is_empty(body: &Value) -> bool {
    let entries = body["entry"]
        .as_array()
        .or_else(|| body["data"]["entry"].as_array());
    entries.map_or(true, |entries| entries.is_empty())
}

#[async_trait]
impl ResourceSync for PatientIdentitySync {
    type Row = PendingPatient;

    fn name(&self) -> &'static str {
        "patient-identity"
    }

    fn identifier_column(&self) -> IdentifierColumn {
        IdentifierColumn::PatientIhs
    }

    async fn select_pending(
        &self,
        store: &dyn ClinicalStore,
    ) -> Result<Vec<PendingPatient>, StoreError> {
        store.pending_patients().await
    }

    fn local_id(&self, row: &PendingPatient) -> i64 {
        row.id
    }

    fn natural_key(&self, row: &PendingPatient) -> String {
        format!("nik={}", row.nik)
    }

    async fn submit(
        &self,
        registry: &dyn RegistryApi,
        row: &PendingPatient,
    ) -> Result<SyncOutcome, RegistryError> {
        if !valid_nik(&row.nik) {
            return Ok(SyncOutcome::PermanentFailure(format!(
                "NIK is not a {NIK_LENGTH}-digit number: {:?}",
                row.nik
            )));
        }

        let body = registry.patient_by_nik(&row.nik).await?;
        if let Some(id) = extract_id(&body, &[IdStrategy::SearchEntry]) {
            return Ok(SyncOutcome::Success(id));
        }
        if search_is_empty(&body) {
            // The patient may simply not be registered with the national
            // registry yet; the row stays eligible for later runs.
            Ok(SyncOutcome::TransientFailure(
                "no matching patient in the registry".to_string(),
            ))
        } else {
            Ok(SyncOutcome::PermanentFailure(
                "search result carried no patient identifier".to_string(),
            ))
        }
    }
}
