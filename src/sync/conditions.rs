//! Condition (diagnosis) creation.
//!
//! Conditions depend on a resolved encounter and are the one pipeline with
//! an idempotency pre-check: the registry is searched for a condition
//! already attached to the encounter before a create call is issued, so a
//! rerun after a lost write-back never duplicates the diagnosis.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use super::{ResourceSync, SyncOutcome};
use crate::registry::extract::{extract_id, IdStrategy};
use crate::registry::{RegistryApi, RegistryError};
use crate::store::{ClinicalStore, IdentifierColumn, PendingCondition, StoreError};

/// Where a condition create response hides the identifier.
const CONDITION_ID_CHAIN: &[IdStrategy] = &[
    IdStrategy::DataId,
    IdStrategy::SearchEntry,
    IdStrategy::TopLevelId,
];

#[derive(Debug, Serialize)]
pub struct ConditionPayload {
    pub clinical_status: &'static str,
    pub category_code: &'static str,
    pub icd10_code: String,
    pub icd10_display: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub encounter_id: String,
    pub encounter_display: String,
    pub additional_codes: Vec<String>,
}

/// Split a combined `"code - display"` ICD-10 string. A string without the
/// separator is taken wholly as the code.
pub fn split_icd(raw: &str) -> (String, String) {
    match raw.split_once(" - ") {
        Some((code, display)) => (code.trim().to_string(), display.trim().to_string()),
        None => (raw.trim().to_string(), String::new()),
    }
}

pub struct ConditionSync;

impl ConditionSync {
    fn build_payload(&self, row: &PendingCondition) -> ConditionPayload {
        let (icd10_code, icd10_display) = split_icd(&row.icd_raw);
        ConditionPayload {
            clinical_status: "active",
            category_code: "encounter-diagnosis",
            icd10_code,
            icd10_display,
            patient_id: row.patient_ihs.clone(),
            patient_name: row.patient_name.clone(),
            encounter_id: row.encounter_id.clone(),
            encounter_display: row.visit_id.clone(),
            additional_codes: Vec::new(),
        }
    }
}

#[async_trait]
impl ResourceSync for ConditionSync {
    type Row = PendingCondition;

    fn name(&self) -> &'static str {
        "condition"
    }

    fn identifier_column(&self) -> IdentifierColumn {
        IdentifierColumn::ConditionRegistryId
    }

    async fn select_pending(
        &self,
        store: &dyn ClinicalStore,
    ) -> Result<Vec<PendingCondition>, StoreError> {
        store.pending_conditions().await
    }

    fn local_id(&self, row: &PendingCondition) -> i64 {
        row.id
    }

    fn natural_key(&self, row: &PendingCondition) -> String {
        format!("visit={}", row.visit_id)
    }

    async fn pre_check(
        &self,
        registry: &dyn RegistryApi,
        row: &PendingCondition,
    ) -> Result<Option<String>, RegistryError> {
        match registry.conditions_by_encounter(&row.encounter_id).await {
            Ok(body) => Ok(extract_id(&body, &[IdStrategy::SearchEntry])),
            Err(RegistryError::Status { status, detail }) => {
                // The search endpoint failing is not proof the condition is
                // absent, but creation is the only way forward for the row.
                warn!(
                    "condition pre-check for visit {} answered HTTP {status}, attempting creation: {detail}",
                    row.visit_id
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn submit(
        &self,
        registry: &dyn RegistryApi,
        row: &PendingCondition,
    ) -> Result<SyncOutcome, RegistryError> {
        let payload = match serde_json::to_value(self.build_payload(row)) {
            Ok(value) => value,
            Err(e) => {
                return Ok(SyncOutcome::PermanentFailure(format!(
                    "payload serialization failed: {e}"
                )))
            }
        };

        let body = registry.create_condition(&payload).await?;
        match extract_id(&body, CONDITION_ID_CHAIN) {
            Some(id) => Ok(SyncOutcome::Success(id)),
            None => Ok(SyncOutcome::PermanentFailure(
                "response carried no condition identifier".to_string(),
            )),
        }
    }
}
