//! Encounter creation via the composite visit-completion endpoint.
//!
//! One call creates consent, encounter and vital-sign records remotely;
//! only the encounter identifier is extracted and persisted locally. The
//! payload carries the clamped visit period and the decomposed vitals so
//! remote validation never sees an out-of-window instant or a combined
//! blood-pressure string.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use super::{ResourceSync, SyncOutcome};
use crate::normalize::{derive_period, parse_physical_exam, Coerced, NormalizeError};
use crate::registry::extract::{extract_id, IdStrategy};
use crate::registry::{RegistryApi, RegistryError};
use crate::store::{ClinicalStore, IdentifierColumn, PendingEncounter, StoreError};

const ENCOUNTER_CLASS_CODE: &str = "AMB";
const ENCOUNTER_CLASS_DISPLAY: &str = "ambulatory";

/// Where the composite response hides the encounter identifier, in the
/// order the shapes have been observed.
const ENCOUNTER_ID_CHAIN: &[IdStrategy] = &[
    IdStrategy::WorkflowSection("consent"),
    IdStrategy::WorkflowField("encounter", "encounter_id"),
    IdStrategy::DataId,
    IdStrategy::TopLevelId,
];

#[derive(Debug, Serialize)]
pub struct CompleteVisitRequest {
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub practitioner_id: String,
    pub practitioner_name: Option<String>,
    pub organization_id: String,
    pub encounter_identifier_system: String,
    pub encounter_identifier_value: String,
    pub encounter_class_code: &'static str,
    pub encounter_class_display: &'static str,
    pub period_start: String,
    pub period_end: String,
    pub location_id: Option<String>,
    pub location_display: Option<String>,
    pub diagnosis_list: Vec<String>,
    pub temperature: Coerced,
    pub heart_rate: Coerced,
    pub respiratory_rate: Coerced,
    pub systolic_bp: Coerced,
    // The workflow API still expects the diastolic reading under this
    // historical field name.
    #[serde(rename = "diastolic_80p")]
    pub diastolic_bp: Coerced,
    pub consent_action: &'static str,
    pub consent_agent: &'static str,
    pub skip_consent: bool,
    pub skip_vital_signs: bool,
    pub skip_conditions: bool,
    pub auto_finish_encounter: bool,
}

pub struct EncounterSync {
    organization_id: String,
}

impl EncounterSync {
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
        }
    }

    fn build_payload(
        &self,
        row: &PendingEncounter,
        now: chrono::DateTime<Utc>,
    ) -> Result<CompleteVisitRequest, NormalizeError> {
        let period = derive_period(&row.admitted_at, row.discharged_at.as_deref(), now)?;
        let vitals = parse_physical_exam(row.physical_exam.as_deref());

        Ok(CompleteVisitRequest {
            patient_id: row.patient_ihs.clone(),
            patient_name: row.patient_name.clone(),
            practitioner_id: row.practitioner_ihs.clone(),
            practitioner_name: row.practitioner_name.clone(),
            organization_id: self.organization_id.clone(),
            encounter_identifier_system: format!(
                "http://sys-ids.kemkes.go.id/encounter/{}",
                self.organization_id
            ),
            encounter_identifier_value: row.visit_id.clone(),
            encounter_class_code: ENCOUNTER_CLASS_CODE,
            encounter_class_display: ENCOUNTER_CLASS_DISPLAY,
            period_start: period.start,
            period_end: period.end,
            location_id: row.location_id.clone(),
            location_display: row.location_name.clone(),
            diagnosis_list: Vec::new(),
            temperature: vitals.temperature,
            heart_rate: vitals.heart_rate,
            respiratory_rate: vitals.respiratory_rate,
            systolic_bp: vitals.systolic_bp,
            diastolic_bp: vitals.diastolic_bp,
            consent_action: "OPTIN",
            consent_agent: "System",
            skip_consent: false,
            skip_vital_signs: false,
            skip_conditions: false,
            auto_finish_encounter: false,
        })
    }
}

#[async_trait]
impl ResourceSync for EncounterSync {
    type Row = PendingEncounter;

    fn name(&self) -> &'static str {
        "encounter"
    }

    fn identifier_column(&self) -> IdentifierColumn {
        IdentifierColumn::EncounterRegistryId
    }

    async fn select_pending(
        &self,
        store: &dyn ClinicalStore,
    ) -> Result<Vec<PendingEncounter>, StoreError> {
        store.pending_encounters().await
    }

    fn local_id(&self, row: &PendingEncounter) -> i64 {
        row.id
    }

    fn natural_key(&self, row: &PendingEncounter) -> String {
        format!("visit={}", row.visit_id)
    }

    async fn submit(
        &self,
        registry: &dyn RegistryApi,
        row: &PendingEncounter,
    ) -> Result<SyncOutcome, RegistryError> {
        let payload = match self.build_payload(row, Utc::now()) {
            Ok(payload) => payload,
            Err(e) => {
                return Ok(SyncOutcome::PermanentFailure(format!(
                    "unusable admission timestamp: {e}"
                )))
            }
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                return Ok(SyncOutcome::PermanentFailure(format!(
                    "payload serialization failed: {e}"
                )))
            }
        };

        let body = registry.complete_visit(&payload).await?;
        match extract_id(&body, ENCOUNTER_ID_CHAIN) {
            Some(id) => Ok(SyncOutcome::Success(id)),
            None => Ok(SyncOutcome::PermanentFailure(
                "response carried no encounter identifier".to_string(),
            )),
        }
    }
}
