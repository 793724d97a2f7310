//! In-memory fakes for the collaborator traits, shared by the pipeline
//! tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::registry::token::AuthError;
use crate::registry::{RegistryApi, RegistryError};
use crate::store::{
    ClinicalStore, Disposition, IdentifierColumn, PendingCondition, PendingEncounter,
    PendingPatient, StoreError,
};

/// One scripted registry answer, consumed in call order.
pub enum RegistryReply {
    Body(Value),
    Status(reqwest::StatusCode, String),
    Unauthorized,
    AuthFailure,
}

pub struct FakeRegistry {
    replies: Mutex<VecDeque<RegistryReply>>,
    calls: AtomicUsize,
    create_calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(replies: Vec<RegistryReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Create calls only, for idempotency assertions.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<Value, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("test scripted fewer registry replies than calls made");
        match reply {
            RegistryReply::Body(body) => Ok(body),
            RegistryReply::Status(status, detail) => Err(RegistryError::Status { status, detail }),
            RegistryReply::Unauthorized => Err(RegistryError::Unauthorized),
            RegistryReply::AuthFailure => Err(RegistryError::Auth(AuthError::MissingCredentials)),
        }
    }
}

#[async_trait]
impl RegistryApi for FakeRegistry {
    async fn patient_by_nik(&self, _nik: &str) -> Result<Value, RegistryError> {
        self.next()
    }

    async fn conditions_by_encounter(&self, _encounter_id: &str) -> Result<Value, RegistryError> {
        self.next()
    }

    async fn create_condition(&self, _payload: &Value) -> Result<Value, RegistryError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.next()
    }

    async fn complete_visit(&self, _payload: &Value) -> Result<Value, RegistryError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.next()
    }
}

#[derive(Default)]
pub struct FakeStore {
    patients: Mutex<Vec<PendingPatient>>,
    encounters: Mutex<Vec<PendingEncounter>>,
    conditions: Mutex<Vec<PendingCondition>>,
    dispositions: Mutex<Vec<(IdentifierColumn, i64, Disposition)>>,
    fail_next_write: AtomicBool,
}

impl FakeStore {
    pub fn with_patients(rows: Vec<PendingPatient>) -> Self {
        Self {
            patients: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn with_encounters(rows: Vec<PendingEncounter>) -> Self {
        Self {
            encounters: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn with_conditions(rows: Vec<PendingCondition>) -> Self {
        Self {
            conditions: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn dispositions(&self) -> Vec<(IdentifierColumn, i64, Disposition)> {
        self.dispositions.lock().unwrap().clone()
    }

    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClinicalStore for FakeStore {
    async fn pending_patients(&self) -> Result<Vec<PendingPatient>, StoreError> {
        Ok(self.patients.lock().unwrap().clone())
    }

    async fn pending_encounters(&self) -> Result<Vec<PendingEncounter>, StoreError> {
        Ok(self.encounters.lock().unwrap().clone())
    }

    async fn pending_conditions(&self) -> Result<Vec<PendingCondition>, StoreError> {
        Ok(self.conditions.lock().unwrap().clone())
    }

    async fn record_disposition(
        &self,
        column: IdentifierColumn,
        local_id: i64,
        disposition: &Disposition,
    ) -> Result<(), StoreError> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Query(sqlx::Error::PoolClosed));
        }
        // Mirror the selection predicate: a row with an identifier or a
        // failure marker is no longer pending.
        match column {
            IdentifierColumn::PatientIhs => {
                self.patients.lock().unwrap().retain(|row| row.id != local_id);
            }
            IdentifierColumn::EncounterRegistryId => {
                self.encounters.lock().unwrap().retain(|row| row.id != local_id);
            }
            IdentifierColumn::ConditionRegistryId => {
                self.conditions.lock().unwrap().retain(|row| row.id != local_id);
            }
        }
        self.dispositions
            .lock()
            .unwrap()
            .push((column, local_id, disposition.clone()));
        Ok(())
    }
}
