//! Generic sync engine.
//!
//! One pipeline run walks the pending rows of a single resource kind:
//! `Pending → [IdempotencyCheck?] → Calling → {Success | AlreadyExists |
//! TransientFailure | PermanentFailure} → Persisted`. Every per-row error is
//! caught and logged at the row boundary; only a token-endpoint failure or
//! a store connectivity failure aborts the run.

pub mod conditions;
pub mod encounters;
pub mod patients;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::registry::token::AuthError;
use crate::registry::{RegistryApi, RegistryError};
use crate::store::{ClinicalStore, Disposition, IdentifierColumn, StoreError};

/// How one row fared against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The registry yielded a fresh identifier.
    Success(String),
    /// The idempotency pre-check found the resource already present.
    AlreadyExists(String),
    /// Retryable; the row is left untouched for a later run.
    TransientFailure(String),
    /// Not retryable; the row's failure marker is written.
    PermanentFailure(String),
}

/// Errors that abort a whole pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counters accumulated over one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub pipeline: &'static str,
    pub processed: usize,
    pub succeeded: usize,
    pub already_existed: usize,
    pub transient: usize,
    pub failed: usize,
    pub store_errors: usize,
}

impl RunSummary {
    fn new(pipeline: &'static str) -> Self {
        Self {
            pipeline,
            processed: 0,
            succeeded: 0,
            already_existed: 0,
            transient: 0,
            failed: 0,
            store_errors: 0,
        }
    }

    /// Rows whose identifier column now carries a registry id.
    pub fn updated(&self) -> usize {
        self.succeeded + self.already_existed
    }
}

/// One resource kind's contribution to the engine: a selection query, an
/// optional idempotency pre-check, and the transform-and-call step.
#[async_trait]
pub trait ResourceSync {
    type Row: Send + Sync;

    fn name(&self) -> &'static str;
    fn identifier_column(&self) -> IdentifierColumn;

    async fn select_pending(&self, store: &dyn ClinicalStore) -> Result<Vec<Self::Row>, StoreError>;

    fn local_id(&self, row: &Self::Row) -> i64;

    /// Natural key used in log lines.
    fn natural_key(&self, row: &Self::Row) -> String;

    /// Look for an already-existing remote resource before creating one.
    async fn pre_check(
        &self,
        _registry: &dyn RegistryApi,
        _row: &Self::Row,
    ) -> Result<Option<String>, RegistryError> {
        Ok(None)
    }

    /// Build the payload, call the remote endpoint and interpret the 2xx
    /// body. Transport and HTTP failures are returned as errors and
    /// classified by the engine.
    async fn submit(
        &self,
        registry: &dyn RegistryApi,
        row: &Self::Row,
    ) -> Result<SyncOutcome, RegistryError>;
}

/// Run one pipeline to completion and return its counters.
pub async fn run_pipeline<P>(
    pipeline: &P,
    store: &dyn ClinicalStore,
    registry: &dyn RegistryApi,
) -> Result<RunSummary, SyncError>
where
    P: ResourceSync + Sync,
{
    let mut summary = RunSummary::new(pipeline.name());
    let rows = pipeline.select_pending(store).await?;
    if rows.is_empty() {
        info!("{}: no pending records", pipeline.name());
        return Ok(summary);
    }
    info!("{}: {} pending records", pipeline.name(), rows.len());

    for row in &rows {
        summary.processed += 1;
        let key = pipeline.natural_key(row);
        let outcome = process_row(pipeline, registry, row).await?;

        let disposition = match &outcome {
            SyncOutcome::Success(id) => {
                info!("{}: {} -> synced as {}", pipeline.name(), key, id);
                Some(Disposition::Synced(id.clone()))
            }
            SyncOutcome::AlreadyExists(id) => {
                info!("{}: {} -> already present as {}", pipeline.name(), key, id);
                Some(Disposition::Synced(id.clone()))
            }
            SyncOutcome::TransientFailure(reason) => {
                warn!("{}: {} -> left for retry: {}", pipeline.name(), key, reason);
                None
            }
            SyncOutcome::PermanentFailure(reason) => {
                error!("{}: {} -> marked failed: {}", pipeline.name(), key, reason);
                Some(Disposition::Failed(reason.clone()))
            }
        };

        if let Some(disposition) = disposition {
            if let Err(e) = store
                .record_disposition(pipeline.identifier_column(), pipeline.local_id(row), &disposition)
                .await
            {
                // The row stays eligible; the next run will redo the remote
                // call, which is safe for lookups and caught by the
                // pre-check for creates.
                warn!(
                    "{}: {} -> write-back failed, row left for next run: {}",
                    pipeline.name(),
                    key,
                    e
                );
                summary.store_errors += 1;
                continue;
            }
        }

        match outcome {
            SyncOutcome::Success(_) => summary.succeeded += 1,
            SyncOutcome::AlreadyExists(_) => summary.already_existed += 1,
            SyncOutcome::TransientFailure(_) => summary.transient += 1,
            SyncOutcome::PermanentFailure(_) => summary.failed += 1,
        }
    }

    Ok(summary)
}

async fn process_row<P>(
    pipeline: &P,
    registry: &dyn RegistryApi,
    row: &P::Row,
) -> Result<SyncOutcome, SyncError>
where
    P: ResourceSync + Sync,
{
    match pipeline.pre_check(registry, row).await {
        Ok(Some(existing)) => return Ok(SyncOutcome::AlreadyExists(existing)),
        Ok(None) => {}
        Err(e) => return classify(e),
    }
    match pipeline.submit(registry, row).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => classify(e),
    }
}

/// Map a registry error onto a per-row outcome. Auth failures are the one
/// class that escapes the row boundary and aborts the run.
fn classify(err: RegistryError) -> Result<SyncOutcome, SyncError> {
    match err {
        RegistryError::Auth(e) => Err(SyncError::Auth(e)),
        RegistryError::Network(e) => {
            let reason = if e.is_timeout() {
                format!("timeout: {e}")
            } else {
                format!("network error: {e}")
            };
            Ok(SyncOutcome::TransientFailure(reason))
        }
        RegistryError::Status { status, detail } if status.is_server_error() => {
            Ok(SyncOutcome::TransientFailure(format!("HTTP {status}: {detail}")))
        }
        RegistryError::Status { status, detail } => {
            Ok(SyncOutcome::PermanentFailure(format!("HTTP {status}: {detail}")))
        }
        RegistryError::Unauthorized => Ok(SyncOutcome::PermanentFailure(
            "unauthorized after token refresh".to_string(),
        )),
        RegistryError::InvalidJson(body) => Ok(SyncOutcome::PermanentFailure(format!(
            "response body is not JSON: {body}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing;
