//! Local clinical store collaborator.
//!
//! The store is the hospital's operational MySQL database. The sync engine
//! reads joined pending rows and writes back exactly one identifier column
//! (or its sibling failure marker) per row; it never creates or deletes
//! clinical rows. Pipelines depend on the `ClinicalStore` trait so they can
//! run against an in-memory fake in tests.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to the clinical store: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("clinical store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// A patient row awaiting identity resolution.
#[derive(Debug, Clone, FromRow)]
pub struct PendingPatient {
    pub id: i64,
    pub medical_record_no: String,
    pub nik: String,
    pub name: Option<String>,
}

/// A visit row awaiting encounter creation.
#[derive(Debug, Clone, FromRow)]
pub struct PendingEncounter {
    pub id: i64,
    pub visit_id: String,
    pub admitted_at: String,
    pub discharged_at: Option<String>,
    pub patient_ihs: String,
    pub patient_name: Option<String>,
    pub practitioner_ihs: String,
    pub practitioner_name: Option<String>,
    pub location_id: Option<String>,
    pub location_name: Option<String>,
    pub physical_exam: Option<String>,
}

/// A visit row awaiting condition creation.
#[derive(Debug, Clone, FromRow)]
pub struct PendingCondition {
    pub id: i64,
    pub visit_id: String,
    pub icd_raw: String,
    pub encounter_id: String,
    pub patient_ihs: String,
    pub patient_name: Option<String>,
}

/// Result of processing one row, as far as the store is concerned.
///
/// The identifier column is never overloaded with a reserved value: a
/// permanent failure is recorded in the column's sibling failure marker,
/// keeping "never attempted" (both NULL) distinct from "attempted and
/// failed" without corrupting the identifier space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Synced(String),
    Failed(String),
}

/// The one identifier column a pipeline is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierColumn {
    PatientIhs,
    EncounterRegistryId,
    ConditionRegistryId,
}

fn update_sql(column: IdentifierColumn, disposition: &Disposition) -> &'static str {
    match (column, disposition) {
        (IdentifierColumn::PatientIhs, Disposition::Synced(_)) => {
            "UPDATE pasien SET ihs = ?, ihs_sync_error = NULL WHERE id = ?"
        }
        (IdentifierColumn::PatientIhs, Disposition::Failed(_)) => {
            "UPDATE pasien SET ihs_sync_error = ? WHERE id = ?"
        }
        (IdentifierColumn::EncounterRegistryId, Disposition::Synced(_)) => {
            "UPDATE rawat SET id_encounter = ?, encounter_sync_error = NULL WHERE id = ?"
        }
        (IdentifierColumn::EncounterRegistryId, Disposition::Failed(_)) => {
            "UPDATE rawat SET encounter_sync_error = ? WHERE id = ?"
        }
        (IdentifierColumn::ConditionRegistryId, Disposition::Synced(_)) => {
            "UPDATE rawat SET id_condition = ?, condition_sync_error = NULL WHERE id = ?"
        }
        (IdentifierColumn::ConditionRegistryId, Disposition::Failed(_)) => {
            "UPDATE rawat SET condition_sync_error = ? WHERE id = ?"
        }
    }
}

/// Read/write surface the sync engine needs from the store.
#[async_trait]
pub trait ClinicalStore: Send + Sync {
    async fn pending_patients(&self) -> Result<Vec<PendingPatient>, StoreError>;
    async fn pending_encounters(&self) -> Result<Vec<PendingEncounter>, StoreError>;
    async fn pending_conditions(&self) -> Result<Vec<PendingCondition>, StoreError>;

    /// Set one identifier column (or its failure marker) by local row id.
    async fn record_disposition(
        &self,
        column: IdentifierColumn,
        local_id: i64,
        disposition: &Disposition,
    ) -> Result<(), StoreError>;
}

pub struct LocalStore {
    pool: MySqlPool,
}

impl LocalStore {
    /// Connect with a single pooled connection; processing is strictly
    /// sequential and the design assumes one process per pipeline.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(StoreError::Connect)?;
        info!("connected to clinical store");
        Ok(Self { pool })
    }
}

#[async_trait]
impl ClinicalStore for LocalStore {
    async fn pending_patients(&self) -> Result<Vec<PendingPatient>, StoreError> {
        let rows = sqlx::query_as::<_, PendingPatient>(
            r"SELECT pasien.id AS id,
                     pasien.no_rm AS medical_record_no,
                     pasien.nik AS nik,
                     pasien.nama_pasien AS name
              FROM pasien
              WHERE (pasien.ihs IS NULL OR pasien.ihs = '')
                AND pasien.ihs_sync_error IS NULL
                AND pasien.nik IS NOT NULL
                AND pasien.nik != ''
              ORDER BY pasien.tgldaftar DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn pending_encounters(&self) -> Result<Vec<PendingEncounter>, StoreError> {
        // pasien.ihs = '1' guards against a placeholder an earlier sync tool
        // wrote into the identifier column; those rows are not usable
        // upstream references.
        let rows = sqlx::query_as::<_, PendingEncounter>(
            r"SELECT rawat.id AS id,
                     rawat.idrawat AS visit_id,
                     DATE_FORMAT(rawat.tglmasuk, '%Y-%m-%d %H:%i:%s') AS admitted_at,
                     DATE_FORMAT(rawat.tglpulang, '%Y-%m-%d %H:%i:%s') AS discharged_at,
                     pasien.ihs AS patient_ihs,
                     pasien.nama_pasien AS patient_name,
                     dokter.kode_ihs AS practitioner_ihs,
                     dokter.nama_dokter AS practitioner_name,
                     organisasi_satusehat.id_location AS location_id,
                     organisasi_satusehat.nama_organisasi AS location_name,
                     demo_detail_rekap_medis.pemeriksaan_fisik AS physical_exam
              FROM rawat
              INNER JOIN pasien ON pasien.no_rm = rawat.no_rm
              INNER JOIN dokter ON dokter.id = rawat.iddokter
              INNER JOIN poli ON poli.id = rawat.idpoli
              INNER JOIN organisasi_satusehat ON organisasi_satusehat.id_ruangan = poli.kode
              INNER JOIN demo_rekap_medis ON demo_rekap_medis.idrawat = rawat.id
              INNER JOIN demo_detail_rekap_medis ON demo_detail_rekap_medis.idrekapmedis = demo_rekap_medis.id
              WHERE pasien.ihs IS NOT NULL AND pasien.ihs != '' AND pasien.ihs != '1'
                AND dokter.kode_ihs IS NOT NULL AND dokter.kode_ihs != ''
                AND rawat.idrawat IS NOT NULL AND rawat.idrawat != ''
                AND (rawat.id_encounter IS NULL OR rawat.id_encounter = '')
                AND rawat.encounter_sync_error IS NULL
                AND rawat.tglmasuk IS NOT NULL
                AND YEAR(rawat.tglmasuk) BETWEEN 2024 AND 2025
                AND rawat.idjenisrawat = 1
              ORDER BY rawat.tglmasuk DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn pending_conditions(&self) -> Result<Vec<PendingCondition>, StoreError> {
        let rows = sqlx::query_as::<_, PendingCondition>(
            r"SELECT rawat.id AS id,
                     rawat.idrawat AS visit_id,
                     rawat.icdx AS icd_raw,
                     rawat.id_encounter AS encounter_id,
                     pasien.ihs AS patient_ihs,
                     pasien.nama_pasien AS patient_name
              FROM rawat
              INNER JOIN pasien ON pasien.no_rm = rawat.no_rm
              WHERE pasien.ihs IS NOT NULL AND pasien.ihs != '' AND pasien.ihs != '1'
                AND rawat.idrawat IS NOT NULL AND rawat.idrawat != ''
                AND rawat.id_encounter IS NOT NULL AND rawat.id_encounter != ''
                AND (rawat.id_condition IS NULL OR rawat.id_condition = '')
                AND rawat.condition_sync_error IS NULL
                AND rawat.icdx IS NOT NULL AND rawat.icdx != ''
                AND rawat.tglmasuk IS NOT NULL
                AND YEAR(rawat.tglmasuk) BETWEEN 2024 AND 2025
                AND rawat.idjenisrawat = 1
              ORDER BY rawat.tglmasuk ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_disposition(
        &self,
        column: IdentifierColumn,
        local_id: i64,
        disposition: &Disposition,
    ) -> Result<(), StoreError> {
        let value = match disposition {
            Disposition::Synced(id) => id,
            Disposition::Failed(reason) => reason,
        };
        sqlx::query(update_sql(column, disposition))
            .bind(value)
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
