//! Database query functions for cases, clusters, claims, and audit
//! history.
//!
//! All functions take `&dyn Database` and use raw SQL with `$n`
//! placeholders via `query_raw_params()` / `exec_raw_params()`.
//! Deterministic primary keys plus `ON CONFLICT DO NOTHING` make every
//! write idempotent under retry, which is what allows a failed
//! processing date to be re-claimed without double-counting.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use episignal_case_models::{AdminHierarchy, AreaType, PatientCase};
use episignal_cluster_models::{
    AcceptStatus, AdditionType, AlgorithmType, Assignment, ClaimStatus, Cluster, MergeRecord,
    ProcessingClaim,
};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};

use crate::DbError;

/// Geocoding completeness counts for one source date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateCompleteness {
    /// The entry date.
    pub date: NaiveDate,
    /// Total case records on that date.
    pub total: i64,
    /// Records with usable (non-null, non-zero) coordinates.
    pub geocoded: i64,
}

impl DateCompleteness {
    /// Fraction of records with usable coordinates, 1.0 for an empty
    /// date.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.geocoded as f64 / self.total as f64
        }
    }
}

/// Aggregate counts for the status endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSummary {
    /// Dates with a COMPLETED claim.
    pub dates_processed: i64,
    /// Most recent `last_update_date` across clusters.
    pub last_processed_date: Option<NaiveDate>,
    /// Total cluster rows.
    pub total_clusters: i64,
    /// ABC cluster rows.
    pub abc_clusters: i64,
    /// GIS cluster rows.
    pub gis_clusters: i64,
    /// Clusters with `ACCEPTED` status.
    pub accepted: i64,
    /// Clusters still pending review.
    pub pending: i64,
    /// Sum of `patient_count`.
    pub total_patients: i64,
    /// Sum of `expansion_count`.
    pub total_expansions: i64,
}

/// One member case of a cluster, joined with its assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterPatient {
    /// The member case.
    pub case: PatientCase,
    /// How the case entered the cluster.
    pub addition_type: AdditionType,
    /// Expansion date, `None` for original members.
    pub expansion_date: Option<NaiveDate>,
}

fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> Result<NaiveDate, DbError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DbError::conversion(format!("Invalid date '{s}': {e}")))
}

fn ts_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::conversion(format!("Invalid timestamp '{s}': {e}")))
}

fn parse_enum<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, DbError> {
    s.parse()
        .map_err(|_| DbError::conversion(format!("Invalid {what}: '{s}'")))
}

fn opt_string(value: Option<String>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, DatabaseValue::String)
}

fn opt_real(value: Option<f64>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, DatabaseValue::Real64)
}

// ---------------------------------------------------------------------------
// Patient cases
// ---------------------------------------------------------------------------

/// Inserts a patient case record.
///
/// Cases are normally populated by the upstream ingestion collaborator;
/// this is used by tests and local seeding tools. Idempotent on
/// `unique_id`.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn insert_patient_case(db: &dyn Database, case: &PatientCase) -> Result<(), DbError> {
    db.exec_raw_params(
        "INSERT INTO patient_cases (
            unique_id, entry_date, area_type, syndrome,
            state, district, subdistrict, village,
            latitude, longitude, address
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (unique_id) DO NOTHING",
        &[
            DatabaseValue::String(case.unique_id.clone()),
            DatabaseValue::String(date_str(case.entry_date)),
            DatabaseValue::String(case.area_type.to_string()),
            DatabaseValue::String(case.syndrome.clone()),
            opt_string(case.admin.state.clone()),
            opt_string(case.admin.district.clone()),
            opt_string(case.admin.subdistrict.clone()),
            opt_string(case.admin.village.clone()),
            opt_real(case.latitude),
            opt_real(case.longitude),
            opt_string(case.address.clone()),
        ],
    )
    .await?;
    Ok(())
}

fn case_from_row(row: &switchy_database::Row) -> Result<PatientCase, DbError> {
    let entry_date: String = row
        .to_value("entry_date")
        .map_err(|e| DbError::conversion(format!("entry_date: {e}")))?;
    let area_type: String = row
        .to_value("area_type")
        .map_err(|e| DbError::conversion(format!("area_type: {e}")))?;

    Ok(PatientCase {
        unique_id: row
            .to_value("unique_id")
            .map_err(|e| DbError::conversion(format!("unique_id: {e}")))?,
        entry_date: parse_date(&entry_date)?,
        area_type: parse_enum::<AreaType>(&area_type, "area type")?,
        syndrome: row
            .to_value("syndrome")
            .map_err(|e| DbError::conversion(format!("syndrome: {e}")))?,
        admin: AdminHierarchy {
            state: row.to_value("state").unwrap_or(None),
            district: row.to_value("district").unwrap_or(None),
            subdistrict: row.to_value("subdistrict").unwrap_or(None),
            village: row.to_value("village").unwrap_or(None),
        },
        latitude: row.to_value("latitude").unwrap_or(None),
        longitude: row.to_value("longitude").unwrap_or(None),
        address: row.to_value("address").unwrap_or(None),
    })
}

/// Fetches cases of one area type inside a trailing entry-date window
/// `(from, to]`.
///
/// Both clustering passes consume only geocoded cases, so rows without
/// usable coordinates (NULL or the `(0, 0)` sentinel) are filtered out
/// in SQL.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn cases_in_window(
    db: &dyn Database,
    area_type: AreaType,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<PatientCase>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT * FROM patient_cases
             WHERE area_type = $1
               AND latitude IS NOT NULL AND longitude IS NOT NULL
               AND latitude != 0 AND longitude != 0
               AND entry_date > $2 AND entry_date <= $3
             ORDER BY unique_id",
            &[
                DatabaseValue::String(area_type.to_string()),
                DatabaseValue::String(date_str(from)),
                DatabaseValue::String(date_str(to)),
            ],
        )
        .await?;

    rows.iter().map(case_from_row).collect()
}

/// Geocoding completeness per entry date since `since`, ascending.
///
/// Coordinates of exactly `(0, 0)` count as not geocoded — that is the
/// sentinel some upstream forms write for "unknown".
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn date_completeness(
    db: &dyn Database,
    since: NaiveDate,
) -> Result<Vec<DateCompleteness>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT entry_date,
                    COUNT(*) AS total,
                    COALESCE(SUM(CASE
                        WHEN latitude IS NOT NULL AND longitude IS NOT NULL
                         AND latitude != 0 AND longitude != 0
                        THEN 1 ELSE 0 END), 0) AS geocoded
             FROM patient_cases
             WHERE entry_date >= $1
             GROUP BY entry_date
             ORDER BY entry_date ASC",
            &[DatabaseValue::String(date_str(since))],
        )
        .await?;

    rows.iter()
        .map(|row| {
            let date: String = row
                .to_value("entry_date")
                .map_err(|e| DbError::conversion(format!("entry_date: {e}")))?;
            Ok(DateCompleteness {
                date: parse_date(&date)?,
                total: row
                    .to_value("total")
                    .map_err(|e| DbError::conversion(format!("total: {e}")))?,
                geocoded: row
                    .to_value("geocoded")
                    .map_err(|e| DbError::conversion(format!("geocoded: {e}")))?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Processing claims
// ---------------------------------------------------------------------------

/// Atomically claims a date for a worker.
///
/// Inserts an `IN_PROGRESS` claim row; an existing `FAILED` claim is
/// taken over, while `IN_PROGRESS` and `COMPLETED` rows win the
/// conflict. Returns `true` when the claim was acquired. The insert is
/// the sole linearization point between racing workers.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn try_claim_date(
    db: &dyn Database,
    date: NaiveDate,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let affected = db
        .exec_raw_params(
            "INSERT INTO processing_claims (date, status, worker_id, started_at, completed_at)
             VALUES ($1, 'IN_PROGRESS', $2, $3, NULL)
             ON CONFLICT (date) DO UPDATE SET
                 status = 'IN_PROGRESS',
                 worker_id = excluded.worker_id,
                 started_at = excluded.started_at,
                 completed_at = NULL
             WHERE processing_claims.status = 'FAILED'",
            &[
                DatabaseValue::String(date_str(date)),
                DatabaseValue::String(worker_id.to_string()),
                DatabaseValue::String(ts_str(now)),
            ],
        )
        .await?;

    Ok(affected == 1)
}

/// Moves a worker's `IN_PROGRESS` claim to a terminal status.
///
/// Guarded by `worker_id` and the non-terminal status, so calling twice
/// (or from a worker that lost the claim) is a no-op. Returns the
/// number of rows updated (0 or 1).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn finish_claim(
    db: &dyn Database,
    date: NaiveDate,
    worker_id: &str,
    status: ClaimStatus,
    now: DateTime<Utc>,
) -> Result<u64, DbError> {
    let affected = db
        .exec_raw_params(
            "UPDATE processing_claims
             SET status = $3, completed_at = $4
             WHERE date = $1 AND worker_id = $2 AND status = 'IN_PROGRESS'",
            &[
                DatabaseValue::String(date_str(date)),
                DatabaseValue::String(worker_id.to_string()),
                DatabaseValue::String(status.to_string()),
                DatabaseValue::String(ts_str(now)),
            ],
        )
        .await?;

    Ok(affected)
}

/// Marks `IN_PROGRESS` claims started before `cutoff` as `FAILED`.
///
/// Recovers dates orphaned by crashed workers so they become claimable
/// again. Returns the number of claims expired.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn expire_stale_claims(
    db: &dyn Database,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64, DbError> {
    let affected = db
        .exec_raw_params(
            "UPDATE processing_claims
             SET status = 'FAILED', completed_at = $2
             WHERE status = 'IN_PROGRESS' AND started_at < $1",
            &[
                DatabaseValue::String(ts_str(cutoff)),
                DatabaseValue::String(ts_str(now)),
            ],
        )
        .await?;

    Ok(affected)
}

/// Dates that are claimed or already processed (`IN_PROGRESS` or
/// `COMPLETED`). `FAILED` dates are deliberately excluded so they stay
/// eligible for retry.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn claimed_dates(db: &dyn Database) -> Result<BTreeSet<NaiveDate>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT date FROM processing_claims
             WHERE status IN ('IN_PROGRESS', 'COMPLETED')",
            &[],
        )
        .await?;

    rows.iter()
        .map(|row| {
            let date: String = row
                .to_value("date")
                .map_err(|e| DbError::conversion(format!("date: {e}")))?;
            parse_date(&date)
        })
        .collect()
}

/// Fetches the claim row for one date, if any.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_claim(
    db: &dyn Database,
    date: NaiveDate,
) -> Result<Option<ProcessingClaim>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT * FROM processing_claims WHERE date = $1",
            &[DatabaseValue::String(date_str(date))],
        )
        .await?;

    let Some(row) = rows.first() else {
        return Ok(None);
    };

    let date_s: String = row
        .to_value("date")
        .map_err(|e| DbError::conversion(format!("date: {e}")))?;
    let status: String = row
        .to_value("status")
        .map_err(|e| DbError::conversion(format!("status: {e}")))?;
    let started_at: String = row
        .to_value("started_at")
        .map_err(|e| DbError::conversion(format!("started_at: {e}")))?;
    let completed_at: Option<String> = row.to_value("completed_at").unwrap_or(None);

    Ok(Some(ProcessingClaim {
        date: parse_date(&date_s)?,
        status: parse_enum::<ClaimStatus>(&status, "claim status")?,
        worker_id: row
            .to_value("worker_id")
            .map_err(|e| DbError::conversion(format!("worker_id: {e}")))?,
        started_at: parse_ts(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
    }))
}

/// Number of dates processed to completion.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn completed_date_count(db: &dyn Database) -> Result<i64, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT COUNT(*) AS n FROM processing_claims WHERE status = 'COMPLETED'",
            &[],
        )
        .await?;

    rows.first().map_or(Ok(0), |row| {
        row.to_value("n")
            .map_err(|e| DbError::conversion(format!("n: {e}")))
    })
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

fn cluster_from_row(row: &switchy_database::Row) -> Result<Cluster, DbError> {
    let algorithm: String = row
        .to_value("algorithm_type")
        .map_err(|e| DbError::conversion(format!("algorithm_type: {e}")))?;
    let status: String = row
        .to_value("accept_status")
        .map_err(|e| DbError::conversion(format!("accept_status: {e}")))?;
    let created: String = row
        .to_value("original_creation_date")
        .map_err(|e| DbError::conversion(format!("original_creation_date: {e}")))?;
    let updated: String = row
        .to_value("last_update_date")
        .map_err(|e| DbError::conversion(format!("last_update_date: {e}")))?;
    let created_at: String = row
        .to_value("created_at")
        .map_err(|e| DbError::conversion(format!("created_at: {e}")))?;

    Ok(Cluster {
        cluster_id: row
            .to_value("cluster_id")
            .map_err(|e| DbError::conversion(format!("cluster_id: {e}")))?,
        algorithm_type: parse_enum::<AlgorithmType>(&algorithm, "algorithm type")?,
        syndrome: row
            .to_value("syndrome")
            .map_err(|e| DbError::conversion(format!("syndrome: {e}")))?,
        location_code: row
            .to_value("location_code")
            .map_err(|e| DbError::conversion(format!("location_code: {e}")))?,
        village: row.to_value("village").unwrap_or(None),
        original_creation_date: parse_date(&created)?,
        last_update_date: parse_date(&updated)?,
        centroid_lat: row.to_value("centroid_lat").unwrap_or(None),
        centroid_lon: row.to_value("centroid_lon").unwrap_or(None),
        radius_meters: row.to_value("radius_meters").unwrap_or(None),
        patient_count: row
            .to_value("patient_count")
            .map_err(|e| DbError::conversion(format!("patient_count: {e}")))?,
        expansion_count: row
            .to_value("expansion_count")
            .map_err(|e| DbError::conversion(format!("expansion_count: {e}")))?,
        accept_status: parse_enum::<AcceptStatus>(&status, "accept status")?,
        created_at: parse_ts(&created_at)?,
    })
}

/// Inserts a cluster row. Idempotent on `cluster_id`.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn insert_cluster(db: &dyn Database, cluster: &Cluster) -> Result<(), DbError> {
    db.exec_raw_params(
        "INSERT INTO clusters (
            cluster_id, algorithm_type, syndrome, location_code, village,
            original_creation_date, last_update_date,
            centroid_lat, centroid_lon, radius_meters,
            patient_count, expansion_count, accept_status, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (cluster_id) DO NOTHING",
        &[
            DatabaseValue::String(cluster.cluster_id.clone()),
            DatabaseValue::String(cluster.algorithm_type.to_string()),
            DatabaseValue::String(cluster.syndrome.clone()),
            DatabaseValue::String(cluster.location_code.clone()),
            opt_string(cluster.village.clone()),
            DatabaseValue::String(date_str(cluster.original_creation_date)),
            DatabaseValue::String(date_str(cluster.last_update_date)),
            opt_real(cluster.centroid_lat),
            opt_real(cluster.centroid_lon),
            opt_real(cluster.radius_meters),
            DatabaseValue::Int64(cluster.patient_count),
            DatabaseValue::Int64(cluster.expansion_count),
            DatabaseValue::String(cluster.accept_status.to_string()),
            DatabaseValue::String(ts_str(cluster.created_at)),
        ],
    )
    .await?;
    Ok(())
}

/// Next 1-based sequence number for cluster ids sharing `prefix`.
///
/// Sequence numbers are only unique per (algorithm, location, syndrome,
/// date) prefix, which is exactly what the id format encodes.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn next_cluster_sequence(db: &dyn Database, prefix: &str) -> Result<u32, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT COUNT(*) AS n FROM clusters WHERE cluster_id LIKE $1",
            &[DatabaseValue::String(format!("{prefix}%"))],
        )
        .await?;

    let existing: i64 = rows.first().map_or(Ok(0), |row| {
        row.to_value("n")
            .map_err(|e| DbError::conversion(format!("n: {e}")))
    })?;

    Ok(u32::try_from(existing).unwrap_or(0) + 1)
}

/// Fetches one cluster by id.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn get_cluster(db: &dyn Database, cluster_id: &str) -> Result<Option<Cluster>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT * FROM clusters WHERE cluster_id = $1",
            &[DatabaseValue::String(cluster_id.to_string())],
        )
        .await?;

    rows.first().map(cluster_from_row).transpose()
}

/// Non-rejected clusters of one algorithm type created within the
/// history window `[since, ..]`, oldest first.
///
/// Oldest-first ordering is what makes continuity ties resolve toward
/// the oldest still-open signal.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn recent_clusters(
    db: &dyn Database,
    algorithm: AlgorithmType,
    since: NaiveDate,
) -> Result<Vec<Cluster>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT * FROM clusters
             WHERE algorithm_type = $1
               AND original_creation_date >= $2
               AND accept_status != 'REJECTED'
             ORDER BY original_creation_date ASC, cluster_id ASC",
            &[
                DatabaseValue::String(algorithm.to_string()),
                DatabaseValue::String(date_str(since)),
            ],
        )
        .await?;

    rows.iter().map(cluster_from_row).collect()
}

/// Lists clusters created on or after `since` (all clusters when
/// `since` is `None`), newest first.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn list_clusters(
    db: &dyn Database,
    since: Option<NaiveDate>,
) -> Result<Vec<Cluster>, DbError> {
    let rows = match since {
        Some(since) => {
            db.query_raw_params(
                "SELECT * FROM clusters
                 WHERE original_creation_date >= $1
                 ORDER BY created_at DESC",
                &[DatabaseValue::String(date_str(since))],
            )
            .await?
        }
        None => {
            db.query_raw_params("SELECT * FROM clusters ORDER BY created_at DESC", &[])
                .await?
        }
    };

    rows.iter().map(cluster_from_row).collect()
}

/// Applies an auto-merge expansion to a cluster row: bumps
/// `patient_count` and `expansion_count`, advances `last_update_date`,
/// moves the cluster to `ACCEPTED`, and (for GIS) replaces the stored
/// centroid and radius.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn apply_cluster_expansion(
    db: &dyn Database,
    cluster_id: &str,
    cases_added: i64,
    last_update: NaiveDate,
    geometry: Option<(f64, f64, f64)>,
) -> Result<(), DbError> {
    if let Some((lat, lon, radius_m)) = geometry {
        db.exec_raw_params(
            "UPDATE clusters SET
                patient_count = patient_count + $2,
                expansion_count = expansion_count + 1,
                last_update_date = $3,
                centroid_lat = $4,
                centroid_lon = $5,
                radius_meters = $6,
                accept_status = 'ACCEPTED'
             WHERE cluster_id = $1",
            &[
                DatabaseValue::String(cluster_id.to_string()),
                DatabaseValue::Int64(cases_added),
                DatabaseValue::String(date_str(last_update)),
                DatabaseValue::Real64(lat),
                DatabaseValue::Real64(lon),
                DatabaseValue::Real64(radius_m),
            ],
        )
        .await?;
    } else {
        db.exec_raw_params(
            "UPDATE clusters SET
                patient_count = patient_count + $2,
                expansion_count = expansion_count + 1,
                last_update_date = $3,
                accept_status = 'ACCEPTED'
             WHERE cluster_id = $1",
            &[
                DatabaseValue::String(cluster_id.to_string()),
                DatabaseValue::Int64(cases_added),
                DatabaseValue::String(date_str(last_update)),
            ],
        )
        .await?;
    }
    Ok(())
}

/// Sets a pending cluster's status to `ACCEPTED`. No-op on clusters
/// that are not pending. Returns rows updated (0 or 1).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn accept_cluster(db: &dyn Database, cluster_id: &str) -> Result<u64, DbError> {
    let affected = db
        .exec_raw_params(
            "UPDATE clusters SET accept_status = 'ACCEPTED'
             WHERE cluster_id = $1
               AND accept_status IN ('PENDING_NEW', 'PENDING_MERGE')",
            &[DatabaseValue::String(cluster_id.to_string())],
        )
        .await?;

    Ok(affected)
}

/// Rejects a pending cluster and cascade-deletes its assignments.
///
/// Only legal on `PENDING_*` clusters; assignments are only removed
/// when the status update actually happened. Returns rows updated
/// (0 or 1).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn reject_cluster(db: &dyn Database, cluster_id: &str) -> Result<u64, DbError> {
    let affected = db
        .exec_raw_params(
            "UPDATE clusters SET accept_status = 'REJECTED'
             WHERE cluster_id = $1
               AND accept_status IN ('PENDING_NEW', 'PENDING_MERGE')",
            &[DatabaseValue::String(cluster_id.to_string())],
        )
        .await?;

    if affected > 0 {
        db.exec_raw_params(
            "DELETE FROM cluster_assignments WHERE cluster_id = $1",
            &[DatabaseValue::String(cluster_id.to_string())],
        )
        .await?;
    }

    Ok(affected)
}

/// Sweeps `PENDING_*` clusters created on or before `cutoff` to
/// `ACCEPTED`. Returns the number swept.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn auto_accept_pending_before(
    db: &dyn Database,
    cutoff: NaiveDate,
) -> Result<u64, DbError> {
    let affected = db
        .exec_raw_params(
            "UPDATE clusters SET accept_status = 'ACCEPTED'
             WHERE accept_status IN ('PENDING_NEW', 'PENDING_MERGE')
               AND original_creation_date <= $1",
            &[DatabaseValue::String(date_str(cutoff))],
        )
        .await?;

    Ok(affected)
}

/// Whether any cluster updated within `[from, to)` is still pending
/// review. Such clusters block processing of the next date.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn has_blocking_pending(
    db: &dyn Database,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<bool, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT 1 AS one FROM clusters
             WHERE accept_status IN ('PENDING_NEW', 'PENDING_MERGE')
               AND last_update_date >= $1 AND last_update_date < $2
             LIMIT 1",
            &[
                DatabaseValue::String(date_str(from)),
                DatabaseValue::String(date_str(to)),
            ],
        )
        .await?;

    Ok(!rows.is_empty())
}

/// Count of cluster rows written within the last `window_secs` seconds.
/// Used by the consistency gate to detect a still-settling store.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn recent_cluster_writes(
    db: &dyn Database,
    now: DateTime<Utc>,
    window_secs: u64,
) -> Result<i64, DbError> {
    let cutoff = now - chrono::Duration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX));
    let rows = db
        .query_raw_params(
            "SELECT COUNT(*) AS n FROM clusters WHERE created_at >= $1",
            &[DatabaseValue::String(ts_str(cutoff))],
        )
        .await?;

    rows.first().map_or(Ok(0), |row| {
        row.to_value("n")
            .map_err(|e| DbError::conversion(format!("n: {e}")))
    })
}

/// Aggregate counts for the status endpoint.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn status_summary(db: &dyn Database) -> Result<StatusSummary, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT
                COUNT(*) AS total_clusters,
                COALESCE(SUM(CASE WHEN algorithm_type = 'ABC' THEN 1 ELSE 0 END), 0) AS abc_clusters,
                COALESCE(SUM(CASE WHEN algorithm_type = 'GIS' THEN 1 ELSE 0 END), 0) AS gis_clusters,
                COALESCE(SUM(CASE WHEN accept_status = 'ACCEPTED' THEN 1 ELSE 0 END), 0) AS accepted,
                COALESCE(SUM(CASE WHEN accept_status IN ('PENDING_NEW', 'PENDING_MERGE')
                    THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(patient_count), 0) AS total_patients,
                COALESCE(SUM(expansion_count), 0) AS total_expansions,
                MAX(last_update_date) AS last_processed_date
             FROM clusters",
            &[],
        )
        .await?;

    let row = rows
        .first()
        .ok_or_else(|| DbError::conversion("Empty status summary result"))?;

    let last_processed: Option<String> = row.to_value("last_processed_date").unwrap_or(None);

    Ok(StatusSummary {
        dates_processed: completed_date_count(db).await?,
        last_processed_date: last_processed.as_deref().map(parse_date).transpose()?,
        total_clusters: row
            .to_value("total_clusters")
            .map_err(|e| DbError::conversion(format!("total_clusters: {e}")))?,
        abc_clusters: row
            .to_value("abc_clusters")
            .map_err(|e| DbError::conversion(format!("abc_clusters: {e}")))?,
        gis_clusters: row
            .to_value("gis_clusters")
            .map_err(|e| DbError::conversion(format!("gis_clusters: {e}")))?,
        accepted: row
            .to_value("accepted")
            .map_err(|e| DbError::conversion(format!("accepted: {e}")))?,
        pending: row
            .to_value("pending")
            .map_err(|e| DbError::conversion(format!("pending: {e}")))?,
        total_patients: row
            .to_value("total_patients")
            .map_err(|e| DbError::conversion(format!("total_patients: {e}")))?,
        total_expansions: row
            .to_value("total_expansions")
            .map_err(|e| DbError::conversion(format!("total_expansions: {e}")))?,
    })
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

/// Inserts assignments, skipping any that already exist (deterministic
/// ids make retries idempotent). Returns the number actually inserted.
///
/// # Errors
///
/// Returns [`DbError`] if any database operation fails.
pub async fn insert_assignments(
    db: &dyn Database,
    assignments: &[Assignment],
) -> Result<u64, DbError> {
    let mut inserted = 0u64;

    for assignment in assignments {
        let affected = db
            .exec_raw_params(
                "INSERT INTO cluster_assignments (
                    assignment_id, cluster_id, unique_id,
                    addition_type, assigned_at, expansion_date
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (assignment_id) DO NOTHING",
                &[
                    DatabaseValue::String(assignment.assignment_id.clone()),
                    DatabaseValue::String(assignment.cluster_id.clone()),
                    DatabaseValue::String(assignment.unique_id.clone()),
                    DatabaseValue::String(assignment.addition_type.to_string()),
                    DatabaseValue::String(ts_str(assignment.assigned_at)),
                    assignment
                        .expansion_date
                        .map_or(DatabaseValue::Null, |d| {
                            DatabaseValue::String(date_str(d))
                        }),
                ],
            )
            .await?;
        inserted += affected;
    }

    Ok(inserted)
}

/// Member case ids of one cluster.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn cluster_member_ids(
    db: &dyn Database,
    cluster_id: &str,
) -> Result<BTreeSet<String>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT unique_id FROM cluster_assignments WHERE cluster_id = $1",
            &[DatabaseValue::String(cluster_id.to_string())],
        )
        .await?;

    rows.iter()
        .map(|row| {
            row.to_value("unique_id")
                .map_err(|e| DbError::conversion(format!("unique_id: {e}")))
        })
        .collect()
}

/// Coordinates of a cluster's member cases (joined against
/// `patient_cases`; members without coordinates are skipped).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn cluster_member_points(
    db: &dyn Database,
    cluster_id: &str,
) -> Result<Vec<(f64, f64)>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT p.latitude, p.longitude
             FROM cluster_assignments a
             JOIN patient_cases p ON a.unique_id = p.unique_id
             WHERE a.cluster_id = $1
               AND p.latitude IS NOT NULL AND p.longitude IS NOT NULL",
            &[DatabaseValue::String(cluster_id.to_string())],
        )
        .await?;

    rows.iter()
        .map(|row| {
            let lat: f64 = row
                .to_value("latitude")
                .map_err(|e| DbError::conversion(format!("latitude: {e}")))?;
            let lon: f64 = row
                .to_value("longitude")
                .map_err(|e| DbError::conversion(format!("longitude: {e}")))?;
            Ok((lat, lon))
        })
        .collect()
}

/// Case ids already assigned to a cluster of the given algorithm type
/// whose cluster was updated on or after `since`. These cases are
/// excluded from re-clustering (deduplication).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn assigned_case_ids(
    db: &dyn Database,
    algorithm: AlgorithmType,
    since: NaiveDate,
) -> Result<BTreeSet<String>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT DISTINCT a.unique_id
             FROM cluster_assignments a
             JOIN clusters c ON a.cluster_id = c.cluster_id
             WHERE c.algorithm_type = $1
               AND c.last_update_date >= $2
               AND c.accept_status != 'REJECTED'",
            &[
                DatabaseValue::String(algorithm.to_string()),
                DatabaseValue::String(date_str(since)),
            ],
        )
        .await?;

    rows.iter()
        .map(|row| {
            row.to_value("unique_id")
                .map_err(|e| DbError::conversion(format!("unique_id: {e}")))
        })
        .collect()
}

/// Member cases of one cluster joined with their assignment metadata,
/// in assignment order.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn cluster_patients(
    db: &dyn Database,
    cluster_id: &str,
) -> Result<Vec<ClusterPatient>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT p.*, a.addition_type, a.expansion_date
             FROM cluster_assignments a
             JOIN patient_cases p ON a.unique_id = p.unique_id
             WHERE a.cluster_id = $1
             ORDER BY a.assigned_at ASC, a.assignment_id ASC",
            &[DatabaseValue::String(cluster_id.to_string())],
        )
        .await?;

    rows.iter()
        .map(|row| {
            let addition: String = row
                .to_value("addition_type")
                .map_err(|e| DbError::conversion(format!("addition_type: {e}")))?;
            let expansion: Option<String> = row.to_value("expansion_date").unwrap_or(None);
            Ok(ClusterPatient {
                case: case_from_row(row)?,
                addition_type: parse_enum::<AdditionType>(&addition, "addition type")?,
                expansion_date: expansion.as_deref().map(parse_date).transpose()?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Merge history & run summaries
// ---------------------------------------------------------------------------

/// Appends a merge audit record. Idempotent on `merge_id`.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn insert_merge_record(db: &dyn Database, record: &MergeRecord) -> Result<(), DbError> {
    db.exec_raw_params(
        "INSERT INTO merge_history (
            merge_id, target_cluster_id, source_description,
            reason, cases_added, overlap_cases_removed, performed_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (merge_id) DO NOTHING",
        &[
            DatabaseValue::String(record.merge_id.clone()),
            DatabaseValue::String(record.target_cluster_id.clone()),
            DatabaseValue::String(record.source_description.clone()),
            DatabaseValue::String(record.reason.to_string()),
            DatabaseValue::Int64(record.cases_added),
            DatabaseValue::Int64(record.overlap_cases_removed),
            DatabaseValue::String(ts_str(record.performed_at)),
        ],
    )
    .await?;
    Ok(())
}

/// Next free sequence number for merge ids sharing `prefix`. Keeps
/// repeated same-day expansions of one cluster from colliding on the
/// audit id.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn next_merge_sequence(db: &dyn Database, prefix: &str) -> Result<u32, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT COUNT(*) AS n FROM merge_history WHERE merge_id LIKE $1",
            &[DatabaseValue::String(format!("{prefix}%"))],
        )
        .await?;

    let existing: i64 = rows.first().map_or(Ok(0), |row| {
        row.to_value("n")
            .map_err(|e| DbError::conversion(format!("n: {e}")))
    })?;

    Ok(u32::try_from(existing).unwrap_or(0) + 1)
}

/// Merge records targeting one cluster, oldest first.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn merge_records_for(
    db: &dyn Database,
    cluster_id: &str,
) -> Result<Vec<MergeRecord>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT * FROM merge_history
             WHERE target_cluster_id = $1
             ORDER BY performed_at ASC",
            &[DatabaseValue::String(cluster_id.to_string())],
        )
        .await?;

    rows.iter()
        .map(|row| {
            let reason: String = row
                .to_value("reason")
                .map_err(|e| DbError::conversion(format!("reason: {e}")))?;
            let performed_at: String = row
                .to_value("performed_at")
                .map_err(|e| DbError::conversion(format!("performed_at: {e}")))?;
            Ok(MergeRecord {
                merge_id: row
                    .to_value("merge_id")
                    .map_err(|e| DbError::conversion(format!("merge_id: {e}")))?,
                target_cluster_id: row
                    .to_value("target_cluster_id")
                    .map_err(|e| DbError::conversion(format!("target_cluster_id: {e}")))?,
                source_description: row
                    .to_value("source_description")
                    .map_err(|e| DbError::conversion(format!("source_description: {e}")))?,
                reason: parse_enum(&reason, "merge reason")?,
                cases_added: row
                    .to_value("cases_added")
                    .map_err(|e| DbError::conversion(format!("cases_added: {e}")))?,
                overlap_cases_removed: row
                    .to_value("overlap_cases_removed")
                    .map_err(|e| DbError::conversion(format!("overlap_cases_removed: {e}")))?,
                performed_at: parse_ts(&performed_at)?,
            })
        })
        .collect()
}

/// Writes the per-date run summary row. Idempotent on `input_date`.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
#[allow(clippy::too_many_arguments)]
pub async fn insert_run_summary(
    db: &dyn Database,
    input_date: NaiveDate,
    run_at: DateTime<Utc>,
    abc_clusters_created: i64,
    abc_expansions: i64,
    gis_clusters_created: i64,
    gis_expansions: i64,
    pending_clusters: i64,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "INSERT INTO run_summaries (
            input_date, run_at,
            abc_clusters_created, abc_expansions,
            gis_clusters_created, gis_expansions, pending_clusters
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (input_date) DO NOTHING",
        &[
            DatabaseValue::String(date_str(input_date)),
            DatabaseValue::String(ts_str(run_at)),
            DatabaseValue::Int64(abc_clusters_created),
            DatabaseValue::Int64(abc_expansions),
            DatabaseValue::Int64(gis_clusters_created),
            DatabaseValue::Int64(gis_expansions),
            DatabaseValue::Int64(pending_clusters),
        ],
    )
    .await?;
    Ok(())
}
