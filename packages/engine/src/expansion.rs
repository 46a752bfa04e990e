//! Applies continuity decisions to the persistent store: creating
//! cluster rows, expanding existing ones, and enforcing the radius cap.
//!
//! Every write is idempotent (deterministic cluster, assignment, and
//! merge ids), so replaying a failed date cannot double-count.

use chrono::{DateTime, NaiveDate, Utc};
use episignal_cluster_models::{
    AcceptStatus, AdditionType, AlgorithmType, Assignment, Cluster, MergeReason, MergeRecord,
    cluster_id,
};
use episignal_database::queries;
use episignal_geo::{geodesic_centroid, radius_p95_m, weighted_centroid};
use switchy_database::Database;

use crate::EngineError;
use crate::candidate::CandidateCluster;
use crate::continuity::{CandidateMatch, ContinuityDecision};

/// What applying one candidate actually did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// A new cluster row was created.
    Created {
        /// The new cluster id.
        cluster_id: String,
        /// Whether it awaits review.
        pending: bool,
    },
    /// An existing cluster absorbed new cases.
    Expanded {
        /// The expanded cluster id.
        cluster_id: String,
        /// Cases added after overlap removal.
        cases_added: i64,
    },
    /// Every candidate case was already a member; nothing changed.
    NothingNew {
        /// The matched cluster id.
        cluster_id: String,
    },
    /// Expansion refused: the recomputed radius would exceed the cap.
    /// Cases stay unassigned and no mutation happens.
    Refused {
        /// The matched cluster id.
        cluster_id: String,
        /// The radius the expansion would have produced, meters.
        would_be_radius_m: f64,
    },
}

fn merge_reason(algorithm: AlgorithmType) -> MergeReason {
    match algorithm {
        AlgorithmType::Abc => MergeReason::TimeContinuity,
        AlgorithmType::Gis => MergeReason::GeographicProximity,
    }
}

/// One cluster can be expanded more than once on a single processing
/// date, so the audit id carries a per-(cluster, date) sequence.
async fn next_merge_id(
    db: &dyn Database,
    algorithm: AlgorithmType,
    cluster_id: &str,
    date: NaiveDate,
) -> Result<String, EngineError> {
    let prefix = format!(
        "{}-EXP-{}-{}-",
        algorithm.as_ref(),
        cluster_id,
        date.format("%Y%m%d")
    );
    let seq = queries::next_merge_sequence(db, &prefix).await?;
    Ok(format!("{prefix}{seq:02}"))
}

async fn next_cluster_id(
    db: &dyn Database,
    candidate: &CandidateCluster,
    date: NaiveDate,
) -> Result<String, EngineError> {
    let base = cluster_id(
        candidate.algorithm,
        &candidate.location_code,
        &candidate.syndrome,
        date,
        1,
    );
    let prefix = &base[..base.len() - 3];
    let seq = queries::next_cluster_sequence(db, prefix).await?;
    Ok(format!("{prefix}{seq:03}"))
}

fn assignments_for(
    candidate: &CandidateCluster,
    cluster_id: &str,
    addition_type: AdditionType,
    expansion_date: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> Vec<Assignment> {
    candidate
        .cases
        .iter()
        .map(|case| Assignment {
            assignment_id: Assignment::id_for(cluster_id, &case.unique_id),
            cluster_id: cluster_id.to_string(),
            unique_id: case.unique_id.clone(),
            addition_type,
            assigned_at: now,
            expansion_date,
        })
        .collect()
}

/// Creates a fresh cluster row plus ORIGINAL assignments for a
/// candidate.
async fn create_cluster(
    db: &dyn Database,
    candidate: &CandidateCluster,
    status: AcceptStatus,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<String, EngineError> {
    let id = next_cluster_id(db, candidate, date).await?;

    #[allow(clippy::cast_possible_wrap)]
    let cluster = Cluster {
        cluster_id: id.clone(),
        algorithm_type: candidate.algorithm,
        syndrome: candidate.syndrome.clone(),
        location_code: candidate.location_code.clone(),
        village: candidate.village.clone(),
        original_creation_date: date,
        last_update_date: date,
        centroid_lat: candidate.centroid.map(|(lat, _)| lat),
        centroid_lon: candidate.centroid.map(|(_, lon)| lon),
        radius_meters: candidate.radius_m,
        patient_count: candidate.len() as i64,
        expansion_count: 0,
        accept_status: status,
        created_at: now,
    };

    queries::insert_cluster(db, &cluster).await?;
    queries::insert_assignments(
        db,
        &assignments_for(candidate, &id, AdditionType::Original, None, now),
    )
    .await?;

    Ok(id)
}

/// Expands `target` with the candidate's cases.
///
/// Overlapping cases are removed first and logged in the merge record,
/// never re-inserted. For GIS clusters the centroid moves to the
/// case-count-weighted mean and the radius is recomputed over the full
/// member set; the mutation is refused outright if that radius would
/// exceed `cap_radius_m`.
async fn expand_cluster(
    db: &dyn Database,
    candidate: &CandidateCluster,
    target: &CandidateMatch,
    date: NaiveDate,
    cap_radius_m: f64,
    now: DateTime<Utc>,
) -> Result<Applied, EngineError> {
    let existing = queries::get_cluster(db, &target.cluster_id)
        .await?
        .ok_or_else(|| EngineError::MissingCluster {
            cluster_id: target.cluster_id.clone(),
        })?;

    let members = queries::cluster_member_ids(db, &existing.cluster_id).await?;
    let new_cases: Vec<_> = candidate
        .cases
        .iter()
        .filter(|c| !members.contains(&c.unique_id))
        .cloned()
        .collect();
    #[allow(clippy::cast_possible_wrap)]
    let overlap = (candidate.len() - new_cases.len()) as i64;

    if new_cases.is_empty() {
        log::info!(
            "All {} candidate cases already members of {}; skipping",
            candidate.len(),
            existing.cluster_id
        );
        return Ok(Applied::NothingNew {
            cluster_id: existing.cluster_id,
        });
    }

    let new_points: Vec<(f64, f64)> = new_cases.iter().filter_map(|c| c.coordinates()).collect();

    // GIS clusters carry geometry; ABC clusters only advance counts.
    let geometry = if candidate.algorithm == AlgorithmType::Gis {
        let old_centroid = match (existing.centroid_lat, existing.centroid_lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                return Err(EngineError::MissingCluster {
                    cluster_id: existing.cluster_id,
                });
            }
        };
        let Some(new_centroid) = geodesic_centroid(&new_points) else {
            return Ok(Applied::NothingNew {
                cluster_id: existing.cluster_id,
            });
        };

        #[allow(clippy::cast_sign_loss)]
        let merged = weighted_centroid(
            old_centroid,
            existing.patient_count.max(0) as u64,
            new_centroid,
            new_points.len() as u64,
        );

        let mut all_points = queries::cluster_member_points(db, &existing.cluster_id).await?;
        all_points.extend(&new_points);
        let radius = radius_p95_m(merged, &all_points);

        if radius > cap_radius_m {
            log::warn!(
                "Refusing expansion of {}: radius would grow to {radius:.0}m (cap {cap_radius_m:.0}m)",
                existing.cluster_id
            );
            return Ok(Applied::Refused {
                cluster_id: existing.cluster_id,
                would_be_radius_m: radius,
            });
        }

        Some((merged.0, merged.1, radius))
    } else {
        None
    };

    #[allow(clippy::cast_possible_wrap)]
    let added = new_cases.len() as i64;

    queries::apply_cluster_expansion(db, &existing.cluster_id, added, date, geometry).await?;

    let expansion = CandidateCluster {
        cases: new_cases,
        ..candidate.clone()
    };
    queries::insert_assignments(
        db,
        &assignments_for(
            &expansion,
            &existing.cluster_id,
            AdditionType::Expansion,
            Some(date),
            now,
        ),
    )
    .await?;

    let merge_id = next_merge_id(db, candidate.algorithm, &existing.cluster_id, date).await?;
    queries::insert_merge_record(
        db,
        &MergeRecord {
            merge_id,
            target_cluster_id: existing.cluster_id.clone(),
            source_description: format!("NEW-{date}"),
            reason: merge_reason(candidate.algorithm),
            cases_added: added,
            overlap_cases_removed: overlap,
            performed_at: now,
        },
    )
    .await?;

    Ok(Applied::Expanded {
        cluster_id: existing.cluster_id,
        cases_added: added,
    })
}

/// Applies one continuity decision to the store.
///
/// # Errors
///
/// Returns [`EngineError`] if a store operation fails or the matched
/// cluster has vanished.
pub async fn apply_decision(
    db: &dyn Database,
    candidate: &CandidateCluster,
    decision: &ContinuityDecision,
    date: NaiveDate,
    cap_radius_m: f64,
    now: DateTime<Utc>,
) -> Result<Applied, EngineError> {
    match decision {
        ContinuityDecision::Expand { target, .. } => {
            expand_cluster(db, candidate, target, date, cap_radius_m, now).await
        }
        ContinuityDecision::PendingMerge { target, .. } => {
            // A near-match gets a duplicate provisional cluster for a
            // human to compare against the matched one.
            let id = create_cluster(db, candidate, AcceptStatus::PendingMerge, date, now).await?;
            let merge_id = next_merge_id(db, candidate.algorithm, &id, date).await?;
            queries::insert_merge_record(
                db,
                &MergeRecord {
                    merge_id,
                    target_cluster_id: id.clone(),
                    source_description: target.cluster_id.clone(),
                    reason: merge_reason(candidate.algorithm),
                    cases_added: 0,
                    overlap_cases_removed: 0,
                    performed_at: now,
                },
            )
            .await?;
            Ok(Applied::Created {
                cluster_id: id,
                pending: true,
            })
        }
        ContinuityDecision::New => {
            let id = create_cluster(db, candidate, AcceptStatus::PendingNew, date, now).await?;
            Ok(Applied::Created {
                cluster_id: id,
                pending: true,
            })
        }
    }
}
