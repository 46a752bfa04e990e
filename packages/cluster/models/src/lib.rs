#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Cluster lifecycle types: clusters, case assignments, merge history,
//! and the per-date processing claims used for worker coordination.
//!
//! These types mirror the persistent store schema one-to-one. Status
//! enums serialize as `SCREAMING_SNAKE_CASE` both on the wire and in
//! the database.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Which clustering strategy produced a cluster.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AlgorithmType {
    /// Administrative grouping of rural cases (village + syndrome).
    Abc,
    /// Density-based spatial clustering of urban cases.
    Gis,
}

/// Review status of a cluster.
///
/// `PendingNew` and `PendingMerge` await human review (or the
/// auto-accept sweep); `Accepted` is terminal for acceptance but the
/// cluster stays open to expansion; `Rejected` is terminal and deletes
/// the cluster's assignments.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AcceptStatus {
    /// Brand-new signal with no spatial match in recent history.
    PendingNew,
    /// Candidate merge into an existing cluster, needs review.
    PendingMerge,
    /// Confirmed signal (auto-merged, swept, or human-accepted).
    Accepted,
    /// Dismissed by a human reviewer.
    Rejected,
}

impl AcceptStatus {
    /// Whether the cluster still awaits a review decision.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::PendingNew | Self::PendingMerge)
    }

    /// Whether `self -> next` is a legal forward transition.
    ///
    /// Pending states move to `Accepted` or `Rejected`; terminal states
    /// never move.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        self.is_pending() && matches!(next, Self::Accepted | Self::Rejected)
    }
}

/// How a case entered a cluster.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AdditionType {
    /// Member of the cluster on the day it was created.
    Original,
    /// Folded in by a later expansion.
    Expansion,
}

/// Why two clusters (or a cluster and new cases) were merged.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeReason {
    /// Same administrative location + syndrome on consecutive days (ABC).
    TimeContinuity,
    /// Centroids within the acceptance radius (GIS).
    GeographicProximity,
}

/// A spatio-temporal grouping of cases — one outbreak signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Deterministic cluster identifier (see [`cluster_id`]).
    pub cluster_id: String,
    /// Which strategy produced the cluster.
    pub algorithm_type: AlgorithmType,
    /// Syndrome label shared by all member cases.
    pub syndrome: String,
    /// Location code of the founding candidate (`"UNK"` when unknown).
    pub location_code: String,
    /// Village name for ABC clusters; `None` for GIS.
    pub village: Option<String>,
    /// Date the cluster was first detected. Set once, never changes.
    pub original_creation_date: NaiveDate,
    /// Most recent processing date that contributed cases.
    pub last_update_date: NaiveDate,
    /// Geodesic mean latitude of members.
    pub centroid_lat: Option<f64>,
    /// Geodesic mean longitude of members.
    pub centroid_lon: Option<f64>,
    /// 95th-percentile distance from centroid to members, meters.
    /// 0 for coincident-point groups; `None` for ABC clusters.
    pub radius_meters: Option<f64>,
    /// Number of member cases.
    pub patient_count: i64,
    /// Times new cases were folded in after creation.
    pub expansion_count: i64,
    /// Review status.
    pub accept_status: AcceptStatus,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Links one patient case to one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Deterministic id: `<cluster_id>:<unique_id>`.
    pub assignment_id: String,
    /// Owning cluster.
    pub cluster_id: String,
    /// Member case.
    pub unique_id: String,
    /// How the case entered the cluster.
    pub addition_type: AdditionType,
    /// When the assignment was written.
    pub assigned_at: DateTime<Utc>,
    /// Processing date of the expansion; `None` for ORIGINAL members.
    pub expansion_date: Option<NaiveDate>,
}

impl Assignment {
    /// Deterministic assignment id, stable across retries so that
    /// re-inserting after a failed run cannot double-count.
    #[must_use]
    pub fn id_for(cluster_id: &str, unique_id: &str) -> String {
        format!("{cluster_id}:{unique_id}")
    }
}

/// Append-only audit record of a merge or expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRecord {
    /// Id: `<ALGO>-EXP-<cluster_id>-<YYYYMMDD>-<seq>`, sequenced per
    /// (cluster, date).
    pub merge_id: String,
    /// Cluster that absorbed the cases.
    pub target_cluster_id: String,
    /// `NEW-<date>` when folding brand-new cases, or the id of a
    /// superseded cluster.
    pub source_description: String,
    /// Why the merge happened.
    pub reason: MergeReason,
    /// Cases actually added after overlap removal.
    pub cases_added: i64,
    /// Cases skipped because they were already members.
    pub overlap_cases_removed: i64,
    /// When the merge was performed.
    pub performed_at: DateTime<Utc>,
}

/// Lifecycle status of a per-date processing claim.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    /// A worker holds the claim and is processing the date.
    InProgress,
    /// The date was processed to completion.
    Completed,
    /// Processing failed; the date may be claimed again.
    Failed,
}

/// Exclusive right, held by one worker, to process one calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingClaim {
    /// The claimed date.
    pub date: NaiveDate,
    /// Claim status.
    pub status: ClaimStatus,
    /// Worker that holds (or held) the claim.
    pub worker_id: String,
    /// When the claim was acquired.
    pub started_at: DateTime<Utc>,
    /// When the claim reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Compact three-letter fingerprint of a syndrome label, used inside
/// deterministic cluster ids.
///
/// First, middle, and last alphanumeric characters uppercased, padded
/// with `X` for short labels, `"OTH"` when nothing alphanumeric remains.
#[must_use]
pub fn syndrome_fingerprint(syndrome: &str) -> String {
    let clean: Vec<char> = syndrome
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    match clean.len() {
        0 => "OTH".to_string(),
        1 => format!("{}XX", clean[0]),
        2 => format!("{}{}X", clean[0], clean[1]),
        n => format!("{}{}{}", clean[0], clean[n / 2], clean[n - 1]),
    }
}

/// Deterministic cluster identifier:
/// `<ALGO>_<locationCode>_<syndromeFingerprint>_<DDMONYYYY>_<seq:03>`.
///
/// The per-(location, syndrome, date) sequence number disambiguates
/// same-key groups arising on the same day.
#[must_use]
pub fn cluster_id(
    algorithm: AlgorithmType,
    location_code: &str,
    syndrome: &str,
    date: NaiveDate,
    seq: u32,
) -> String {
    let date_str = date.format("%d%b%Y").to_string().to_uppercase();
    format!(
        "{}_{}_{}_{}_{:03}",
        algorithm.as_ref(),
        location_code,
        syndrome_fingerprint(syndrome),
        date_str,
        seq
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_only_move_forward() {
        assert!(AcceptStatus::PendingNew.can_transition_to(AcceptStatus::Accepted));
        assert!(AcceptStatus::PendingMerge.can_transition_to(AcceptStatus::Rejected));
        assert!(!AcceptStatus::Accepted.can_transition_to(AcceptStatus::Rejected));
        assert!(!AcceptStatus::Rejected.can_transition_to(AcceptStatus::Accepted));
        assert!(!AcceptStatus::PendingNew.can_transition_to(AcceptStatus::PendingMerge));
    }

    #[test]
    fn status_round_trips_screaming_snake_case() {
        assert_eq!(AcceptStatus::PendingNew.to_string(), "PENDING_NEW");
        assert_eq!(
            "PENDING_MERGE".parse::<AcceptStatus>().unwrap(),
            AcceptStatus::PendingMerge
        );
        assert_eq!(AlgorithmType::Abc.as_ref(), "ABC");
        assert_eq!(MergeReason::TimeContinuity.as_ref(), "TIME_CONTINUITY");
        assert_eq!(ClaimStatus::InProgress.as_ref(), "IN_PROGRESS");
    }

    #[test]
    fn syndrome_fingerprints() {
        assert_eq!(syndrome_fingerprint("Acute Diarrheal Disease"), "AHE");
        assert_eq!(syndrome_fingerprint("flu"), "FLU");
        assert_eq!(syndrome_fingerprint("ab"), "ABX");
        assert_eq!(syndrome_fingerprint("a"), "AXX");
        assert_eq!(syndrome_fingerprint("--"), "OTH");
    }

    #[test]
    fn cluster_ids_are_deterministic() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
        let id = cluster_id(AlgorithmType::Abc, "KEKP", "Fever", date, 1);
        assert_eq!(id, "ABC_KEKP_FVR_14MAR2025_001");
        assert_eq!(
            id,
            cluster_id(AlgorithmType::Abc, "KEKP", "Fever", date, 1)
        );
    }
}
