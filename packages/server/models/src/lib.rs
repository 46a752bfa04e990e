#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the episignal server.
//!
//! These types are serialized to JSON for the REST API. They are
//! separate from the store row types to allow independent evolution of
//! the API contract.

use chrono::NaiveDate;
use episignal_case_models::PatientCase;
use episignal_cluster_models::{AcceptStatus, AdditionType, AlgorithmType, Cluster};
use episignal_engine::{RunCounters, RunOutcome, RunSummary};
use serde::{Deserialize, Serialize};

/// Health probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    /// Whether the server (and its store connection) is healthy.
    pub healthy: bool,
    /// Server version string.
    pub version: String,
}

/// Response of one `POST /smart-process` cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    /// Whether the cycle ran without internal failure. `true` for all
    /// logical outcomes including "nothing to do" and "blocked".
    pub success: bool,
    /// `processed`, `nothing_eligible`, or `blocked`.
    pub status: String,
    /// The processed date, when one was.
    pub date_processed: Option<NaiveDate>,
    /// The date refused by the blocking rule, when one was.
    pub blocked_date: Option<NaiveDate>,
    /// Identity of the worker that ran the cycle.
    pub worker_id: String,
    /// Per-run counters, present when a date was processed.
    pub counters: Option<RunCounters>,
}

impl ProcessResponse {
    /// Maps an engine run outcome to the wire shape.
    #[must_use]
    pub fn from_outcome(outcome: &RunOutcome, worker_id: &str) -> Self {
        let base = Self {
            success: true,
            status: String::new(),
            date_processed: None,
            blocked_date: None,
            worker_id: worker_id.to_string(),
            counters: None,
        };
        match outcome {
            RunOutcome::Processed(RunSummary {
                input_date,
                counters,
            }) => Self {
                status: "processed".to_string(),
                date_processed: Some(*input_date),
                counters: Some(*counters),
                ..base
            },
            RunOutcome::NothingEligible => Self {
                status: "nothing_eligible".to_string(),
                ..base
            },
            RunOutcome::Blocked { date } => Self {
                status: "blocked".to_string(),
                blocked_date: Some(*date),
                ..base
            },
        }
    }
}

/// Request body for human accept/reject actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    /// Target cluster id.
    pub cluster_id: String,
}

/// Response of an accept/reject action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    /// Whether the transition happened. `false` means the cluster was
    /// missing or no longer pending.
    pub success: bool,
    /// The target cluster id.
    pub cluster_id: String,
    /// Human-readable explanation.
    pub message: String,
}

/// One entry in the preflight eligibility preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSkippedDate {
    /// The skipped date.
    pub date: NaiveDate,
    /// Its geocoding completeness fraction.
    pub completeness: f64,
}

/// `GET /smart-preflight` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightResponse {
    /// Dates ready to process, oldest first.
    pub eligible_dates: Vec<NaiveDate>,
    /// Dates still below the geocoding threshold.
    pub below_threshold: Vec<ApiSkippedDate>,
    /// Clusters currently awaiting review. A nonzero count can trigger
    /// the blocking rule on the next run.
    pub pending_clusters: i64,
}

/// A cluster as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCluster {
    /// Cluster id.
    pub cluster_id: String,
    /// Producing strategy.
    pub algorithm_type: AlgorithmType,
    /// Syndrome label.
    pub syndrome: String,
    /// Location code.
    pub location_code: String,
    /// Village name, for ABC clusters.
    pub village: Option<String>,
    /// First detection date.
    pub original_creation_date: NaiveDate,
    /// Most recent contributing date.
    pub last_update_date: NaiveDate,
    /// Centroid latitude.
    pub centroid_lat: Option<f64>,
    /// Centroid longitude.
    pub centroid_lon: Option<f64>,
    /// Effective radius, meters.
    pub radius_meters: Option<f64>,
    /// Member count.
    pub patient_count: i64,
    /// Expansion count.
    pub expansion_count: i64,
    /// Review status.
    pub accept_status: AcceptStatus,
}

impl From<Cluster> for ApiCluster {
    fn from(c: Cluster) -> Self {
        Self {
            cluster_id: c.cluster_id,
            algorithm_type: c.algorithm_type,
            syndrome: c.syndrome,
            location_code: c.location_code,
            village: c.village,
            original_creation_date: c.original_creation_date,
            last_update_date: c.last_update_date,
            centroid_lat: c.centroid_lat,
            centroid_lon: c.centroid_lon,
            radius_meters: c.radius_meters,
            patient_count: c.patient_count,
            expansion_count: c.expansion_count,
            accept_status: c.accept_status,
        }
    }
}

/// Query parameters for the cluster list endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQueryParams {
    /// Only clusters first detected within the last N days.
    pub days: Option<i64>,
}

/// Query parameters for the cluster patients endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPatientsParams {
    /// Target cluster id.
    pub cluster_id: String,
}

/// One member case of a cluster, as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiClusterPatient {
    /// Case id.
    pub unique_id: String,
    /// Entry date.
    pub entry_date: NaiveDate,
    /// Syndrome label.
    pub syndrome: String,
    /// Latitude.
    pub latitude: Option<f64>,
    /// Longitude.
    pub longitude: Option<f64>,
    /// Village name.
    pub village: Option<String>,
    /// How the case entered the cluster.
    pub addition_type: AdditionType,
    /// Expansion date, for EXPANSION members.
    pub expansion_date: Option<NaiveDate>,
}

impl ApiClusterPatient {
    /// Builds the wire shape from a case plus its assignment metadata.
    #[must_use]
    pub fn from_parts(
        case: PatientCase,
        addition_type: AdditionType,
        expansion_date: Option<NaiveDate>,
    ) -> Self {
        Self {
            unique_id: case.unique_id,
            entry_date: case.entry_date,
            syndrome: case.syndrome,
            latitude: case.latitude,
            longitude: case.longitude,
            village: case.admin.village,
            addition_type,
            expansion_date,
        }
    }
}

/// `GET /smart-status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    /// Dates processed to completion.
    pub dates_processed: i64,
    /// Most recent processed date reflected in any cluster.
    pub last_processed_date: Option<NaiveDate>,
    /// Total clusters.
    pub total_clusters: i64,
    /// ABC clusters.
    pub abc_clusters: i64,
    /// GIS clusters.
    pub gis_clusters: i64,
    /// Accepted clusters.
    pub accepted: i64,
    /// Clusters awaiting review.
    pub pending: i64,
    /// Total member cases across clusters.
    pub total_patients: i64,
    /// Total expansions across clusters.
    pub total_expansions: i64,
}
