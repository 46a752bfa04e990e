//! Candidate clusters: same-window case groupings produced by the
//! rural and urban strategies, before continuity resolution.

use episignal_case_models::PatientCase;
use episignal_cluster_models::AlgorithmType;

/// A group of cases proposed as one outbreak signal.
///
/// Candidates are in-memory only. The continuity resolver decides
/// whether each one becomes a new cluster row or an expansion of an
/// existing one.
#[derive(Debug, Clone)]
pub struct CandidateCluster {
    /// Strategy that produced the candidate.
    pub algorithm: AlgorithmType,
    /// Syndrome shared by all member cases.
    pub syndrome: String,
    /// Location code of the member cases.
    pub location_code: String,
    /// Village name for rural candidates.
    pub village: Option<String>,
    /// Member cases.
    pub cases: Vec<PatientCase>,
    /// Geodesic centroid of geocoded members, when any exist.
    pub centroid: Option<(f64, f64)>,
    /// 95th-percentile member distance from the centroid, meters.
    /// `None` for candidates without geometry.
    pub radius_m: Option<f64>,
}

impl CandidateCluster {
    /// Member case ids.
    #[must_use]
    pub fn case_ids(&self) -> Vec<&str> {
        self.cases.iter().map(|c| c.unique_id.as_str()).collect()
    }

    /// Coordinates of geocoded members.
    #[must_use]
    pub fn points(&self) -> Vec<(f64, f64)> {
        self.cases.iter().filter_map(PatientCase::coordinates).collect()
    }

    /// Number of member cases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Whether the candidate has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}
