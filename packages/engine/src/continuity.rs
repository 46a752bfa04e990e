//! Continuity resolver: decides whether a candidate cluster continues
//! an existing outbreak signal or starts a new one.
//!
//! Pure functions over in-memory data. Callers pass the recent-history
//! clusters (same algorithm, not rejected); the resolver never touches
//! the store, which keeps every decision unit-testable.

use episignal_cluster_models::{AcceptStatus, AlgorithmType, Cluster};
use episignal_geo::haversine_distance_m;
use serde::Serialize;

use crate::candidate::CandidateCluster;

/// Confidence assigned to brand-new signals.
pub const NEW_SIGNAL_CONFIDENCE: f64 = 5.0;

/// How many next-closest matches are kept for the audit trail.
const AUDIT_ALTERNATES: usize = 3;

/// One historical cluster considered as a continuity target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMatch {
    /// Historical cluster id.
    pub cluster_id: String,
    /// Centroid-to-centroid distance, meters.
    pub distance_m: f64,
    /// Confidence score for this match.
    pub confidence: f64,
}

/// Outcome of resolving one candidate cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuityDecision {
    /// Auto-merge: expand the matched cluster, resulting status
    /// `ACCEPTED`.
    Expand {
        /// The matched historical cluster.
        target: CandidateMatch,
        /// Next-closest matches, for reviewers.
        alternates: Vec<CandidateMatch>,
    },
    /// Near-match needing review: a provisional `PENDING_MERGE`
    /// cluster is created alongside the matched one.
    PendingMerge {
        /// The matched historical cluster.
        target: CandidateMatch,
        /// Next-closest matches, for reviewers.
        alternates: Vec<CandidateMatch>,
    },
    /// No match in recent history: brand-new `PENDING_NEW` signal.
    New,
}

impl ContinuityDecision {
    /// The `accept_status` a cluster row resulting from this decision
    /// carries.
    #[must_use]
    pub const fn resulting_status(&self) -> AcceptStatus {
        match self {
            Self::Expand { .. } => AcceptStatus::Accepted,
            Self::PendingMerge { .. } => AcceptStatus::PendingMerge,
            Self::New => AcceptStatus::PendingNew,
        }
    }
}

/// Confidence score for a match at distance `d`, on the two-tier scale.
///
/// Decreases linearly from 95 at 0m to 50 at `accept_radius_m`, then
/// from 50 to 10 at `match_radius_m`; anything farther scores the fixed
/// new-signal floor.
#[must_use]
pub fn confidence_for(d: f64, accept_radius_m: f64, match_radius_m: f64) -> f64 {
    if d <= accept_radius_m {
        (d / accept_radius_m).mul_add(-45.0, 95.0)
    } else if d <= match_radius_m {
        ((d - accept_radius_m) / (match_radius_m - accept_radius_m)).mul_add(-40.0, 50.0)
    } else {
        NEW_SIGNAL_CONFIDENCE
    }
}

fn same_syndrome(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn split_top(mut matches: Vec<CandidateMatch>) -> (CandidateMatch, Vec<CandidateMatch>) {
    let target = matches.remove(0);
    matches.truncate(AUDIT_ALTERNATES);
    (target, matches)
}

/// Resolves a GIS candidate against recent-history GIS clusters by raw
/// centroid distance.
///
/// The closest match wins; ties break toward the earliest
/// `original_creation_date` (callers pass `history` oldest-first and
/// the sort below is stable).
#[must_use]
pub fn resolve_gis(
    candidate: &CandidateCluster,
    history: &[Cluster],
    accept_radius_m: f64,
    match_radius_m: f64,
) -> ContinuityDecision {
    let Some((lat, lon)) = candidate.centroid else {
        return ContinuityDecision::New;
    };

    let mut matches: Vec<CandidateMatch> = history
        .iter()
        .filter(|c| {
            c.algorithm_type == AlgorithmType::Gis
                && c.accept_status != AcceptStatus::Rejected
                && same_syndrome(&c.syndrome, &candidate.syndrome)
        })
        .filter_map(|c| {
            let (clat, clon) = (c.centroid_lat?, c.centroid_lon?);
            let d = haversine_distance_m(lat, lon, clat, clon);
            (d <= match_radius_m).then(|| CandidateMatch {
                cluster_id: c.cluster_id.clone(),
                distance_m: d,
                confidence: confidence_for(d, accept_radius_m, match_radius_m),
            })
        })
        .collect();

    if matches.is_empty() {
        return ContinuityDecision::New;
    }
    matches.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));

    let (target, alternates) = split_top(matches);
    if target.distance_m <= accept_radius_m {
        ContinuityDecision::Expand { target, alternates }
    } else {
        ContinuityDecision::PendingMerge { target, alternates }
    }
}

/// Strips the trailing village initial off a location code. The code
/// concatenates the first letters of the hierarchy fields, so two
/// villages in one subdistrict only share a full code when their names
/// start with the same letter; cross-village comparison has to happen
/// on the subdistrict-level prefix instead.
fn area_code(code: &str, has_village: bool) -> &str {
    if !has_village {
        return code;
    }
    code.char_indices()
        .next_back()
        .filter(|&(idx, _)| idx > 0)
        .map_or(code, |(idx, _)| &code[..idx])
}

/// Resolves an ABC candidate against recent-history ABC clusters.
///
/// Rural candidates are tied to a named place, so matching is keyed on
/// the administrative identity instead of raw distance: same
/// subdistrict, village, and syndrome is a continuation (top tier);
/// same subdistrict and syndrome but a different village is a
/// near-match needing review; anything else is a new signal. Distance
/// between centroids, when both exist, is carried through for the
/// audit trail.
#[must_use]
pub fn resolve_abc(
    candidate: &CandidateCluster,
    history: &[Cluster],
    accept_radius_m: f64,
    match_radius_m: f64,
) -> ContinuityDecision {
    let same_village = |a: Option<&str>, b: Option<&str>| match (a, b) {
        (Some(a), Some(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        _ => false,
    };
    let candidate_area = area_code(&candidate.location_code, candidate.village.is_some());

    let audit_distance = |c: &Cluster| -> f64 {
        match (candidate.centroid, c.centroid_lat, c.centroid_lon) {
            (Some((lat, lon)), Some(clat), Some(clon)) => {
                haversine_distance_m(lat, lon, clat, clon)
            }
            _ => 0.0,
        }
    };

    let relevant: Vec<&Cluster> = history
        .iter()
        .filter(|c| {
            c.algorithm_type == AlgorithmType::Abc
                && c.accept_status != AcceptStatus::Rejected
                && same_syndrome(&c.syndrome, &candidate.syndrome)
                && area_code(&c.location_code, c.village.is_some()) == candidate_area
        })
        .collect();

    let to_match = |c: &Cluster, confidence: f64| CandidateMatch {
        cluster_id: c.cluster_id.clone(),
        distance_m: audit_distance(c),
        confidence,
    };

    // History arrives oldest-first, so the first key match is the
    // oldest still-open signal.
    let exact: Vec<&Cluster> = relevant
        .iter()
        .copied()
        .filter(|c| same_village(c.village.as_deref(), candidate.village.as_deref()))
        .collect();

    if !exact.is_empty() {
        let matches: Vec<CandidateMatch> = exact
            .into_iter()
            .map(|c| to_match(c, confidence_for(0.0, accept_radius_m, match_radius_m)))
            .collect();
        let (target, alternates) = split_top(matches);
        return ContinuityDecision::Expand { target, alternates };
    }

    if !relevant.is_empty() {
        let matches: Vec<CandidateMatch> = relevant
            .into_iter()
            .map(|c| to_match(c, confidence_for(accept_radius_m, accept_radius_m, match_radius_m)))
            .collect();
        let (target, alternates) = split_top(matches);
        return ContinuityDecision::PendingMerge { target, alternates };
    }

    ContinuityDecision::New
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use episignal_cluster_models::AlgorithmType;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn historical(
        id: &str,
        algorithm: AlgorithmType,
        centroid: (f64, f64),
        created: &str,
    ) -> Cluster {
        Cluster {
            cluster_id: id.to_string(),
            algorithm_type: algorithm,
            syndrome: "Fever".to_string(),
            location_code: "KEKP".to_string(),
            village: Some("Palluruthy".to_string()),
            original_creation_date: date(created),
            last_update_date: date(created),
            centroid_lat: Some(centroid.0),
            centroid_lon: Some(centroid.1),
            radius_meters: Some(100.0),
            patient_count: 3,
            expansion_count: 0,
            accept_status: AcceptStatus::Accepted,
            created_at: Utc::now(),
        }
    }

    fn gis_candidate(centroid: (f64, f64)) -> CandidateCluster {
        CandidateCluster {
            algorithm: AlgorithmType::Gis,
            syndrome: "Fever".to_string(),
            location_code: "KEKP".to_string(),
            village: None,
            cases: Vec::new(),
            centroid: Some(centroid),
            radius_m: Some(50.0),
        }
    }

    /// Shifts a latitude north by roughly `meters`.
    fn north_of(lat: f64, meters: f64) -> f64 {
        lat + meters / 111_320.0
    }

    #[test]
    fn thirty_meters_is_an_auto_merge() {
        let base = (9.9312, 76.2673);
        let history = vec![historical("GIS_A", AlgorithmType::Gis, base, "2025-03-13")];
        let candidate = gis_candidate((north_of(base.0, 30.0), base.1));

        let decision = resolve_gis(&candidate, &history, 50.0, 150.0);
        let ContinuityDecision::Expand { target, .. } = decision else {
            panic!("expected auto-merge, got {decision:?}");
        };
        assert_eq!(target.cluster_id, "GIS_A");
        // 95 - (30/50)*45 = 68, within haversine tolerance.
        assert!((target.confidence - 68.0).abs() < 0.5);
        assert_eq!(decision_status(&candidate, &history), AcceptStatus::Accepted);
    }

    fn decision_status(candidate: &CandidateCluster, history: &[Cluster]) -> AcceptStatus {
        resolve_gis(candidate, history, 50.0, 150.0).resulting_status()
    }

    #[test]
    fn hundred_meters_is_a_pending_merge() {
        let base = (9.9312, 76.2673);
        let history = vec![historical("GIS_A", AlgorithmType::Gis, base, "2025-03-13")];
        let candidate = gis_candidate((north_of(base.0, 100.0), base.1));

        let decision = resolve_gis(&candidate, &history, 50.0, 150.0);
        let ContinuityDecision::PendingMerge { target, .. } = decision else {
            panic!("expected pending merge, got {decision:?}");
        };
        // 50 - ((100-50)/100)*40 = 30.
        assert!((target.confidence - 30.0).abs() < 0.5);
    }

    #[test]
    fn three_hundred_meters_is_a_new_signal() {
        let base = (9.9312, 76.2673);
        let history = vec![historical("GIS_A", AlgorithmType::Gis, base, "2025-03-13")];
        let candidate = gis_candidate((north_of(base.0, 300.0), base.1));

        assert_eq!(resolve_gis(&candidate, &history, 50.0, 150.0), ContinuityDecision::New);
    }

    #[test]
    fn closest_match_wins_and_alternates_are_audited() {
        let base = (9.9312, 76.2673);
        let history = vec![
            historical("GIS_FAR", AlgorithmType::Gis, (north_of(base.0, 120.0), base.1), "2025-03-10"),
            historical("GIS_NEAR", AlgorithmType::Gis, (north_of(base.0, 20.0), base.1), "2025-03-12"),
        ];
        let candidate = gis_candidate(base);

        let ContinuityDecision::Expand { target, alternates } =
            resolve_gis(&candidate, &history, 50.0, 150.0)
        else {
            panic!("expected auto-merge");
        };
        assert_eq!(target.cluster_id, "GIS_NEAR");
        assert_eq!(alternates.len(), 1);
        assert_eq!(alternates[0].cluster_id, "GIS_FAR");
    }

    #[test]
    fn syndromes_and_algorithms_never_cross_match() {
        let base = (9.9312, 76.2673);
        let mut other_syndrome = historical("GIS_A", AlgorithmType::Gis, base, "2025-03-13");
        other_syndrome.syndrome = "Diarrhea".to_string();
        let abc = historical("ABC_A", AlgorithmType::Abc, base, "2025-03-13");

        let candidate = gis_candidate(base);
        assert_eq!(
            resolve_gis(&candidate, &[other_syndrome, abc], 50.0, 150.0),
            ContinuityDecision::New
        );
    }

    #[test]
    fn abc_matches_on_village_identity() {
        let base = (9.9312, 76.2673);
        let history = vec![historical("ABC_A", AlgorithmType::Abc, base, "2025-03-13")];

        let candidate = CandidateCluster {
            algorithm: AlgorithmType::Abc,
            syndrome: "fever".to_string(),
            location_code: "KEKP".to_string(),
            village: Some("palluruthy".to_string()),
            cases: Vec::new(),
            centroid: Some(base),
            radius_m: None,
        };

        let ContinuityDecision::Expand { target, .. } =
            resolve_abc(&candidate, &history, 50.0, 150.0)
        else {
            panic!("expected village continuation");
        };
        assert_eq!(target.cluster_id, "ABC_A");
        assert!((target.confidence - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn abc_same_subdistrict_different_village_needs_review() {
        let base = (9.9312, 76.2673);
        // History is Palluruthy ("KEKP"); the candidate village starts
        // with a different letter, so the full codes differ but the
        // subdistrict-level prefix matches.
        let history = vec![historical("ABC_A", AlgorithmType::Abc, base, "2025-03-13")];

        let candidate = CandidateCluster {
            algorithm: AlgorithmType::Abc,
            syndrome: "Fever".to_string(),
            location_code: "KEKM".to_string(),
            village: Some("Mulavukad".to_string()),
            cases: Vec::new(),
            centroid: None,
            radius_m: None,
        };

        assert!(matches!(
            resolve_abc(&candidate, &history, 50.0, 150.0),
            ContinuityDecision::PendingMerge { .. }
        ));
    }

    #[test]
    fn abc_other_subdistrict_is_a_new_signal() {
        let base = (9.9312, 76.2673);
        let history = vec![historical("ABC_A", AlgorithmType::Abc, base, "2025-03-13")];

        let candidate = CandidateCluster {
            algorithm: AlgorithmType::Abc,
            syndrome: "Fever".to_string(),
            location_code: "KEVM".to_string(),
            village: Some("Mulavukad".to_string()),
            cases: Vec::new(),
            centroid: None,
            radius_m: None,
        };

        assert_eq!(
            resolve_abc(&candidate, &history, 50.0, 150.0),
            ContinuityDecision::New
        );
    }

    #[test]
    fn confidence_is_monotonic_in_distance() {
        let at = |d: f64| confidence_for(d, 50.0, 150.0);
        assert!((at(0.0) - 95.0).abs() < f64::EPSILON);
        assert!((at(50.0) - 50.0).abs() < f64::EPSILON);
        assert!((at(150.0) - 10.0).abs() < f64::EPSILON);
        assert!((at(151.0) - NEW_SIGNAL_CONFIDENCE).abs() < f64::EPSILON);
        assert!(at(10.0) > at(40.0));
        assert!(at(60.0) > at(140.0));
    }
}
