//! Urban (GIS) candidate grouping.
//!
//! Urban cases carry street-level geocodes, so candidates come from
//! density-based clustering over coordinates, one DBSCAN run per
//! syndrome. Two safeguards bound the output: a coincident-point
//! fallback recovers groups that share one exact geocode (a building or
//! compound) but fall below DBSCAN's density requirement only through
//! rounding, and candidates spread wider than the radius limit are
//! discarded as geographically implausible.

use std::collections::BTreeMap;

use episignal_case_models::{GeoBounds, PatientCase};
use episignal_cluster_models::AlgorithmType;
use episignal_geo::{geodesic_centroid, radius_p95_m};
use episignal_spatial::{GeoPoint, SpatialClusterer};

use crate::candidate::CandidateCluster;

/// Result of one urban grouping pass.
#[derive(Debug)]
pub struct UrbanGrouping {
    /// Accepted candidate clusters.
    pub candidates: Vec<CandidateCluster>,
    /// Dense groups discarded for exceeding the radius limit.
    pub overspread_rejected: usize,
    /// Cases that ended up in no candidate.
    pub unclustered: usize,
}

/// Tuning inputs for [`group_urban`].
#[derive(Debug, Clone, Copy)]
pub struct UrbanParams {
    /// DBSCAN epsilon as unit-sphere radians.
    pub eps_radians: f64,
    /// Minimum members for a candidate (DBSCAN `min_samples`).
    pub min_cluster_size: usize,
    /// Maximum accepted candidate radius, meters.
    pub max_radius_m: f64,
    /// Plausibility box; cases outside are skipped.
    pub bounds: GeoBounds,
}

fn coordinate_key(lat: f64, lon: f64) -> String {
    // Six decimals is ~0.1m, well inside geocoder repeatability.
    format!("{lat:.6},{lon:.6}")
}

fn build_candidate(members: Vec<PatientCase>) -> CandidateCluster {
    let points: Vec<(f64, f64)> = members.iter().filter_map(PatientCase::coordinates).collect();
    let centroid = geodesic_centroid(&points);
    let radius_m = centroid.map(|c| radius_p95_m(c, &points));
    let first = &members[0];

    CandidateCluster {
        algorithm: AlgorithmType::Gis,
        syndrome: first.syndrome.clone(),
        location_code: first.admin.location_code(),
        village: None,
        cases: members,
        centroid,
        radius_m,
    }
}

/// Groups urban cases into candidates via per-syndrome DBSCAN.
#[must_use]
pub fn group_urban(
    cases: &[PatientCase],
    clusterer: &dyn SpatialClusterer,
    params: &UrbanParams,
) -> UrbanGrouping {
    let mut by_syndrome: BTreeMap<String, Vec<&PatientCase>> = BTreeMap::new();
    let mut unclustered = 0usize;

    for case in cases {
        if case.has_valid_coordinates(&params.bounds) {
            by_syndrome
                .entry(case.syndrome.trim().to_lowercase())
                .or_default()
                .push(case);
        } else {
            unclustered += 1;
        }
    }

    let mut candidates = Vec::new();
    let mut overspread_rejected = 0usize;

    for members in by_syndrome.into_values() {
        let points: Vec<GeoPoint> = members
            .iter()
            .map(|c| {
                let (lat, lon) = c.coordinates().unwrap_or_default();
                GeoPoint { lat, lon }
            })
            .collect();

        let labels = clusterer.cluster(&points, params.eps_radians, params.min_cluster_size);

        let mut groups: BTreeMap<usize, Vec<PatientCase>> = BTreeMap::new();
        let mut noise: BTreeMap<String, Vec<PatientCase>> = BTreeMap::new();

        for (case, label) in members.iter().zip(&labels) {
            match label {
                Some(cluster_idx) => {
                    groups.entry(*cluster_idx).or_default().push((*case).clone());
                }
                None => {
                    let (lat, lon) = case.coordinates().unwrap_or_default();
                    noise
                        .entry(coordinate_key(lat, lon))
                        .or_default()
                        .push((*case).clone());
                }
            }
        }

        // Coincident-point fallback: enough cases at one exact geocode
        // form a candidate even when DBSCAN called them noise.
        for (_, stacked) in noise {
            if stacked.len() >= params.min_cluster_size {
                groups.insert(groups.len().wrapping_add(1_000_000), stacked);
            } else {
                unclustered += stacked.len();
            }
        }

        for (_, group) in groups {
            if group.len() < params.min_cluster_size {
                unclustered += group.len();
                continue;
            }

            let candidate = build_candidate(group);
            if candidate.radius_m.unwrap_or(0.0) > params.max_radius_m {
                log::debug!(
                    "Discarding overspread {} candidate: {} cases, radius {:.0}m",
                    candidate.syndrome,
                    candidate.len(),
                    candidate.radius_m.unwrap_or(0.0)
                );
                overspread_rejected += 1;
                unclustered += candidate.len();
            } else {
                candidates.push(candidate);
            }
        }
    }

    UrbanGrouping {
        candidates,
        overspread_rejected,
        unclustered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use episignal_case_models::{AdminHierarchy, AreaType};
    use episignal_spatial::RTreeDbscan;

    fn params() -> UrbanParams {
        UrbanParams {
            eps_radians: 350.0 / episignal_geo::EARTH_RADIUS_M,
            min_cluster_size: 2,
            max_radius_m: 800.0,
            bounds: GeoBounds::NATIONAL,
        }
    }

    fn case(id: &str, syndrome: &str, lat: f64, lon: f64) -> PatientCase {
        PatientCase {
            unique_id: id.to_string(),
            entry_date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            area_type: AreaType::Urban,
            syndrome: syndrome.to_string(),
            admin: AdminHierarchy {
                state: Some("Kerala".to_string()),
                district: Some("Ernakulam".to_string()),
                subdistrict: None,
                village: None,
            },
            latitude: Some(lat),
            longitude: Some(lon),
            address: Some("12 Marine Drive".to_string()),
        }
    }

    #[test]
    fn dense_same_syndrome_points_form_one_candidate() {
        // ~100m apart pairwise, one point 5km away.
        let cases = vec![
            case("a", "Fever", 9.9312, 76.2673),
            case("b", "Fever", 9.9318, 76.2673),
            case("c", "Fever", 9.9312, 76.2682),
            case("d", "Fever", 9.9800, 76.2673),
        ];

        let grouping = group_urban(&cases, &RTreeDbscan, &params());
        assert_eq!(grouping.candidates.len(), 1);
        assert_eq!(grouping.candidates[0].len(), 3);
        assert_eq!(grouping.unclustered, 1);
    }

    #[test]
    fn syndromes_never_mix() {
        let cases = vec![
            case("a", "Fever", 9.9312, 76.2673),
            case("b", "Diarrhea", 9.9313, 76.2673),
            case("c", "Fever", 9.9314, 76.2673),
            case("d", "Diarrhea", 9.9315, 76.2673),
        ];

        let grouping = group_urban(&cases, &RTreeDbscan, &params());
        assert_eq!(grouping.candidates.len(), 2);
        let mut syndromes: Vec<&str> = grouping
            .candidates
            .iter()
            .map(|c| c.syndrome.as_str())
            .collect();
        syndromes.sort_unstable();
        assert_eq!(syndromes, vec!["Diarrhea", "Fever"]);
    }

    #[test]
    fn coincident_points_survive_as_fallback_candidate() {
        let mut p = params();
        p.min_cluster_size = 3;

        // Exactly three cases at one geocode, not enough neighbors
        // elsewhere.
        let cases = vec![
            case("a", "Fever", 9.9312, 76.2673),
            case("b", "Fever", 9.9312, 76.2673),
            case("c", "Fever", 9.9312, 76.2673),
        ];

        let grouping = group_urban(&cases, &RTreeDbscan, &p);
        assert_eq!(grouping.candidates.len(), 1);
        assert_eq!(grouping.candidates[0].len(), 3);
        assert_eq!(grouping.candidates[0].radius_m, Some(0.0));
    }

    #[test]
    fn overspread_candidates_are_discarded() {
        let mut p = params();
        p.eps_radians = 3000.0 / episignal_geo::EARTH_RADIUS_M;
        p.max_radius_m = 800.0;

        // Chain spanning several km; dense under the inflated epsilon
        // but wider than the radius limit.
        let cases: Vec<PatientCase> = (0..6)
            .map(|i| {
                let offset = f64::from(i) * 0.02;
                case(&format!("c{i}"), "Fever", 9.9312 + offset, 76.2673)
            })
            .collect();

        let grouping = group_urban(&cases, &RTreeDbscan, &p);
        assert!(grouping.candidates.is_empty());
        assert_eq!(grouping.overspread_rejected, 1);
        assert_eq!(grouping.unclustered, 6);
    }

    #[test]
    fn out_of_bounds_coordinates_are_skipped() {
        let cases = vec![
            case("a", "Fever", 0.0, 0.0),
            case("b", "Fever", 51.5, -0.12),
        ];

        let grouping = group_urban(&cases, &RTreeDbscan, &params());
        assert!(grouping.candidates.is_empty());
        assert_eq!(grouping.unclustered, 2);
    }
}
