//! Rural (ABC) candidate grouping.
//!
//! Rural coordinates geocode too coarsely for density clustering, so
//! cases are grouped on the administrative hierarchy instead: all cases
//! sharing a village and a syndrome within the processing window form
//! one candidate. Coordinates feed the candidate's provisional centroid
//! but never the grouping key.

use std::collections::BTreeMap;

use episignal_case_models::PatientCase;
use episignal_cluster_models::AlgorithmType;
use episignal_geo::{geodesic_centroid, radius_p95_m};

use crate::candidate::CandidateCluster;

/// Case-insensitive grouping key. Upstream forms are inconsistent about
/// capitalization and stray whitespace.
fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Groups rural cases into candidates by the full administrative
/// hierarchy plus syndrome.
///
/// Cases without a village name cannot be grouped and are dropped.
/// Groups smaller than `min_cluster_size` are discarded. Output order
/// is deterministic (sorted by grouping key).
#[must_use]
pub fn group_rural(cases: &[PatientCase], min_cluster_size: usize) -> Vec<CandidateCluster> {
    let mut groups: BTreeMap<String, Vec<&PatientCase>> = BTreeMap::new();

    for case in cases {
        let Some(village) = case.admin.village.as_deref().map(str::trim) else {
            continue;
        };
        if village.is_empty() {
            continue;
        }

        let key = [
            case.admin.state.as_deref().unwrap_or(""),
            case.admin.district.as_deref().unwrap_or(""),
            case.admin.subdistrict.as_deref().unwrap_or(""),
            village,
            &case.syndrome,
        ]
        .map(normalize)
        .join("|");
        groups.entry(key).or_default().push(case);
    }

    groups
        .into_values()
        .filter(|members| members.len() >= min_cluster_size)
        .map(|members| {
            let first = members[0];
            let points: Vec<(f64, f64)> = members
                .iter()
                .filter_map(|c| c.coordinates())
                .collect();
            let centroid = geodesic_centroid(&points);
            let radius_m = centroid.map(|c| radius_p95_m(c, &points));

            CandidateCluster {
                algorithm: AlgorithmType::Abc,
                syndrome: first.syndrome.clone(),
                location_code: first.admin.location_code(),
                village: first.admin.village.clone(),
                cases: members.into_iter().cloned().collect(),
                centroid,
                radius_m,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use episignal_case_models::{AdminHierarchy, AreaType};

    fn case(id: &str, village: &str, syndrome: &str) -> PatientCase {
        PatientCase {
            unique_id: id.to_string(),
            entry_date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            area_type: AreaType::Rural,
            syndrome: syndrome.to_string(),
            admin: AdminHierarchy {
                state: Some("Kerala".to_string()),
                district: Some("Ernakulam".to_string()),
                subdistrict: Some("Kochi".to_string()),
                village: (!village.is_empty()).then(|| village.to_string()),
            },
            latitude: None,
            longitude: None,
            address: None,
        }
    }

    #[test]
    fn groups_by_village_and_syndrome() {
        let cases = vec![
            case("a", "Palluruthy", "Fever"),
            case("b", "Palluruthy", "Fever"),
            case("c", "Palluruthy", "Diarrhea"),
            case("d", "Mulavukad", "Fever"),
            case("e", "Mulavukad", "Fever"),
        ];

        let candidates = group_rural(&cases, 2);
        assert_eq!(candidates.len(), 2);
        for candidate in &candidates {
            assert_eq!(candidate.len(), 2);
            assert_eq!(candidate.algorithm, AlgorithmType::Abc);
        }
    }

    #[test]
    fn village_matching_ignores_case_and_whitespace() {
        let cases = vec![
            case("a", "Palluruthy", "Fever"),
            case("b", " palluruthy ", "FEVER"),
        ];

        let candidates = group_rural(&cases, 2);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].len(), 2);
    }

    #[test]
    fn singletons_and_unnamed_villages_drop_out() {
        let cases = vec![
            case("a", "Palluruthy", "Fever"),
            case("b", "", "Fever"),
            case("c", "", "Fever"),
        ];

        assert!(group_rural(&cases, 2).is_empty());
    }

    #[test]
    fn centroid_comes_from_geocoded_members_only() {
        let mut a = case("a", "Palluruthy", "Fever");
        a.latitude = Some(9.93);
        a.longitude = Some(76.26);
        let b = case("b", "Palluruthy", "Fever");

        let candidates = group_rural(&[a, b], 2);
        assert_eq!(candidates.len(), 1);
        let (lat, lon) = candidates[0].centroid.unwrap();
        assert!((lat - 9.93).abs() < 1e-9);
        assert!((lon - 76.26).abs() < 1e-9);
    }
}
