#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Geodesic math for cluster detection: haversine distance, unit-sphere
//! centroid, and cluster radius statistics.
//!
//! Pure functions, no state. All distances are meters on a spherical
//! Earth of radius [`EARTH_RADIUS_M`]; all coordinates are WGS84
//! degrees as `(latitude, longitude)` pairs.

/// Mean Earth radius in meters, matching the value the rest of the
/// pipeline uses to convert DBSCAN epsilon from meters to radians.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points, in meters.
///
/// Symmetric, zero for identical points. Degenerate inputs (equal or
/// antipodal points) never produce NaN: the haversine term is clamped
/// to `[0, 1]` before the arcsine.
#[must_use]
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1r, lon1r) = (lat1.to_radians(), lon1.to_radians());
    let (lat2r, lon2r) = (lat2.to_radians(), lon2.to_radians());

    let dlat = lat2r - lat1r;
    let dlon = lon2r - lon1r;

    let a = (dlat / 2.0).sin().powi(2) + lat1r.cos() * lat2r.cos() * (dlon / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);

    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Geodesic centroid of a set of `(lat, lon)` points.
///
/// Averages unit-sphere Cartesian coordinates and converts the mean
/// vector back to latitude/longitude, which avoids the antimeridian and
/// pole distortion of a naive arithmetic mean. Returns `None` for an
/// empty slice; returns the point itself for a single point.
#[must_use]
pub fn geodesic_centroid(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.is_empty() {
        return None;
    }
    if let [only] = points {
        return Some(*only);
    }

    let (mut x, mut y, mut z) = (0.0_f64, 0.0_f64, 0.0_f64);
    for &(lat, lon) in points {
        let (latr, lonr) = (lat.to_radians(), lon.to_radians());
        x += latr.cos() * lonr.cos();
        y += latr.cos() * lonr.sin();
        z += latr.sin();
    }

    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let (x, y, z) = (x / n, y / n, z / n);

    let hyp = x.hypot(y);
    Some((z.atan2(hyp).to_degrees(), y.atan2(x).to_degrees()))
}

/// Case-count-weighted mean of two centroids.
///
/// Used when expanding a cluster: the stored centroid moves toward the
/// new batch proportionally to how many cases each side contributes.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn weighted_centroid(
    old: (f64, f64),
    old_count: u64,
    new: (f64, f64),
    new_count: u64,
) -> (f64, f64) {
    let total = (old_count + new_count) as f64;
    let (ow, nw) = (old_count as f64, new_count as f64);
    (
        old.0.mul_add(ow, new.0 * nw) / total,
        old.1.mul_add(ow, new.1 * nw) / total,
    )
}

/// Maximum haversine distance from `centroid` to any of `points`, meters.
///
/// 0 for an empty slice or coincident points.
#[must_use]
pub fn radius_max_m(centroid: (f64, f64), points: &[(f64, f64)]) -> f64 {
    points
        .iter()
        .map(|&(lat, lon)| haversine_distance_m(centroid.0, centroid.1, lat, lon))
        .fold(0.0, f64::max)
}

/// 95th-percentile (nearest-rank) haversine distance from `centroid` to
/// `points`, meters.
///
/// Preferred over the maximum because a single outlier cannot pull the
/// effective radius past the acceptance threshold. 0 for an empty slice
/// or coincident points.
#[must_use]
pub fn radius_p95_m(centroid: (f64, f64), points: &[(f64, f64)]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }

    let mut distances: Vec<f64> = points
        .iter()
        .map(|&(lat, lon)| haversine_distance_m(centroid.0, centroid.1, lat, lon))
        .collect();
    distances.sort_by(f64::total_cmp);

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let rank = ((distances.len() as f64) * 0.95).ceil() as usize;
    distances[rank.saturating_sub(1).min(distances.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn haversine_is_symmetric() {
        let d1 = haversine_distance_m(12.97, 77.59, 13.08, 80.27);
        let d2 = haversine_distance_m(13.08, 80.27, 12.97, 77.59);
        assert!((d1 - d2).abs() < EPS);
    }

    #[test]
    fn haversine_zero_iff_equal() {
        assert!(haversine_distance_m(12.5, 77.5, 12.5, 77.5).abs() < EPS);
        assert!(haversine_distance_m(12.5, 77.5, 12.5, 77.5001) > 1.0);
    }

    #[test]
    fn haversine_known_distance() {
        // Bengaluru to Chennai, roughly 290 km.
        let d = haversine_distance_m(12.9716, 77.5946, 13.0827, 80.2707);
        assert!((d - 290_000.0).abs() < 10_000.0, "got {d}");
    }

    #[test]
    fn haversine_antipodal_does_not_panic() {
        let d = haversine_distance_m(0.0, 0.0, 0.0, 180.0);
        let half_circumference = std::f64::consts::PI * EARTH_RADIUS_M;
        assert!((d - half_circumference).abs() < 1.0);
    }

    #[test]
    fn centroid_of_single_point_is_that_point() {
        assert_eq!(geodesic_centroid(&[(12.5, 77.5)]), Some((12.5, 77.5)));
        assert_eq!(geodesic_centroid(&[]), None);
    }

    #[test]
    fn centroid_near_antimeridian_does_not_wrap() {
        let (lat, lon) = geodesic_centroid(&[(10.0, 179.9), (10.0, -179.9)]).unwrap();
        assert!((lat - 10.0).abs() < 0.01);
        // Naive averaging would give lon = 0; the geodesic mean stays at
        // the dateline.
        assert!(lon.abs() > 179.0, "centroid wrapped to lon {lon}");
    }

    #[test]
    fn centroid_of_symmetric_points_is_middle() {
        let (lat, lon) = geodesic_centroid(&[(10.0, 70.0), (10.0, 72.0)]).unwrap();
        assert!((lon - 71.0).abs() < 0.01);
        assert!((lat - 10.0).abs() < 0.05);
    }

    #[test]
    fn weighted_centroid_moves_toward_larger_side() {
        let c = weighted_centroid((10.0, 70.0), 3, (10.0, 74.0), 1);
        assert!((c.1 - 71.0).abs() < EPS);
    }

    #[test]
    fn p95_radius_shrugs_off_one_outlier() {
        let centroid = (10.0, 70.0);
        // 20 tight points within ~100 m plus one ~5 km outlier.
        let mut points: Vec<(f64, f64)> = (0..20)
            .map(|i| (10.0 + f64::from(i) * 0.000_04, 70.0))
            .collect();
        points.push((10.045, 70.0));

        let p95 = radius_p95_m(centroid, &points);
        let max = radius_max_m(centroid, &points);
        assert!(max > 4_000.0);
        assert!(p95 < 200.0, "p95 was {p95}");
    }

    #[test]
    fn radius_zero_for_coincident_points() {
        let p = (10.0, 70.0);
        assert!(radius_p95_m(p, &[p, p, p]).abs() < EPS);
        assert!(radius_max_m(p, &[p, p]).abs() < EPS);
    }
}
