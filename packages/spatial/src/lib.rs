#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Density-based spatial clustering behind a pluggable trait.
//!
//! The urban (GIS) pipeline needs DBSCAN over geographic points with a
//! haversine metric. The algorithm lives behind [`SpatialClusterer`] so
//! it can be swapped or optimized without touching the continuity
//! resolver. The default implementation, [`RTreeDbscan`], builds an
//! R-tree over the input points and answers epsilon-neighborhood
//! queries with a bounding-box prune followed by an exact haversine
//! check.

use episignal_geo::{EARTH_RADIUS_M, haversine_distance_m};
use rstar::{AABB, RTree, RTreeObject};

/// Meters per degree of latitude (and of longitude at the equator).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// A `(latitude, longitude)` input point, WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lon: f64,
}

/// Cluster label for one input point: `Some(cluster_index)` or `None`
/// for noise.
pub type Label = Option<usize>;

/// Density-based clustering over geographic points.
///
/// `eps_radians` is the neighborhood radius as an angle on the unit
/// sphere (`meters / EARTH_RADIUS_M`), matching the convention of
/// haversine-metric DBSCAN. Output labels are parallel to the input
/// slice; cluster indices are dense starting at 0.
pub trait SpatialClusterer {
    /// Assigns a cluster label (or noise) to every input point.
    fn cluster(&self, points: &[GeoPoint], eps_radians: f64, min_samples: usize) -> Vec<Label>;
}

/// One input point stored in the R-tree with its original index.
struct IndexedPoint {
    idx: usize,
    lat: f64,
    lon: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lon, self.lat])
    }
}

/// DBSCAN with R-tree accelerated epsilon-neighborhood queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct RTreeDbscan;

impl RTreeDbscan {
    /// Indices of all points within `eps_m` meters of `center` (the
    /// center itself included, as DBSCAN core-point counting requires).
    fn neighbors(tree: &RTree<IndexedPoint>, center: &IndexedPoint, eps_m: f64) -> Vec<usize> {
        // Degree envelope that over-covers the metric ball; longitude
        // degrees shrink with latitude.
        let dlat = eps_m / METERS_PER_DEGREE;
        let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
        let dlon = dlat / cos_lat;

        let envelope = AABB::from_corners(
            [center.lon - dlon, center.lat - dlat],
            [center.lon + dlon, center.lat + dlat],
        );

        tree.locate_in_envelope_intersecting(&envelope)
            .filter(|p| haversine_distance_m(center.lat, center.lon, p.lat, p.lon) <= eps_m)
            .map(|p| p.idx)
            .collect()
    }
}

impl SpatialClusterer for RTreeDbscan {
    fn cluster(&self, points: &[GeoPoint], eps_radians: f64, min_samples: usize) -> Vec<Label> {
        let eps_m = eps_radians * EARTH_RADIUS_M;

        let tree = RTree::bulk_load(
            points
                .iter()
                .enumerate()
                .map(|(idx, p)| IndexedPoint {
                    idx,
                    lat: p.lat,
                    lon: p.lon,
                })
                .collect(),
        );

        let mut labels: Vec<Label> = vec![None; points.len()];
        let mut visited = vec![false; points.len()];
        let mut next_cluster = 0usize;

        for start in 0..points.len() {
            if visited[start] {
                continue;
            }
            visited[start] = true;

            let entry = IndexedPoint {
                idx: start,
                lat: points[start].lat,
                lon: points[start].lon,
            };
            let seeds = Self::neighbors(&tree, &entry, eps_m);
            if seeds.len() < min_samples {
                // Not a core point; stays noise unless a later cluster
                // reaches it.
                continue;
            }

            let cluster = next_cluster;
            next_cluster += 1;
            labels[start] = Some(cluster);

            // Breadth-first expansion over density-reachable points.
            let mut queue: Vec<usize> = seeds;
            while let Some(idx) = queue.pop() {
                if labels[idx].is_none() {
                    labels[idx] = Some(cluster);
                }
                if visited[idx] {
                    continue;
                }
                visited[idx] = true;

                let entry = IndexedPoint {
                    idx,
                    lat: points[idx].lat,
                    lon: points[idx].lon,
                };
                let reachable = Self::neighbors(&tree, &entry, eps_m);
                if reachable.len() >= min_samples {
                    queue.extend(reachable);
                }
            }
        }

        labels
    }
}
