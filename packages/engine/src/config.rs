//! Engine tuning parameters.
//!
//! Every knob has a production default and can be overridden through an
//! `EPISIGNAL_*` environment variable. Unparseable overrides fall back
//! to the default with a warning rather than aborting a run.

use episignal_case_models::GeoBounds;
use serde::Serialize;

/// All tuning parameters of the clustering engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Minimum geocoded fraction for a date to be processed.
    pub geocoding_threshold: f64,
    /// DBSCAN epsilon neighborhood radius, meters.
    pub dbscan_epsilon_m: f64,
    /// Minimum cases for a candidate cluster (also DBSCAN min_samples).
    pub min_cluster_size: usize,
    /// Candidate clusters spread wider than this are discarded, meters.
    pub max_cluster_radius_m: f64,
    /// An expansion may not grow a cluster's radius past this, meters.
    pub expansion_radius_cap_m: f64,
    /// Trailing entry-date window of cases fed into one day's run, days.
    pub window_days: i64,
    /// Cases assigned to a cluster updated this recently are excluded
    /// from re-clustering, days.
    pub dedup_lookback_days: i64,
    /// How far back prior clusters are considered for continuity, days.
    pub merge_lookback_days: i64,
    /// How far back source dates are scanned for eligibility, days.
    pub eligibility_lookback_days: i64,
    /// Pending clusters older than this are auto-accepted, days.
    pub auto_accept_timeout_days: i64,
    /// Continuity tier 1: auto-expansion distance, meters.
    pub accept_radius_m: f64,
    /// Continuity tier 2: pending-merge distance, meters.
    pub match_radius_m: f64,
    /// `IN_PROGRESS` claims older than this are swept to `FAILED`,
    /// minutes.
    pub claim_timeout_minutes: i64,
    /// Cluster writes newer than this mean the store is still settling,
    /// seconds.
    pub settle_window_secs: u64,
    /// First wait when the store is settling, seconds.
    pub settle_wait_secs: u64,
    /// Total settle wait budget before proceeding anyway, seconds.
    pub settle_wait_max_secs: u64,
    /// Plausibility bounding box for case coordinates.
    pub bounds: GeoBounds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            geocoding_threshold: 0.90,
            dbscan_epsilon_m: 350.0,
            min_cluster_size: 2,
            max_cluster_radius_m: 800.0,
            expansion_radius_cap_m: 1000.0,
            window_days: 7,
            dedup_lookback_days: 14,
            merge_lookback_days: 14,
            eligibility_lookback_days: 60,
            auto_accept_timeout_days: 3,
            accept_radius_m: 50.0,
            match_radius_m: 150.0,
            claim_timeout_minutes: 120,
            settle_window_secs: 120,
            settle_wait_secs: 90,
            settle_wait_max_secs: 180,
            bounds: GeoBounds::NATIONAL,
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparseable {name}='{raw}', using default");
            default
        }),
        Err(_) => default,
    }
}

impl EngineConfig {
    /// Builds a config from defaults overlaid with `EPISIGNAL_*`
    /// environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            geocoding_threshold: env_parse("EPISIGNAL_GEOCODING_THRESHOLD", d.geocoding_threshold),
            dbscan_epsilon_m: env_parse("EPISIGNAL_DBSCAN_EPSILON_M", d.dbscan_epsilon_m),
            min_cluster_size: env_parse("EPISIGNAL_MIN_CLUSTER_SIZE", d.min_cluster_size),
            max_cluster_radius_m: env_parse(
                "EPISIGNAL_MAX_CLUSTER_RADIUS_M",
                d.max_cluster_radius_m,
            ),
            expansion_radius_cap_m: env_parse(
                "EPISIGNAL_EXPANSION_RADIUS_CAP_M",
                d.expansion_radius_cap_m,
            ),
            window_days: env_parse("EPISIGNAL_WINDOW_DAYS", d.window_days),
            dedup_lookback_days: env_parse("EPISIGNAL_DEDUP_LOOKBACK_DAYS", d.dedup_lookback_days),
            merge_lookback_days: env_parse("EPISIGNAL_MERGE_LOOKBACK_DAYS", d.merge_lookback_days),
            eligibility_lookback_days: env_parse(
                "EPISIGNAL_ELIGIBILITY_LOOKBACK_DAYS",
                d.eligibility_lookback_days,
            ),
            auto_accept_timeout_days: env_parse(
                "EPISIGNAL_AUTO_ACCEPT_TIMEOUT_DAYS",
                d.auto_accept_timeout_days,
            ),
            accept_radius_m: env_parse("EPISIGNAL_ACCEPT_RADIUS_M", d.accept_radius_m),
            match_radius_m: env_parse("EPISIGNAL_MATCH_RADIUS_M", d.match_radius_m),
            claim_timeout_minutes: env_parse(
                "EPISIGNAL_CLAIM_TIMEOUT_MINUTES",
                d.claim_timeout_minutes,
            ),
            settle_window_secs: env_parse("EPISIGNAL_SETTLE_WINDOW_SECS", d.settle_window_secs),
            settle_wait_secs: env_parse("EPISIGNAL_SETTLE_WAIT_SECS", d.settle_wait_secs),
            settle_wait_max_secs: env_parse(
                "EPISIGNAL_SETTLE_WAIT_MAX_SECS",
                d.settle_wait_max_secs,
            ),
            bounds: d.bounds,
        }
    }

    /// DBSCAN epsilon as an angle on the unit sphere, the unit
    /// [`episignal_spatial::SpatialClusterer`] expects.
    #[must_use]
    pub fn dbscan_epsilon_radians(&self) -> f64 {
        self.dbscan_epsilon_m / episignal_geo::EARTH_RADIUS_M
    }
}
