#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Outbreak cluster detection and continuity engine.
//!
//! One [`Engine::run_once`] call performs a full claim-and-process
//! cycle: sweep stale claims and overdue pending clusters, pick the
//! oldest eligible source date, claim it, group that date's cases into
//! candidate clusters (administrative grouping for rural, density
//! clustering for urban), resolve each candidate against recent
//! history, and apply the decisions inside one transaction. Workers
//! are stateless; the per-date claim row is the only coordination.

pub mod candidate;
pub mod claims;
pub mod config;
pub mod continuity;
pub mod eligibility;
pub mod expansion;
pub mod rural;
pub mod urban;

use chrono::{Duration, NaiveDate, Utc};
use episignal_case_models::{AreaType, PatientCase};
use episignal_cluster_models::{AlgorithmType, Cluster};
use episignal_database::queries::{self, ClusterPatient, StatusSummary};
use episignal_spatial::{RTreeDbscan, SpatialClusterer};
use serde::{Deserialize, Serialize};
use switchy_database::Database;

pub use crate::config::EngineConfig;
use crate::claims::{ClaimCoordinator, ClaimOutcome};
use crate::expansion::{Applied, apply_decision};
use crate::urban::UrbanParams;

/// Errors that can occur while running the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store operation failed.
    #[error(transparent)]
    Db(#[from] episignal_database::DbError),

    /// Raw database failure (transaction control).
    #[error(transparent)]
    Database(#[from] switchy_database::DatabaseError),

    /// A matched cluster disappeared between resolution and expansion.
    #[error("Cluster not found: {cluster_id}")]
    MissingCluster {
        /// The missing cluster id.
        cluster_id: String,
    },
}

/// Counters for one processed date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    /// New ABC clusters created (including provisional merges).
    pub abc_clusters_created: i64,
    /// ABC clusters expanded with new cases.
    pub abc_expansions: i64,
    /// New GIS clusters created (including provisional merges).
    pub gis_clusters_created: i64,
    /// GIS clusters expanded with new cases.
    pub gis_expansions: i64,
    /// Clusters created in a pending status this run.
    pub pending_clusters: i64,
    /// Expansions refused by the radius cap.
    pub expansion_refusals: i64,
    /// Dense urban groups discarded as overspread.
    pub overspread_rejected: i64,
}

impl RunCounters {
    fn record(&mut self, algorithm: AlgorithmType, applied: &Applied) {
        match applied {
            Applied::Created { pending, .. } => {
                match algorithm {
                    AlgorithmType::Abc => self.abc_clusters_created += 1,
                    AlgorithmType::Gis => self.gis_clusters_created += 1,
                }
                if *pending {
                    self.pending_clusters += 1;
                }
            }
            Applied::Expanded { .. } => match algorithm {
                AlgorithmType::Abc => self.abc_expansions += 1,
                AlgorithmType::Gis => self.gis_expansions += 1,
            },
            Applied::Refused { .. } => self.expansion_refusals += 1,
            Applied::NothingNew { .. } => {}
        }
    }
}

/// Result of one processed date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// The processed source date.
    pub input_date: NaiveDate,
    /// What happened.
    #[serde(flatten)]
    pub counters: RunCounters,
}

/// Outcome of one claim-and-process cycle. Every variant is a normal
/// logical result, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// A date was claimed and processed to completion.
    Processed(RunSummary),
    /// No unclaimed date currently clears the eligibility threshold.
    NothingEligible,
    /// The next date in line has unresolved pending clusters in its
    /// recent window; processing is refused until they are resolved.
    Blocked {
        /// The refused date.
        date: NaiveDate,
    },
}

/// The clustering engine. Stateless between runs; every run reads its
/// whole world from the store.
pub struct Engine {
    db: Box<dyn Database>,
    config: EngineConfig,
    worker_id: String,
    clusterer: Box<dyn SpatialClusterer + Send + Sync>,
}

impl Engine {
    /// Creates an engine with the default density clusterer and a fresh
    /// worker identity.
    #[must_use]
    pub fn new(db: Box<dyn Database>, config: EngineConfig) -> Self {
        let worker_id = format!(
            "worker-{}",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            db,
            config,
            worker_id,
            clusterer: Box::new(RTreeDbscan),
        }
    }

    /// The worker identity this engine claims dates under.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Performs one claim-and-process cycle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] only for unexpected store failures.
    /// Data-quality skips, claim conflicts, and the blocking rule are
    /// all expressed through [`RunOutcome`].
    pub async fn run_once(&self) -> Result<RunOutcome, EngineError> {
        let db = self.db.as_ref();
        let today = Utc::now().date_naive();
        let coordinator =
            ClaimCoordinator::new(db, &self.worker_id, self.config.claim_timeout_minutes);

        coordinator.sweep_stale().await?;

        let sweep_cutoff = today - Duration::days(self.config.auto_accept_timeout_days);
        let swept = queries::auto_accept_pending_before(db, sweep_cutoff).await?;
        if swept > 0 {
            log::info!("Auto-accepted {swept} pending cluster(s) created on or before {sweep_cutoff}");
        }

        let report = eligibility::eligible_dates(db, &self.config, today).await?;
        if report.eligible.is_empty() {
            log::info!("No eligible dates to process");
            return Ok(RunOutcome::NothingEligible);
        }

        for date in report.eligible {
            let blocking_from = date - Duration::days(self.config.auto_accept_timeout_days);
            if queries::has_blocking_pending(db, blocking_from, date).await? {
                log::warn!("Refusing {date}: unresolved pending clusters in its recent window");
                return Ok(RunOutcome::Blocked { date });
            }

            match coordinator.try_claim(date).await? {
                // Lost the race; another worker owns this date. Move on
                // to the next eligible one.
                ClaimOutcome::AlreadyClaimed => continue,
                ClaimOutcome::Acquired => {
                    return match self.settle_and_process(date).await {
                        Ok(summary) => {
                            coordinator.complete(date).await?;
                            log::info!(
                                "Processed {date}: {} ABC / {} GIS clusters created, {} / {} expanded",
                                summary.counters.abc_clusters_created,
                                summary.counters.gis_clusters_created,
                                summary.counters.abc_expansions,
                                summary.counters.gis_expansions
                            );
                            Ok(RunOutcome::Processed(summary))
                        }
                        Err(e) => {
                            log::error!("Processing {date} failed: {e}");
                            if let Err(mark) = coordinator.fail(date).await {
                                log::error!("Failed to mark claim on {date} as FAILED: {mark}");
                            }
                            Err(e)
                        }
                    };
                }
            }
        }

        Ok(RunOutcome::NothingEligible)
    }

    /// Everything that runs while the date's claim is held. An error
    /// from either step makes the caller mark the claim `FAILED`.
    async fn settle_and_process(&self, date: NaiveDate) -> Result<RunSummary, EngineError> {
        self.settle_gate().await?;
        self.process_date(date).await
    }

    /// Bounded wait-and-recheck loop tolerating eventual-consistency
    /// lag: cluster rows written moments ago may not yet be visible to
    /// reads. Proceeds with a warning once the wait budget is spent.
    async fn settle_gate(&self) -> Result<(), EngineError> {
        let db = self.db.as_ref();
        let mut waited = 0u64;

        loop {
            let recent =
                queries::recent_cluster_writes(db, Utc::now(), self.config.settle_window_secs)
                    .await?;
            if recent == 0 {
                return Ok(());
            }
            if waited >= self.config.settle_wait_max_secs {
                log::warn!(
                    "Proceeding despite {recent} cluster write(s) in the last {}s",
                    self.config.settle_window_secs
                );
                return Ok(());
            }

            let wait = self
                .config
                .settle_wait_secs
                .max(1)
                .min(self.config.settle_wait_max_secs - waited);
            log::info!("Store still settling ({recent} recent cluster writes); waiting {wait}s");
            tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
            waited += wait;
        }
    }

    /// Processes one claimed date. All writes happen inside a single
    /// transaction, so a failure leaves no partial clusters behind.
    async fn process_date(&self, date: NaiveDate) -> Result<RunSummary, EngineError> {
        let window_start = date - Duration::days(self.config.window_days);
        let dedup_since = date - Duration::days(self.config.dedup_lookback_days);
        let history_since = date - Duration::days(self.config.merge_lookback_days);
        let now = Utc::now();

        let txn = self.db.begin_transaction().await?;
        let db = txn.as_ref();
        let mut counters = RunCounters::default();

        // Rural pass (ABC).
        let abc_assigned = queries::assigned_case_ids(db, AlgorithmType::Abc, dedup_since).await?;
        let rural_cases: Vec<PatientCase> =
            queries::cases_in_window(db, AreaType::Rural, window_start, date)
                .await?
                .into_iter()
                .filter(|c| !abc_assigned.contains(&c.unique_id))
                .collect();
        let abc_candidates = rural::group_rural(&rural_cases, self.config.min_cluster_size);
        let abc_history = queries::recent_clusters(db, AlgorithmType::Abc, history_since).await?;

        for candidate in &abc_candidates {
            let decision = continuity::resolve_abc(
                candidate,
                &abc_history,
                self.config.accept_radius_m,
                self.config.match_radius_m,
            );
            let applied = apply_decision(
                db,
                candidate,
                &decision,
                date,
                self.config.expansion_radius_cap_m,
                now,
            )
            .await?;
            counters.record(AlgorithmType::Abc, &applied);
        }

        // Urban pass (GIS).
        let gis_assigned = queries::assigned_case_ids(db, AlgorithmType::Gis, dedup_since).await?;
        let urban_cases: Vec<PatientCase> =
            queries::cases_in_window(db, AreaType::Urban, window_start, date)
                .await?
                .into_iter()
                .filter(|c| !gis_assigned.contains(&c.unique_id) && c.has_address_signal())
                .collect();

        let grouping = urban::group_urban(
            &urban_cases,
            self.clusterer.as_ref(),
            &UrbanParams {
                eps_radians: self.config.dbscan_epsilon_radians(),
                min_cluster_size: self.config.min_cluster_size,
                max_radius_m: self.config.max_cluster_radius_m,
                bounds: self.config.bounds,
            },
        );
        #[allow(clippy::cast_possible_wrap)]
        {
            counters.overspread_rejected = grouping.overspread_rejected as i64;
        }

        let gis_history = queries::recent_clusters(db, AlgorithmType::Gis, history_since).await?;
        for candidate in &grouping.candidates {
            let decision = continuity::resolve_gis(
                candidate,
                &gis_history,
                self.config.accept_radius_m,
                self.config.match_radius_m,
            );
            let applied = apply_decision(
                db,
                candidate,
                &decision,
                date,
                self.config.expansion_radius_cap_m,
                now,
            )
            .await?;
            counters.record(AlgorithmType::Gis, &applied);
        }

        queries::insert_run_summary(
            db,
            date,
            now,
            counters.abc_clusters_created,
            counters.abc_expansions,
            counters.gis_clusters_created,
            counters.gis_expansions,
            counters.pending_clusters,
        )
        .await?;

        txn.commit().await?;

        Ok(RunSummary {
            input_date: date,
            counters,
        })
    }

    /// Human accept. Returns whether a pending cluster was actually
    /// moved to `ACCEPTED`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn accept_cluster(&self, cluster_id: &str) -> Result<bool, EngineError> {
        Ok(queries::accept_cluster(self.db.as_ref(), cluster_id).await? == 1)
    }

    /// Human reject. Cascades the cluster's assignments away. Returns
    /// whether a pending cluster was actually rejected.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn reject_cluster(&self, cluster_id: &str) -> Result<bool, EngineError> {
        Ok(queries::reject_cluster(self.db.as_ref(), cluster_id).await? == 1)
    }

    /// Aggregate counts for the status surface.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn status(&self) -> Result<StatusSummary, EngineError> {
        Ok(queries::status_summary(self.db.as_ref()).await?)
    }

    /// Eligibility preview: which dates would be processed next and
    /// which are still below the geocoding threshold.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn preflight(&self) -> Result<eligibility::EligibilityReport, EngineError> {
        eligibility::eligible_dates(self.db.as_ref(), &self.config, Utc::now().date_naive()).await
    }

    /// Lists clusters, optionally only those created since a date.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn clusters(&self, since: Option<NaiveDate>) -> Result<Vec<Cluster>, EngineError> {
        Ok(queries::list_clusters(self.db.as_ref(), since).await?)
    }

    /// One cluster's member cases with assignment metadata.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn cluster_patients(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<ClusterPatient>, EngineError> {
        Ok(queries::cluster_patients(self.db.as_ref(), cluster_id).await?)
    }

    /// Health probe: a trivial read against the store.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store is unreachable.
    pub async fn ping(&self) -> Result<(), EngineError> {
        queries::completed_date_count(self.db.as_ref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use episignal_case_models::AdminHierarchy;
    use episignal_cluster_models::{AcceptStatus, ClaimStatus};
    use episignal_database::run_migrations;
    use switchy_database_connection::init_sqlite_rusqlite;

    fn test_config() -> EngineConfig {
        EngineConfig {
            // No sleeping in tests.
            settle_wait_secs: 0,
            settle_wait_max_secs: 0,
            ..EngineConfig::default()
        }
    }

    async fn test_engine(name: &str) -> Engine {
        let path = std::env::temp_dir().join(format!("episignal_engine_{name}.db"));
        let _ = std::fs::remove_file(&path);
        let db = init_sqlite_rusqlite(Some(&path)).unwrap();
        run_migrations(db.as_ref()).await.unwrap();
        Engine::new(db, test_config())
    }

    fn urban_case(id: &str, entry: NaiveDate, lat: f64, lon: f64) -> PatientCase {
        PatientCase {
            unique_id: id.to_string(),
            entry_date: entry,
            area_type: AreaType::Urban,
            syndrome: "Fever".to_string(),
            admin: AdminHierarchy {
                state: Some("Kerala".to_string()),
                district: Some("Ernakulam".to_string()),
                subdistrict: Some("Kochi".to_string()),
                village: None,
            },
            latitude: Some(lat),
            longitude: Some(lon),
            address: Some("12 Marine Drive".to_string()),
        }
    }

    fn rural_case(id: &str, entry: NaiveDate, village: &str) -> PatientCase {
        PatientCase {
            unique_id: id.to_string(),
            entry_date: entry,
            area_type: AreaType::Rural,
            syndrome: "Fever".to_string(),
            admin: AdminHierarchy {
                state: Some("Kerala".to_string()),
                district: Some("Ernakulam".to_string()),
                subdistrict: Some("Kochi".to_string()),
                village: Some(village.to_string()),
            },
            latitude: Some(9.90),
            longitude: Some(76.30),
            address: None,
        }
    }

    async fn seed(engine: &Engine, cases: &[PatientCase]) {
        for case in cases {
            queries::insert_patient_case(engine.db.as_ref(), case)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn run_once_with_no_cases_does_nothing() {
        let engine = test_engine("empty").await;
        assert_eq!(engine.run_once().await.unwrap(), RunOutcome::NothingEligible);
    }

    #[tokio::test]
    async fn full_cycle_detects_blocks_and_continues() {
        let engine = test_engine("full_cycle").await;
        let day1 = Utc::now().date_naive() - Duration::days(2);
        let day2 = day1 + Duration::days(1);

        // Day 1: three tight urban fever cases, two rural cases in one
        // village.
        seed(
            &engine,
            &[
                urban_case("u1", day1, 9.9312, 76.2673),
                urban_case("u2", day1, 9.9313, 76.2673),
                urban_case("u3", day1, 9.9314, 76.2674),
                rural_case("r1", day1, "Palluruthy"),
                rural_case("r2", day1, "Palluruthy"),
            ],
        )
        .await;
        // Day 2: two urban cases right next to day 1's, two more rural
        // cases in the same village.
        seed(
            &engine,
            &[
                urban_case("u4", day2, 9.9313, 76.2674),
                urban_case("u5", day2, 9.9312, 76.2674),
                rural_case("r3", day2, "Palluruthy"),
                rural_case("r4", day2, "Palluruthy"),
            ],
        )
        .await;

        // First run processes day 1 and creates two pending clusters.
        let RunOutcome::Processed(first) = engine.run_once().await.unwrap() else {
            panic!("expected day 1 to process");
        };
        assert_eq!(first.input_date, day1);
        assert_eq!(first.counters.abc_clusters_created, 1);
        assert_eq!(first.counters.gis_clusters_created, 1);
        assert_eq!(first.counters.pending_clusters, 2);

        // Day 2 is refused while those clusters await review.
        assert_eq!(
            engine.run_once().await.unwrap(),
            RunOutcome::Blocked { date: day2 }
        );

        // A reviewer accepts both; day 2 now expands them instead of
        // creating duplicates.
        let clusters = engine.clusters(None).await.unwrap();
        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            assert!(engine.accept_cluster(&cluster.cluster_id).await.unwrap());
        }

        let RunOutcome::Processed(second) = engine.run_once().await.unwrap() else {
            panic!("expected day 2 to process");
        };
        assert_eq!(second.input_date, day2);
        assert_eq!(second.counters.abc_expansions, 1);
        assert_eq!(second.counters.gis_expansions, 1);
        assert_eq!(second.counters.abc_clusters_created, 0);
        assert_eq!(second.counters.gis_clusters_created, 0);

        // Expanded clusters absorbed the new cases.
        let clusters = engine.clusters(None).await.unwrap();
        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            assert_eq!(cluster.patient_count, if cluster.algorithm_type == AlgorithmType::Gis { 5 } else { 4 });
            assert_eq!(cluster.expansion_count, 1);
            assert_eq!(cluster.accept_status, AcceptStatus::Accepted);
            assert_eq!(cluster.last_update_date, day2);
        }

        // Everything claimed; a third run finds nothing.
        assert_eq!(engine.run_once().await.unwrap(), RunOutcome::NothingEligible);
    }

    #[tokio::test]
    async fn store_failure_after_claiming_marks_the_claim_failed() {
        let engine = test_engine("claim_failure").await;
        let day = Utc::now().date_naive() - Duration::days(1);
        seed(&engine, &[urban_case("u1", day, 9.9312, 76.2673)]).await;

        // Break the first read that happens with the claim held: the
        // consistency gate's created_at scan.
        engine
            .db
            .exec_raw("ALTER TABLE clusters DROP COLUMN created_at")
            .await
            .unwrap();

        assert!(engine.run_once().await.is_err());

        // The claim must not stay IN_PROGRESS until the stale sweep.
        let claim = queries::get_claim(engine.db.as_ref(), day)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.status, ClaimStatus::Failed);
    }

    #[tokio::test]
    async fn incomplete_geocoding_skips_the_date() {
        let engine = test_engine("geocoding_gate").await;
        let day = Utc::now().date_naive() - Duration::days(1);

        let mut ungeocoded = urban_case("u1", day, 0.0, 0.0);
        ungeocoded.latitude = None;
        ungeocoded.longitude = None;
        seed(&engine, &[ungeocoded, urban_case("u2", day, 9.9312, 76.2673)]).await;

        // 50% geocoded is below the 90% threshold.
        assert_eq!(engine.run_once().await.unwrap(), RunOutcome::NothingEligible);

        let report = engine.preflight().await.unwrap();
        assert!(report.eligible.is_empty());
        assert_eq!(report.below_threshold.len(), 1);
    }

    #[tokio::test]
    async fn rejecting_a_cluster_frees_its_cases() {
        let engine = test_engine("reject").await;
        let day = Utc::now().date_naive() - Duration::days(1);

        seed(
            &engine,
            &[
                rural_case("r1", day, "Palluruthy"),
                rural_case("r2", day, "Palluruthy"),
            ],
        )
        .await;

        let RunOutcome::Processed(_) = engine.run_once().await.unwrap() else {
            panic!("expected processing");
        };
        let clusters = engine.clusters(None).await.unwrap();
        assert_eq!(clusters.len(), 1);
        let id = clusters[0].cluster_id.clone();

        assert!(engine.reject_cluster(&id).await.unwrap());
        assert!(engine.cluster_patients(&id).await.unwrap().is_empty());

        // Reject is terminal.
        assert!(!engine.accept_cluster(&id).await.unwrap());
    }

    #[tokio::test]
    async fn status_reflects_processed_work() {
        let engine = test_engine("status").await;
        let day = Utc::now().date_naive() - Duration::days(1);

        seed(
            &engine,
            &[
                urban_case("u1", day, 9.9312, 76.2673),
                urban_case("u2", day, 9.9313, 76.2673),
            ],
        )
        .await;

        let RunOutcome::Processed(_) = engine.run_once().await.unwrap() else {
            panic!("expected processing");
        };

        let status = engine.status().await.unwrap();
        assert_eq!(status.dates_processed, 1);
        assert_eq!(status.total_clusters, 1);
        assert_eq!(status.gis_clusters, 1);
        assert_eq!(status.abc_clusters, 0);
        assert_eq!(status.pending, 1);
        assert_eq!(status.total_patients, 2);
        assert_eq!(status.last_processed_date, Some(day));
    }
}
