//! Date eligibility: which source dates are ready to be processed.
//!
//! A date qualifies once its geocoding completeness clears the
//! configured threshold and no other worker holds or completed it.
//! Dates come back oldest-first so continuity always builds on settled
//! history.

use chrono::NaiveDate;
use episignal_database::queries;
use switchy_database::Database;

use crate::EngineError;
use crate::config::EngineConfig;

/// Eligibility scan result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EligibilityReport {
    /// Dates ready to claim, oldest first.
    pub eligible: Vec<NaiveDate>,
    /// Dates skipped for incomplete geocoding, with their completeness
    /// fraction.
    pub below_threshold: Vec<(NaiveDate, f64)>,
}

/// Scans source dates within the lookback window and splits them into
/// eligible and not-yet-complete.
///
/// # Errors
///
/// Returns [`EngineError`] if a store operation fails.
pub async fn eligible_dates(
    db: &dyn Database,
    config: &EngineConfig,
    today: NaiveDate,
) -> Result<EligibilityReport, EngineError> {
    let since = today - chrono::Duration::days(config.eligibility_lookback_days);
    let completeness = queries::date_completeness(db, since).await?;
    let claimed = queries::claimed_dates(db).await?;

    let mut report = EligibilityReport::default();

    for day in completeness {
        if claimed.contains(&day.date) {
            continue;
        }
        let fraction = day.fraction();
        if fraction >= config.geocoding_threshold {
            report.eligible.push(day.date);
        } else {
            log::debug!(
                "Skipping {}: geocoding completeness {:.2} below threshold {:.2}",
                day.date,
                fraction,
                config.geocoding_threshold
            );
            report.below_threshold.push((day.date, fraction));
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use episignal_case_models::{AdminHierarchy, AreaType, PatientCase};
    use episignal_database::run_migrations;
    use switchy_database_connection::init_sqlite_rusqlite;

    async fn test_db(name: &str) -> Box<dyn Database> {
        let path = std::env::temp_dir().join(format!("episignal_eligibility_{name}.db"));
        let _ = std::fs::remove_file(&path);
        let db = init_sqlite_rusqlite(Some(&path)).unwrap();
        run_migrations(db.as_ref()).await.unwrap();
        db
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    async fn seed(db: &dyn Database, id: &str, entry: &str, geocoded: bool) {
        queries::insert_patient_case(
            db,
            &PatientCase {
                unique_id: id.to_string(),
                entry_date: date(entry),
                area_type: AreaType::Urban,
                syndrome: "Fever".to_string(),
                admin: AdminHierarchy::default(),
                latitude: geocoded.then_some(9.93),
                longitude: geocoded.then_some(76.26),
                address: None,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn splits_dates_by_completeness_threshold() {
        let db = test_db("threshold").await;

        // 2025-03-14: fully geocoded. 2025-03-15: half geocoded.
        seed(db.as_ref(), "a", "2025-03-14", true).await;
        seed(db.as_ref(), "b", "2025-03-14", true).await;
        seed(db.as_ref(), "c", "2025-03-15", true).await;
        seed(db.as_ref(), "d", "2025-03-15", false).await;

        let config = EngineConfig::default();
        let report = eligible_dates(db.as_ref(), &config, date("2025-03-16"))
            .await
            .unwrap();

        assert_eq!(report.eligible, vec![date("2025-03-14")]);
        assert_eq!(report.below_threshold.len(), 1);
        assert_eq!(report.below_threshold[0].0, date("2025-03-15"));
        assert!((report.below_threshold[0].1 - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn claimed_and_completed_dates_are_excluded() {
        let db = test_db("claimed").await;
        seed(db.as_ref(), "a", "2025-03-14", true).await;
        seed(db.as_ref(), "b", "2025-03-15", true).await;
        seed(db.as_ref(), "c", "2025-03-16", true).await;

        queries::try_claim_date(db.as_ref(), date("2025-03-14"), "worker-a", Utc::now())
            .await
            .unwrap();
        queries::try_claim_date(db.as_ref(), date("2025-03-15"), "worker-b", Utc::now())
            .await
            .unwrap();
        queries::finish_claim(
            db.as_ref(),
            date("2025-03-15"),
            "worker-b",
            episignal_cluster_models::ClaimStatus::Failed,
            Utc::now(),
        )
        .await
        .unwrap();

        let config = EngineConfig::default();
        let report = eligible_dates(db.as_ref(), &config, date("2025-03-17"))
            .await
            .unwrap();

        // In-progress excluded; failed is retryable; untouched included.
        assert_eq!(report.eligible, vec![date("2025-03-15"), date("2025-03-16")]);
    }
}
