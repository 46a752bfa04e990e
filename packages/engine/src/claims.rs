//! Date-claim coordination between concurrent workers.
//!
//! Workers share no in-process state; the per-date claim row in the
//! store is the only lock. Claim acquisition rides on an atomic
//! conditional insert, so two workers racing for the same date resolve
//! in the store, never in memory.

use chrono::{Duration, NaiveDate, Utc};
use episignal_cluster_models::ClaimStatus;
use episignal_database::queries;
use switchy_database::Database;

use crate::EngineError;

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker now owns the date.
    Acquired,
    /// Another worker holds (or completed) the date.
    AlreadyClaimed,
}

/// Claims dates on behalf of one worker.
pub struct ClaimCoordinator<'a> {
    db: &'a dyn Database,
    worker_id: String,
    timeout_minutes: i64,
}

impl<'a> ClaimCoordinator<'a> {
    /// Creates a coordinator for one worker identity.
    #[must_use]
    pub fn new(db: &'a dyn Database, worker_id: impl Into<String>, timeout_minutes: i64) -> Self {
        Self {
            db,
            worker_id: worker_id.into(),
            timeout_minutes,
        }
    }

    /// The worker identity claims are written under.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Marks claims orphaned by crashed workers as `FAILED` so their
    /// dates become claimable again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn sweep_stale(&self) -> Result<u64, EngineError> {
        let now = Utc::now();
        let cutoff = now - Duration::minutes(self.timeout_minutes);
        let expired = queries::expire_stale_claims(self.db, cutoff, now).await?;
        if expired > 0 {
            log::warn!("Expired {expired} stale IN_PROGRESS claim(s) older than {} minutes", self.timeout_minutes);
        }
        Ok(expired)
    }

    /// Attempts to claim `date` for this worker.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn try_claim(&self, date: NaiveDate) -> Result<ClaimOutcome, EngineError> {
        let acquired = queries::try_claim_date(self.db, date, &self.worker_id, Utc::now()).await?;
        Ok(if acquired {
            log::info!("Worker {} claimed {date}", self.worker_id);
            ClaimOutcome::Acquired
        } else {
            ClaimOutcome::AlreadyClaimed
        })
    }

    /// Marks this worker's claim on `date` as `COMPLETED`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn complete(&self, date: NaiveDate) -> Result<(), EngineError> {
        queries::finish_claim(self.db, date, &self.worker_id, ClaimStatus::Completed, Utc::now())
            .await?;
        Ok(())
    }

    /// Marks this worker's claim on `date` as `FAILED`, freeing it for
    /// a retry by a later invocation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the store operation fails.
    pub async fn fail(&self, date: NaiveDate) -> Result<(), EngineError> {
        queries::finish_claim(self.db, date, &self.worker_id, ClaimStatus::Failed, Utc::now())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use episignal_database::run_migrations;
    use switchy_database_connection::init_sqlite_rusqlite;

    async fn test_db(name: &str) -> Box<dyn Database> {
        let path = std::env::temp_dir().join(format!("episignal_claims_{name}.db"));
        let _ = std::fs::remove_file(&path);
        let db = init_sqlite_rusqlite(Some(&path)).unwrap();
        run_migrations(db.as_ref()).await.unwrap();
        db
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn exactly_one_of_two_workers_wins_a_date() {
        let db = test_db("race").await;
        let day = date("2025-03-14");

        let a = ClaimCoordinator::new(db.as_ref(), "worker-a", 120);
        let b = ClaimCoordinator::new(db.as_ref(), "worker-b", 120);

        assert_eq!(a.try_claim(day).await.unwrap(), ClaimOutcome::Acquired);
        assert_eq!(b.try_claim(day).await.unwrap(), ClaimOutcome::AlreadyClaimed);

        // The loser picks a different date instead.
        let other = date("2025-03-15");
        assert_eq!(b.try_claim(other).await.unwrap(), ClaimOutcome::Acquired);
    }

    #[tokio::test]
    async fn failed_dates_are_retryable_completed_are_not() {
        let db = test_db("retry").await;
        let day = date("2025-03-14");
        let a = ClaimCoordinator::new(db.as_ref(), "worker-a", 120);
        let b = ClaimCoordinator::new(db.as_ref(), "worker-b", 120);

        assert_eq!(a.try_claim(day).await.unwrap(), ClaimOutcome::Acquired);
        a.fail(day).await.unwrap();
        assert_eq!(b.try_claim(day).await.unwrap(), ClaimOutcome::Acquired);
        b.complete(day).await.unwrap();
        assert_eq!(a.try_claim(day).await.unwrap(), ClaimOutcome::AlreadyClaimed);
    }
}
