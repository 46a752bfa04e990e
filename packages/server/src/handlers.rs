//! HTTP handler functions for the episignal control surface.
//!
//! Every logical outcome ("nothing to do", "blocked", "not pending")
//! answers 200 with a structured body; 500 is reserved for unexpected
//! internal failure.

use actix_web::{HttpResponse, web};
use chrono::{Duration, Utc};
use episignal_server_models::{
    ApiCluster, ApiClusterPatient, ApiHealth, ApiSkippedDate, ApiStatus, ClusterPatientsParams,
    ClusterQueryParams, PreflightResponse, ProcessResponse, ReviewRequest, ReviewResponse,
};

use crate::AppState;

fn internal_error(what: &str) -> HttpResponse {
    HttpResponse::InternalServerError().json(serde_json::json!({ "error": what }))
}

/// `GET /health`
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let healthy = state.engine.ping().await.is_ok();
    HttpResponse::Ok().json(ApiHealth {
        healthy,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `POST /smart-process`
///
/// Triggers one claim-and-process cycle.
pub async fn smart_process(state: web::Data<AppState>) -> HttpResponse {
    match state.engine.run_once().await {
        Ok(outcome) => HttpResponse::Ok().json(ProcessResponse::from_outcome(
            &outcome,
            state.engine.worker_id(),
        )),
        Err(e) => {
            log::error!("Processing cycle failed: {e}");
            internal_error("Processing cycle failed")
        }
    }
}

/// `POST /accept-cluster`
pub async fn accept_cluster(
    state: web::Data<AppState>,
    body: web::Json<ReviewRequest>,
) -> HttpResponse {
    match state.engine.accept_cluster(&body.cluster_id).await {
        Ok(accepted) => HttpResponse::Ok().json(ReviewResponse {
            success: accepted,
            cluster_id: body.cluster_id.clone(),
            message: if accepted {
                "Cluster accepted".to_string()
            } else {
                "Cluster not found or not pending".to_string()
            },
        }),
        Err(e) => {
            log::error!("Failed to accept cluster {}: {e}", body.cluster_id);
            internal_error("Failed to accept cluster")
        }
    }
}

/// `POST /reject-cluster`
pub async fn reject_cluster(
    state: web::Data<AppState>,
    body: web::Json<ReviewRequest>,
) -> HttpResponse {
    match state.engine.reject_cluster(&body.cluster_id).await {
        Ok(rejected) => HttpResponse::Ok().json(ReviewResponse {
            success: rejected,
            cluster_id: body.cluster_id.clone(),
            message: if rejected {
                "Cluster rejected; assignments removed".to_string()
            } else {
                "Cluster not found or not pending".to_string()
            },
        }),
        Err(e) => {
            log::error!("Failed to reject cluster {}: {e}", body.cluster_id);
            internal_error("Failed to reject cluster")
        }
    }
}

/// `GET /smart-status`
///
/// Aggregate processing and cluster counts.
pub async fn smart_status(state: web::Data<AppState>) -> HttpResponse {
    match state.engine.status().await {
        Ok(s) => HttpResponse::Ok().json(ApiStatus {
            dates_processed: s.dates_processed,
            last_processed_date: s.last_processed_date,
            total_clusters: s.total_clusters,
            abc_clusters: s.abc_clusters,
            gis_clusters: s.gis_clusters,
            accepted: s.accepted,
            pending: s.pending,
            total_patients: s.total_patients,
            total_expansions: s.total_expansions,
        }),
        Err(e) => {
            log::error!("Failed to build status summary: {e}");
            internal_error("Failed to build status summary")
        }
    }
}

/// `GET /smart-config`
///
/// The engine's effective configuration.
pub async fn smart_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.engine.config())
}

/// `GET /smart-preflight`
///
/// Previews which dates the next processing cycle would consider.
pub async fn smart_preflight(state: web::Data<AppState>) -> HttpResponse {
    let pending = match state.engine.status().await {
        Ok(s) => s.pending,
        Err(e) => {
            log::error!("Preflight scan failed: {e}");
            return internal_error("Preflight scan failed");
        }
    };

    match state.engine.preflight().await {
        Ok(report) => HttpResponse::Ok().json(PreflightResponse {
            eligible_dates: report.eligible,
            below_threshold: report
                .below_threshold
                .into_iter()
                .map(|(date, completeness)| ApiSkippedDate { date, completeness })
                .collect(),
            pending_clusters: pending,
        }),
        Err(e) => {
            log::error!("Preflight scan failed: {e}");
            internal_error("Preflight scan failed")
        }
    }
}

/// `GET /smart-clusters`
///
/// Lists clusters, newest first, optionally limited to the last `days`.
pub async fn smart_clusters(
    state: web::Data<AppState>,
    params: web::Query<ClusterQueryParams>,
) -> HttpResponse {
    let since = params
        .days
        .map(|days| Utc::now().date_naive() - Duration::days(days));

    match state.engine.clusters(since).await {
        Ok(clusters) => {
            let api: Vec<ApiCluster> = clusters.into_iter().map(ApiCluster::from).collect();
            HttpResponse::Ok().json(api)
        }
        Err(e) => {
            log::error!("Failed to list clusters: {e}");
            internal_error("Failed to list clusters")
        }
    }
}

/// `GET /smart-cluster-patients?clusterId=...`
///
/// One cluster's member cases with assignment metadata.
pub async fn smart_cluster_patients(
    state: web::Data<AppState>,
    params: web::Query<ClusterPatientsParams>,
) -> HttpResponse {
    match state.engine.cluster_patients(&params.cluster_id).await {
        Ok(patients) => {
            let api: Vec<ApiClusterPatient> = patients
                .into_iter()
                .map(|p| ApiClusterPatient::from_parts(p.case, p.addition_type, p.expansion_date))
                .collect();
            HttpResponse::Ok().json(api)
        }
        Err(e) => {
            log::error!(
                "Failed to list patients for cluster {}: {e}",
                params.cluster_id
            );
            internal_error("Failed to list cluster patients")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, test};
    use episignal_engine::{Engine, EngineConfig};
    use std::sync::Arc;
    use switchy_database_connection::init_sqlite_rusqlite;

    async fn test_state(name: &str) -> web::Data<AppState> {
        let path = std::env::temp_dir().join(format!("episignal_server_{name}.db"));
        let _ = std::fs::remove_file(&path);
        let db = init_sqlite_rusqlite(Some(&path)).unwrap();
        episignal_database::run_migrations(db.as_ref()).await.unwrap();
        web::Data::new(AppState {
            engine: Arc::new(Engine::new(db, EngineConfig::default())),
        })
    }

    #[actix_web::test]
    async fn health_reports_healthy_store() {
        let app = test::init_service(
            App::new()
                .app_data(test_state("health").await)
                .route("/health", web::get().to(health)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request())
            .await;
        assert!(resp.status().is_success());
        let body: ApiHealth = test::read_body_json(resp).await;
        assert!(body.healthy);
    }

    #[actix_web::test]
    async fn empty_store_processes_to_nothing_eligible() {
        let app = test::init_service(
            App::new()
                .app_data(test_state("process_empty").await)
                .route("/smart-process", web::post().to(smart_process)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post().uri("/smart-process").to_request(),
        )
        .await;
        assert!(resp.status().is_success());
        let body: ProcessResponse = test::read_body_json(resp).await;
        assert!(body.success);
        assert_eq!(body.status, "nothing_eligible");
        assert!(body.date_processed.is_none());
    }

    #[actix_web::test]
    async fn reviewing_an_unknown_cluster_is_a_logical_failure_not_a_500() {
        let app = test::init_service(
            App::new()
                .app_data(test_state("review_unknown").await)
                .route("/accept-cluster", web::post().to(accept_cluster)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/accept-cluster")
                .set_json(ReviewRequest {
                    cluster_id: "GIS_NOPE_FVR_01JAN2025_001".to_string(),
                })
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());
        let body: ReviewResponse = test::read_body_json(resp).await;
        assert!(!body.success);
    }
}
