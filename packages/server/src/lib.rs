#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web control surface for the episignal clustering engine.
//!
//! Thin HTTP layer over [`episignal_engine::Engine`]: a scheduler (or a
//! human) POSTs `/smart-process` to run one claim-and-process cycle,
//! reviewers accept or reject pending clusters, and the remaining
//! endpoints expose status, configuration, and cluster contents.
//! Multiple server instances can run against one store; the per-date
//! claims keep their workers from colliding.

mod handlers;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use episignal_database::{db, run_migrations};
use episignal_engine::{Engine, EngineConfig};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    /// The clustering engine.
    pub engine: Arc<Engine>,
}

/// Starts the episignal API server.
///
/// Connects to the store, runs migrations, builds the engine from
/// environment configuration, and serves the HTTP surface. This is a
/// regular async function — the caller provides the runtime (e.g. via
/// `#[actix_web::main]`).
///
/// # Errors
///
/// Returns an `std::io::Result` error if the HTTP server fails to bind
/// or encounters a runtime error.
///
/// # Panics
///
/// Panics if the database connection or migrations fail.
#[allow(clippy::future_not_send)]
pub async fn run_server() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    log::info!("Connecting to database...");
    let db_conn = db::connect_from_env()
        .await
        .expect("Failed to connect to database");

    log::info!("Running migrations...");
    run_migrations(db_conn.as_ref())
        .await
        .expect("Failed to run migrations");

    let engine = Engine::new(db_conn, EngineConfig::from_env());
    log::info!("Engine ready as {}", engine.worker_id());

    let state = web::Data::new(AppState {
        engine: Arc::new(engine),
    });

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .route("/health", web::get().to(handlers::health))
            .route("/smart-process", web::post().to(handlers::smart_process))
            .route("/accept-cluster", web::post().to(handlers::accept_cluster))
            .route("/reject-cluster", web::post().to(handlers::reject_cluster))
            .route("/smart-status", web::get().to(handlers::smart_status))
            .route("/smart-config", web::get().to(handlers::smart_config))
            .route("/smart-preflight", web::get().to(handlers::smart_preflight))
            .route("/smart-clusters", web::get().to(handlers::smart_clusters))
            .route(
                "/smart-cluster-patients",
                web::get().to(handlers::smart_cluster_patients),
            )
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
