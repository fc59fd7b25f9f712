//! Application startup and lifecycle management.

use crate::config::{StoreBackend, SyncServiceConfig};
use crate::handlers;
use crate::import::{MergeWorker, StagingWriter};
use crate::ingest::{RunCoordinator, SyncEngine, SyncPolicy};
use crate::services::auth::{ApiKeyVerifier, DisabledVerifier, RequestVerifier};
use crate::services::metrics::init_metrics;
use crate::services::payment_api::{PaymentApiClient, TransactionSource};
use crate::services::store::{Database, MemoryStore, Store};
use crate::workers::{ContinuationQueue, MergeSupervisor};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// How long shutdown waits for in-flight invocations and merges.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: SyncServiceConfig,
    pub store: Arc<dyn Store>,
    pub coordinator: Arc<RunCoordinator>,
    pub engine: Arc<SyncEngine>,
    pub continuation: Arc<ContinuationQueue>,
    pub staging: Arc<StagingWriter>,
    pub merges: Arc<MergeSupervisor>,
    pub verifier: Arc<dyn RequestVerifier>,
}

/// Stops background work once the HTTP server is gone.
#[derive(Clone)]
pub struct ShutdownHandle {
    continuation: Arc<ContinuationQueue>,
    merges: Arc<MergeSupervisor>,
}

impl ShutdownHandle {
    pub async fn shutdown(&self) {
        self.continuation.shutdown(SHUTDOWN_GRACE).await;
        self.merges.shutdown(SHUTDOWN_GRACE).await;
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: SyncServiceConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: SyncServiceConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: SyncServiceConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let store = connect_store(&config, run_migrations).await?;

        let client = PaymentApiClient::new(config.payment_api.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to create payment API client");
            e
        })?;

        Self::build_with(config, store, Arc::new(client)).await
    }

    /// Assemble the application around an existing store and transaction
    /// source.
    pub async fn build_with(
        config: SyncServiceConfig,
        store: Arc<dyn Store>,
        source: Arc<dyn TransactionSource>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let policy = SyncPolicy::from_config(&config);
        let coordinator = Arc::new(RunCoordinator::new(store.clone(), policy));
        let engine = Arc::new(SyncEngine::new(store.clone(), source, coordinator.clone()));
        let continuation = Arc::new(ContinuationQueue::new(
            config.workers.clone(),
            store.clone(),
            coordinator.clone(),
        ));
        let staging = Arc::new(StagingWriter::new(
            store.clone(),
            config.import.staging_batch_size,
        ));
        let merges = Arc::new(MergeSupervisor::new(
            store.clone(),
            MergeWorker::new(
                store.clone(),
                config.import.merge_page_size,
                Duration::from_secs(config.import.merge_retry_max_elapsed_secs),
            ),
        ));

        let verifier: Arc<dyn RequestVerifier> = if config.auth.api_keys.is_empty() {
            tracing::warn!("No API keys configured - request verification disabled");
            Arc::new(DisabledVerifier)
        } else {
            Arc::new(ApiKeyVerifier::new(config.auth.api_keys.clone()))
        };

        let state = AppState {
            config: config.clone(),
            store,
            coordinator,
            engine,
            continuation,
            staging,
            merges,
            verifier,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Sync service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            continuation: self.state.continuation.clone(),
            merges: self.state.merges.clone(),
        }
    }

    /// Start background workers, recover unfinished work and serve HTTP
    /// until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let state = self.state;

        state
            .continuation
            .start(state.engine.clone())
            .await;
        if let Err(e) = state.continuation.recover().await {
            tracing::error!(error = %e, "Failed to recover continuing sync runs");
        }
        if let Err(e) = state.merges.recover().await {
            tracing::error!(error = %e, "Failed to recover unfinished imports");
        }

        let body_limit = state.config.common.body_limit_bytes;
        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_handler))
            .route("/sync/:source", post(handlers::trigger_sync))
            .route("/sync/:source/runs/:id", get(handlers::get_run))
            .route("/sync/:source/pause", put(handlers::set_pause))
            .route("/import/csv", post(handlers::import_csv))
            .route("/import/:id", get(handlers::get_import))
            .route("/import/:id/merge", post(handlers::trigger_merge))
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-");

                    tracing::info_span!(
                        "http_request",
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                        caller = tracing::field::Empty,
                    )
                }),
            )
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(state);

        tracing::info!(
            service = "sync-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

async fn connect_store(
    config: &SyncServiceConfig,
    run_migrations: bool,
) -> Result<Arc<dyn Store>, AppError> {
    match (config.store.backend, &config.store.database) {
        (StoreBackend::Memory, _) => {
            tracing::warn!("Using in-memory store - state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        (StoreBackend::Postgres, Some(database)) => {
            let db = Database::new(
                &database.url,
                database.max_connections,
                database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                e
            })?;

            if run_migrations {
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
            }
            Ok(Arc::new(db))
        }
        (StoreBackend::Postgres, None) => Err(AppError::ConfigError(anyhow::anyhow!(
            "Postgres store selected without database settings"
        ))),
    }
}
