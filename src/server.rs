//! # Server Configuration
//!
//! Wires the application together: master pool, registry migrations, the
//! tenant pool cache and its sweeper, the connection router, the admin
//! service, and the Axum router.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::db;
use crate::handlers;
use crate::telemetry;
use crate::tenancy::admin::TenantAdminService;
use crate::tenancy::pool_cache::{PoolCache, TenantPoolLoader, spawn_expiry_sweeper};
use crate::tenancy::provisioner::TenantProvisioner;
use crate::tenancy::router::ConnectionRouter;
use migration::{Migrator, MigratorTrait};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<AppConfig>,
    pub router: Arc<ConnectionRouter>,
    pub admin: Arc<TenantAdminService>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route(
            "/api/v1/tenants",
            post(handlers::tenants::create_tenant).get(handlers::tenants::list_tenants),
        )
        .route("/api/v1/tenants/{tenant_id}", get(handlers::tenants::get_tenant))
        .route("/api/v1/customers", get(handlers::customers::list_customers))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Seed a per-request trace context so error responses carry a stable
/// trace ID.
async fn trace_context_middleware(request: Request, next: Next) -> Response {
    telemetry::with_trace_context(telemetry::TraceContext::for_request(), next.run(request)).await
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None).await?;
    tracing::info!("registry migrations applied");

    let crypto_key = CryptoKey::new(
        config
            .crypto_key
            .clone()
            .ok_or("STRATUM_CRYPTO_KEY is required")?,
    )?;

    let loader = TenantPoolLoader::new(db.clone(), crypto_key.clone(), config.tenant_pool.clone());
    let cache = Arc::new(PoolCache::from_config(loader, &config.pool_cache));
    // Detached on server exit; the sweeper holds only the cache Arc.
    let _sweeper = spawn_expiry_sweeper(
        cache.clone(),
        Duration::from_secs(config.pool_cache.sweep_interval_seconds),
    );

    let router = Arc::new(ConnectionRouter::new(cache));
    let provisioner = TenantProvisioner::new(
        db.clone(),
        config.database_name.clone(),
        config.tenant_url_prefix.clone(),
        config.database_url.clone(),
    );
    let admin = Arc::new(TenantAdminService::new(db.clone(), provisioner, crypto_key));

    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let state = AppState {
        db,
        config: Arc::new(config),
        router,
        admin,
    };
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::tenants::create_tenant,
        crate::handlers::tenants::get_tenant,
        crate::handlers::tenants::list_tenants,
        crate::handlers::customers::list_customers,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::tenant::IsolationType,
            crate::handlers::tenants::CreateTenantRequest,
            crate::handlers::tenants::TenantResponse,
            crate::handlers::customers::CustomerResponse,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Stratum Tenancy API",
        description = "Multi-tenant provisioning and connection routing",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
