//! Integration tests for the tenant admin API against an in-memory database.
//!
//! Discriminator tenants need no DDL, so the full onboarding flow (encrypt,
//! provision via migrations, persist) runs end to end without a Postgres
//! server.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value, json};
use tower::util::ServiceExt;

use migration::MigratorTrait;
use stratum::config::AppConfig;
use stratum::crypto::CryptoKey;
use stratum::server::{AppState, create_app};
use stratum::tenancy::admin::TenantAdminService;
use stratum::tenancy::pool_cache::{PoolCache, TenantPoolLoader};
use stratum::tenancy::provisioner::TenantProvisioner;
use stratum::tenancy::router::ConnectionRouter;

async fn setup_test_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("sqlite memory db connects");
    migration::Migrator::up(&db, None)
        .await
        .expect("registry migrations apply");
    db
}

async fn test_app() -> Router {
    let db = setup_test_db().await;
    let config = AppConfig {
        crypto_key: Some(vec![0u8; 32]),
        ..AppConfig::default()
    };
    let key = CryptoKey::new(vec![0u8; 32]).expect("valid test key");

    let loader = TenantPoolLoader::new(db.clone(), key.clone(), config.tenant_pool.clone());
    let cache = Arc::new(PoolCache::from_config(loader, &config.pool_cache));
    let provisioner = TenantProvisioner::new(
        db.clone(),
        config.database_name.clone(),
        config.tenant_url_prefix.clone(),
        config.database_url.clone(),
    );
    let admin = Arc::new(TenantAdminService::new(db.clone(), provisioner, key));

    create_app(AppState {
        db,
        config: Arc::new(config),
        router: Arc::new(ConnectionRouter::new(cache)),
        admin,
    })
}

fn create_tenant_request(tenant_id: &str) -> Request<Body> {
    let body = json!({
        "tenant_id": tenant_id,
        "isolation_type": "DISCRIMINATOR",
        "db_or_schema": "shared",
        "user_name": "acme",
        "password": "s3cret"
    });
    Request::builder()
        .method("POST")
        .uri("/api/v1/tenants")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    serde_json::from_slice(&bytes).expect("body is JSON")
}

#[tokio::test]
async fn test_tenant_onboarding_roundtrip() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(create_tenant_request("acme"))
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::CREATED);

    let created = body_json(response).await;
    assert_eq!(created["tenant_id"], "acme");
    assert_eq!(created["isolation_type"], "DISCRIMINATOR");
    assert_eq!(created["connection_url"], "postgres://localhost:5432/stratum");
    // The credential never leaves the registry.
    assert!(created.get("password").is_none());
    assert!(created.get("password_ciphertext").is_none());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/tenants/acme")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["id"], created["id"]);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/tenants")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_duplicate_tenant_returns_conflict() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(create_tenant_request("acme"))
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(create_tenant_request("acme"))
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let error = body_json(response).await;
    assert_eq!(error["code"], "CONFLICT");
}

#[tokio::test]
async fn test_unknown_tenant_returns_not_found() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/tenants/ghost")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let error = body_json(response).await;
    assert_eq!(error["code"], "NOT_FOUND");
    assert!(error["trace_id"].is_string());
}

#[tokio::test]
async fn test_unknown_isolation_type_is_rejected() {
    let app = test_app().await;

    let body = json!({
        "tenant_id": "acme",
        "isolation_type": "SHARDED",
        "db_or_schema": "shared",
        "user_name": "acme",
        "password": "s3cret"
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/tenants")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .expect("request builds"),
        )
        .await
        .expect("request succeeds");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_health_reports_ok() {
    let app = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), StatusCode::OK);
}
