// Integration tests for the vault admin API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use token_vault::api::{create_admin_router, AdminAppState};
use token_vault::config::VaultConfig;
use token_vault::credentials::{MemoryTokenStore, TokenRecord, TokenStore};
use tower::ServiceExt;

const SECRET: &str = "internal-secret";

fn config(key_versions: &[u32], secret: Option<&str>) -> VaultConfig {
    let mut config = VaultConfig::default();
    for version in key_versions {
        config
            .keys
            .set_material(*version, hex::encode([*version as u8; 32]));
    }
    config.admin.internal_secret = secret.map(|s| s.to_string());
    config.jobs.retry_backoff_ms = 1;
    config
}

fn create_test_app(store: Arc<MemoryTokenStore>, config: &VaultConfig) -> Router {
    create_admin_router(AdminAppState::from_config(store, config))
}

async fn seeded_store(legacy: usize) -> Arc<MemoryTokenStore> {
    let store = Arc::new(MemoryTokenStore::new());
    for i in 0..legacy {
        store
            .put(&TokenRecord::legacy(
                format!("acct-{}", i),
                format!("access-{}", i),
                Some(format!("refresh-{}", i)),
                Utc::now() + Duration::hours(1),
            ))
            .await
            .unwrap();
    }
    store
}

fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Without a configured secret every call is rejected, even with a token.
#[tokio::test]
async fn test_no_secret_configured_rejects_all() {
    let store = seeded_store(2).await;
    let config = config(&[1], None);

    for (method, uri) in [
        ("POST", "/api/admin/vault/migrate"),
        ("POST", "/api/admin/vault/rotate"),
        ("GET", "/api/admin/vault/status"),
    ] {
        let response = create_test_app(store.clone(), &config)
            .oneshot(request(method, uri, Some("anything")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{} {}", method, uri);
    }

    assert_eq!(store.legacy_count().await.unwrap(), 2);
}

/// A wrong or missing secret is rejected before any record is touched.
#[tokio::test]
async fn test_wrong_secret_has_no_side_effects() {
    let store = seeded_store(3).await;
    let config = config(&[1], Some(SECRET));

    let response = create_test_app(store.clone(), &config)
        .oneshot(request("POST", "/api/admin/vault/migrate", Some("not-the-secret")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"], "Invalid internal secret");

    let response = create_test_app(store.clone(), &config)
        .oneshot(request("POST", "/api/admin/vault/migrate", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(store.legacy_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_migrate_returns_summary() {
    let store = seeded_store(3).await;
    let config = config(&[1], Some(SECRET));

    let response = create_test_app(store.clone(), &config)
        .oneshot(request("POST", "/api/admin/vault/migrate", Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let summary = json_body(response).await;
    assert_eq!(summary["total"], 3);
    assert_eq!(summary["migrated"], 3);
    assert_eq!(summary["skipped"], 0);
    assert_eq!(summary["errors"], serde_json::json!([]));

    assert_eq!(store.legacy_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_migrate_honors_batch_limit() {
    let store = seeded_store(5).await;
    let config = config(&[1], Some(SECRET));

    let response = create_test_app(store.clone(), &config)
        .oneshot(request("POST", "/api/admin/vault/migrate?batch_limit=2", Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["migrated"], 2);
    assert_eq!(store.legacy_count().await.unwrap(), 3);

    let response = create_test_app(store.clone(), &config)
        .oneshot(request("POST", "/api/admin/vault/migrate?batch_limit=0", Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_migrate_without_key_is_precondition_failed() {
    let store = seeded_store(1).await;
    let config = config(&[], Some(SECRET));

    let response = create_test_app(store.clone(), &config)
        .oneshot(request("POST", "/api/admin/vault/migrate", Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(store.legacy_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_rotate_flow() {
    let store = seeded_store(4).await;

    // Migrate under v1
    let v1 = config(&[1], Some(SECRET));
    let response = create_test_app(store.clone(), &v1)
        .oneshot(request("POST", "/api/admin/vault/migrate", Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Nothing newer to rotate to
    let response = create_test_app(store.clone(), &v1)
        .oneshot(request("POST", "/api/admin/vault/rotate", Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    // Add v2 and rotate
    let v2 = config(&[1, 2], Some(SECRET));
    let response = create_test_app(store.clone(), &v2)
        .oneshot(request("POST", "/api/admin/vault/rotate", Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;
    assert_eq!(summary["rotated"], 4);
    assert_eq!(summary["failed"], 0);
    assert_eq!(summary["target_version"], 2);

    let counts = store.key_version_counts().await.unwrap();
    assert_eq!(counts.get(&2), Some(&4));
}

#[tokio::test]
async fn test_status_reports_versions() {
    let store = seeded_store(2).await;
    let config = config(&[1, 2], Some(SECRET));

    let response = create_test_app(store.clone(), &config)
        .oneshot(request("GET", "/api/admin/vault/status", Some(SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status = json_body(response).await;
    assert_eq!(status["active_version"], 2);
    assert_eq!(status["legacy_records"], 2);
    assert_eq!(status["key_versions"][0]["version"], 1);
    assert_eq!(status["key_versions"][0]["status"], "retiring");
    assert_eq!(status["key_versions"][0]["safe_to_retire"], true);
    assert_eq!(status["key_versions"][1]["status"], "active");
}
