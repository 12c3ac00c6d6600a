use revback_server::{router, AppState};
use tower::ServiceExt;

/// Exercises the full router against a real DB + Redis. Gated behind env
/// vars since `AppState::build` opens a real connection pool.
#[tokio::test]
#[ignore]
async fn health_endpoint_returns_ok() {
    let (Ok(database_url), Ok(redis_url)) =
        (std::env::var("DATABASE_URL"), std::env::var("REDIS_URL"))
    else {
        return;
    };

    std::env::set_var("DATABASE_URL", &database_url);
    std::env::set_var("REDIS_URL", &redis_url);
    std::env::set_var("JWT_SECRET", "0123456789abcdef");
    std::env::set_var("API_KEY_SALT", "fedcba9876543210");
    std::env::set_var("CREDENTIAL_ENCRYPTION_KEY", "00".repeat(32));

    let config = revback_core::config::AppConfig::from_env().unwrap();
    let state = AppState::build(config).await.unwrap();
    let app = router::build(state);

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
}
