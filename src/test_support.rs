use std::sync::{Arc, OnceLock};

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::api;
use crate::core::{config::Settings, redis::RedisHandle, security, state::AppState};
use crate::db::models::Artifact;
use crate::services::artifact_registry::{self, NewArtifact};
use crate::services::filename::ArtifactIdentity;
use crate::services::lms::LmsGateway;
use crate::services::storage::{BlobStore, StoredBlob};

const TEST_DATABASE_URL_ENV: &str = "SCANBRIDGE_TEST_DATABASE_URL";
const TEST_SECRET_KEY: &str = "test-secret";

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("SCANBRIDGE_ENV", "test");
    std::env::set_var("SCANBRIDGE_STRICT_CONFIG", "0");
    std::env::set_var("SECRET_KEY", TEST_SECRET_KEY);
    std::env::remove_var("TOKEN_ENCRYPTION_KEY");
    std::env::remove_var("REDIS_PASSWORD");
    std::env::remove_var("MOODLE_SERVICE_TOKEN");
    std::env::remove_var("SUBJECT_ASSIGNMENT_MAPPING");
    std::env::remove_var("HANDLE_VERIFICATION");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::remove_var("S3_ENDPOINT");
    std::env::remove_var("S3_ACCESS_KEY");
    std::env::remove_var("S3_SECRET_KEY");
    std::env::remove_var("S3_BUCKET");
    std::env::remove_var("S3_REGION");
    std::env::set_var("AWS_EC2_METADATA_DISABLED", "true");
}

/// Database-backed tests run only when a disposable Postgres is configured.
pub(crate) struct DbContext {
    pub(crate) pool: PgPool,
    _guard: OwnedMutexGuard<()>,
}

pub(crate) async fn db_context() -> Option<DbContext> {
    let Ok(url) = std::env::var(TEST_DATABASE_URL_ENV) else {
        eprintln!("{TEST_DATABASE_URL_ENV} not set; skipping database test");
        return None;
    };
    let guard = env_lock().await;

    let pool = PgPoolOptions::new().max_connections(8).connect(&url).await.expect("test db pool");
    crate::db::run_migrations(&pool).await.expect("migrations");
    reset_db(&pool).await.expect("reset db");

    Some(DbContext { pool, _guard: guard })
}

pub(crate) async fn reset_db(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "TRUNCATE audit_events, submission_requests, artifacts, subject_mappings \
         RESTART IDENTITY CASCADE",
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn seed_artifact(pool: &PgPool, register_number: &str, subject_code: &str) -> Artifact {
    let identity = ArtifactIdentity {
        register_number: register_number.to_string(),
        subject_code: subject_code.to_string(),
        extension: "pdf".to_string(),
    };
    let artifact_id = Uuid::new_v4().to_string();
    let blob = StoredBlob {
        storage_ref: format!("artifacts/test-session/{artifact_id}.pdf"),
        size_bytes: 4,
        sha256_hex: crate::services::storage::sha256_hex(b"%PDF"),
    };
    let original_filename = format!("{register_number}_{subject_code}.pdf");

    artifact_registry::register(
        pool,
        &artifact_id,
        NewArtifact {
            identity: &identity,
            exam_session: "test-session",
            original_filename: &original_filename,
            blob: &blob,
            uploaded_by: "staff:seed",
        },
    )
    .await
    .expect("seed artifact")
}

/// App state over the given pool with in-memory LMS and blob doubles.
pub(crate) fn test_state(
    pool: PgPool,
    lms: Arc<dyn LmsGateway>,
    storage: Option<Arc<dyn BlobStore>>,
) -> AppState {
    set_test_env();
    let settings = Settings::load().expect("settings");
    let redis = RedisHandle::new(settings.redis().redis_url());
    AppState::new(settings, pool, redis, storage, lms).expect("app state")
}

/// Same as [`test_state`] but with a pool that never connects, for routes that fail before I/O.
pub(crate) fn lazy_state(lms: Arc<dyn LmsGateway>) -> AppState {
    set_test_env();
    let settings = Settings::load().expect("settings");
    let pool = PgPool::connect_lazy(&settings.database().database_url()).expect("lazy pool");
    let redis = RedisHandle::new(settings.redis().redis_url());
    AppState::new(settings, pool, redis, None, lms).expect("app state")
}

pub(crate) fn app(state: &AppState) -> Router {
    api::router::router(state.clone())
}

pub(crate) fn staff_token(subject: &str, settings: &Settings) -> String {
    security::create_access_token(subject, "staff", settings).expect("token")
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

/// Multipart body with a `file` part and an optional `exam_session` part.
pub(crate) fn upload_request(
    uri: &str,
    token: &str,
    filename: &str,
    bytes: &[u8],
    exam_session: Option<&str>,
) -> Request<Body> {
    let boundary = "scanbridge-test-boundary";
    let mut body = Vec::new();
    if let Some(session) = exam_session {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"exam_session\"\r\n\r\n{session}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
        .body(Body::from(body))
        .expect("upload request")
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}
