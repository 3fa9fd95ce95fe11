use crate::error::AppError;
use crate::models::export_job;
use crate::state::AppState;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_export::BackupJob;
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/export", post(submit_export))
        .route("/jobs/{id}", get(get_job))
}

/// Proof that the request carried the intake API key.
pub struct ApiKey;

impl FromRequestParts<Arc<AppState>> for ApiKey {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided.is_empty() {
            return Err(AppError::Unauthorized("API key required".into()));
        }
        if !state.api_key_matches(provided) {
            return Err(AppError::Unauthorized("Invalid API key".into()));
        }
        Ok(ApiKey)
    }
}

async fn submit_export(
    State(state): State<Arc<AppState>>,
    _key: ApiKey,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let job: BackupJob = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid job: {}", e)))?;
    job.validate()?;

    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let tenant_id = job.tenant_id;
    let submission = state.queue.submit(job, idempotency_key).await?;
    if submission.duplicate && submission.job.tenant_id != tenant_id {
        return Err(AppError::Conflict(
            "Idempotency-Key already used for a different tenant".into(),
        ));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "jobId": submission.job.id,
            "status": submission.job.status,
            "duplicate": submission.duplicate,
        })),
    ))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    _key: ApiKey,
    Path(id): Path<String>,
) -> Result<Json<export_job::ExportJob>, AppError> {
    let db = state.db.clone();
    let job = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        export_job::find_by_id(&conn, &id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    match job {
        Some(j) => Ok(Json(j)),
        None => Err(AppError::NotFound("Job not found".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{connection::create_pool, migrate::migrate};
    use crate::routes::create_router;
    use crate::state::Storage;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const JOB: &str = r#"{
        "tenantId": 21,
        "recipientEmail": "owner@clinic.test",
        "sourceConnection": {"host": "db", "database": "clinic", "user": "ro", "password": "hunter2"},
        "destinationBucket": "exports/acme",
        "includeAssets": true
    }"#;

    fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::for_tests(dir.path());
        let pool = create_pool(&config.db_path.to_string_lossy()).unwrap();
        migrate(&pool, &config.data_dir).unwrap();
        let storage = Storage::local(&config).unwrap();
        let state = Arc::new(AppState::new(pool, config, storage));
        (dir, create_router(state))
    }

    fn submit(body: &str, api_key: Option<&str>, idempotency_key: Option<&str>) -> Request<Body> {
        let mut req = Request::post("/api/backup/export").header("content-type", "application/json");
        if let Some(k) = api_key {
            req = req.header(API_KEY_HEADER, k);
        }
        if let Some(k) = idempotency_key {
            req = req.header("Idempotency-Key", k);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_missing_or_wrong_api_key() {
        let (_dir, app) = app();
        let resp = app.clone().oneshot(submit(JOB, None, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = app.oneshot(submit(JOB, Some("nope"), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_job_is_bad_request() {
        let (_dir, app) = app();
        let resp = app
            .clone()
            .oneshot(submit(&JOB.replace("owner@clinic.test", "nobody"), Some("intake-key"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app.oneshot(submit("{not json", Some("intake-key"), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_accepts_and_dedupes_by_idempotency_key() {
        let (_dir, app) = app();
        let resp = app
            .clone()
            .oneshot(submit(JOB, Some("intake-key"), Some("req-7")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let first = json_body(resp).await;
        assert_eq!(first["status"], "queued");
        assert_eq!(first["duplicate"], false);

        let resp = app
            .clone()
            .oneshot(submit(JOB, Some("intake-key"), Some("req-7")))
            .await
            .unwrap();
        let second = json_body(resp).await;
        assert_eq!(second["jobId"], first["jobId"]);
        assert_eq!(second["duplicate"], true);

        let other_tenant = JOB.replace("\"tenantId\": 21", "\"tenantId\": 22");
        let resp = app
            .oneshot(submit(&other_tenant, Some("intake-key"), Some("req-7")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_job_status_hides_credentials() {
        let (_dir, app) = app();
        let resp = app
            .clone()
            .oneshot(submit(JOB, Some("intake-key"), None))
            .await
            .unwrap();
        let id = json_body(resp).await["jobId"].as_str().unwrap().to_string();

        let req = Request::get(format!("/api/backup/jobs/{}", id))
            .header(API_KEY_HEADER, "intake-key")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let job = json_body(resp).await;
        assert_eq!(job["tenantId"], 21);
        assert_eq!(job["status"], "queued");
        assert!(!job.to_string().contains("hunter2"));

        let req = Request::get("/api/backup/jobs/missing")
            .header(API_KEY_HEADER, "intake-key")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }
}
