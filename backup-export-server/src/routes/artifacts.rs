//! Serves stored artifacts behind signed, expiring URLs.

use crate::error::AppError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use backup_export::storage::{ObjectStore, CONTENT_TYPE_TEXT, CONTENT_TYPE_XLSX, CONTENT_TYPE_ZIP};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/{bucket}/{*key}", get(download))
}

#[derive(Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("xlsx") => CONTENT_TYPE_XLSX,
        Some("zip") => CONTENT_TYPE_ZIP,
        Some("txt") => CONTENT_TYPE_TEXT,
        _ => "application/octet-stream",
    }
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<SignedQuery>,
) -> Result<impl IntoResponse, AppError> {
    let Some(store) = state.store.local_fs() else {
        return Err(AppError::NotFound("Artifacts are not served by this instance".into()));
    };
    let now = chrono::Utc::now().timestamp();
    if !store
        .signer()
        .verify(&bucket, &key, query.expires, &query.signature, now)
    {
        tracing::warn!(bucket = %bucket, key = %key, "Rejected artifact download with bad or expired signature");
        return Err(AppError::Forbidden("Invalid or expired link".into()));
    }

    let stream = store.get_stream(&bucket, None, &key).await?;
    let file_name = key.rsplit('/').next().unwrap_or("download").replace('"', "");

    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&key).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        Body::from_stream(stream),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::{connection::create_pool, migrate::migrate};
    use crate::routes::create_router;
    use crate::state::Storage;
    use axum::http::{Request, StatusCode};
    use backup_export::storage::LocalFsObjectStore;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn setup() -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::for_tests(dir.path());
        let pool = create_pool(&config.db_path.to_string_lossy()).unwrap();
        migrate(&pool, &config.data_dir).unwrap();
        let storage = Storage::local(&config).unwrap();
        let state = Arc::new(AppState::new(pool, config, storage));
        local(&state)
            .put_object(
                "exports",
                "acme/backup-temp/clinic/BACKUP_21_2024-03-05T14-07-09/README.txt",
                bytes::Bytes::from_static(b"FULL BACKUP - TENANT 21\n"),
                CONTENT_TYPE_TEXT,
            )
            .await
            .unwrap();
        (dir, state)
    }

    fn local(state: &AppState) -> &LocalFsObjectStore {
        state.store.local_fs().unwrap()
    }

    const KEY: &str = "acme/backup-temp/clinic/BACKUP_21_2024-03-05T14-07-09/README.txt";

    /// Path and query of an absolute URL.
    fn path_and_query(url: &str) -> String {
        let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        rest.find('/').map(|i| rest[i..].to_string()).unwrap_or_else(|| "/".into())
    }

    #[tokio::test]
    async fn test_presigned_url_downloads() {
        let (_dir, state) = setup().await;
        let url = local(&state)
            .presign("exports", KEY, Duration::from_secs(600))
            .await
            .unwrap();
        let app = create_router(state);

        let req = Request::get(path_and_query(&url)).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"README.txt\""
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"FULL BACKUP - TENANT 21\n");
    }

    #[tokio::test]
    async fn test_tampered_or_expired_links_are_forbidden() {
        let (_dir, state) = setup().await;
        let signer = local(&state).signer().clone();
        let app = create_router(state);

        let expires = chrono::Utc::now().timestamp() + 600;
        let signature = signer.sign("exports", KEY, expires).unwrap();
        let other_key = KEY.replace("README", "DOCUMENT");
        let tampered = format!(
            "/api/artifacts/exports/{}?expires={}&signature={}",
            other_key, expires, signature
        );
        let resp = app
            .clone()
            .oneshot(Request::get(tampered).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let past = chrono::Utc::now().timestamp() - 1;
        let expired = format!(
            "/api/artifacts/exports/{}?expires={}&signature={}",
            KEY,
            past,
            signer.sign("exports", KEY, past).unwrap()
        );
        let resp = app
            .oneshot(Request::get(expired).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (_dir, state) = setup().await;
        let signer = local(&state).signer().clone();
        let app = create_router(state);

        let key = "acme/nothing-here.zip";
        let expires = chrono::Utc::now().timestamp() + 600;
        let url = format!(
            "/api/artifacts/exports/{}?expires={}&signature={}",
            key,
            expires,
            signer.sign("exports", key, expires).unwrap()
        );
        let resp = app
            .oneshot(Request::get(url).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("a/DOCUMENT.xlsx"), CONTENT_TYPE_XLSX);
        assert_eq!(content_type_for("a/ASSETS.ZIP"), CONTENT_TYPE_ZIP);
        assert_eq!(content_type_for("a/blob"), "application/octet-stream");
    }
}
