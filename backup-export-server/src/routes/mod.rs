pub mod artifacts;
pub mod export;
pub mod health;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new().nest("/api/backup", export::router(state.clone()));
    if state.store.local_fs().is_some() {
        router = router.nest("/api/artifacts", artifacts::router(state.clone()));
    }
    router
        .route("/health", axum::routing::get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
