use axum::Router;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod servers;

pub fn routes() -> Router<AppState> {
    Router::new().nest("/servers", servers::routes())
}

/// The full application router, mounted under `/api/v1`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
