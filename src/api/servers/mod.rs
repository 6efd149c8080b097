use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

mod handlers;
mod models;

pub use models::{CommandRequest, CommandResponse};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::list_servers))
        .route("/:name", get(handlers::get_server))
        .route("/:name/start", post(handlers::start_server))
        .route("/:name/stop", post(handlers::stop_server))
        .route("/:name/kill", post(handlers::kill_server))
        .route("/:name/backup", post(handlers::backup_server))
        .route("/:name/command", post(handlers::send_command))
        .route("/:name/functions/:function", post(handlers::run_function))
}
