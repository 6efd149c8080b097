use axum::{
    extract::{Path, State},
    Json,
};
use tracing::info;

use crate::error::AppError;
use crate::models::server::{BackupReport, ServerStatus};
use crate::services::ServerSupervisor;
use crate::AppState;

use super::models::{CommandRequest, CommandResponse};

// Status walks the world directory and queries the OS, keep it off the async workers.
async fn snapshot(server: ServerSupervisor) -> Result<ServerStatus, AppError> {
    tokio::task::spawn_blocking(move || server.status())
        .await
        .map_err(|e| AppError::Internal(format!("status task failed: {}", e)))
}

pub async fn list_servers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ServerStatus>>, AppError> {
    let registry = state.registry.clone();
    let statuses = tokio::task::spawn_blocking(move || {
        registry.servers().map(|s| s.status()).collect::<Vec<_>>()
    })
    .await
    .map_err(|e| AppError::Internal(format!("status task failed: {}", e)))?;
    Ok(Json(statuses))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServerStatus>, AppError> {
    let server = state.registry.get(&name)?.clone();
    Ok(Json(snapshot(server).await?))
}

pub async fn start_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServerStatus>, AppError> {
    let server = state.registry.get(&name)?.clone();
    server.start()?;
    Ok(Json(snapshot(server).await?))
}

pub async fn stop_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServerStatus>, AppError> {
    let server = state.registry.get(&name)?.clone();
    server.stop().await?;
    Ok(Json(snapshot(server).await?))
}

pub async fn kill_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServerStatus>, AppError> {
    let server = state.registry.get(&name)?.clone();
    server.kill().await?;
    Ok(Json(snapshot(server).await?))
}

pub async fn backup_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<BackupReport>, AppError> {
    let server = state.registry.get(&name)?.clone();
    let report = server.make_backup().await?;
    info!(
        server = %name,
        "backup '{}' ({} bytes) done in {}ms",
        report.path.display(),
        report.size_bytes,
        report.elapsed_ms
    );
    Ok(Json(report))
}

pub async fn send_command(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, AppError> {
    state.registry.get(&name)?.send_command(&body.command)?;
    Ok(Json(CommandResponse { success: true, sent: 1 }))
}

pub async fn run_function(
    State(state): State<AppState>,
    Path((name, function)): Path<(String, String)>,
) -> Result<Json<CommandResponse>, AppError> {
    let server = state.registry.get(&name)?;
    let commands = state.registry.function(&function)?;
    server.run_commands(commands)?;
    Ok(Json(CommandResponse {
        success: true,
        sent: commands.len(),
    }))
}
