use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::config::ManagerConfig;
use crate::error::AppError;
use crate::services::supervisor::ServerSupervisor;

/// Every configured server, keyed by name.
pub struct ServerRegistry {
    backup_dir: PathBuf,
    servers: BTreeMap<String, ServerSupervisor>,
    functions: HashMap<String, Vec<String>>,
}

impl ServerRegistry {
    pub fn from_config(config: ManagerConfig) -> Result<Self, AppError> {
        config.validate()?;

        std::fs::create_dir_all(&config.backup_dir).map_err(|e| {
            AppError::Configuration(format!(
                "can't create backup directory '{}': {}",
                config.backup_dir.display(),
                e
            ))
        })?;

        let mut servers = BTreeMap::new();
        for server in config.servers {
            if servers.contains_key(&server.name) {
                return Err(AppError::Configuration(format!(
                    "a server with the name '{}' has already been defined",
                    server.name
                )));
            }
            info!(
                "loaded server '{}' from '{}'",
                server.name,
                server.executable_path.display()
            );
            let name = server.name.clone();
            servers.insert(name, ServerSupervisor::new(server, &config.backup_dir)?);
        }

        let functions = config
            .functions
            .into_iter()
            .map(|f| (f.name, f.commands))
            .collect();

        Ok(Self {
            backup_dir: config.backup_dir,
            servers,
            functions,
        })
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerSupervisor> {
        self.servers.values()
    }

    pub fn get(&self, name: &str) -> Result<&ServerSupervisor, AppError> {
        self.servers
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("no server named '{}'", name)))
    }

    pub fn function(&self, name: &str) -> Result<&[String], AppError> {
        self.functions
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| AppError::NotFound(format!("no function named '{}'", name)))
    }

    /// Starts every server flagged for automatic startup, returns how many came up.
    pub fn start_automatic(&self) -> usize {
        let mut started = 0;
        for server in self.servers().filter(|s| s.config().automatic_startup) {
            match server.start() {
                Ok(()) => started += 1,
                Err(e) => error!(server = %server.name(), "automatic startup failed: {}", e),
            }
        }
        started
    }

    /// Gracefully stops every running server at once. Stops escalate to kills on timeout.
    pub async fn shutdown(&self) -> bool {
        let stops = self
            .servers()
            .filter(|s| s.state().can_stop())
            .map(|s| async move { (s.name(), s.stop().await) });

        let mut success = true;
        for (name, result) in join_all(stops).await {
            if let Err(e) = result {
                warn!(server = %name, "failed to stop: {}", e);
                success = false;
            }
        }
        success
    }

    /// Force-kills every server that still has a live process.
    pub async fn teardown(&self) -> bool {
        let kills = self
            .servers()
            .filter(|s| s.state().can_kill())
            .map(|s| async move { (s.name(), s.kill().await) });

        let mut success = true;
        for (name, result) in join_all(kills).await {
            if let Err(e) = result {
                error!(server = %name, "failed to kill: {}", e);
                success = false;
            }
        }
        success
    }
}
