use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::models::server::{BackupReport, ServerState, ServerStatus};
use crate::services::backup_service;
use crate::services::process::{wait_for_exit, ProcessExit, ProcessHandle};
use crate::utils::memory::{directory_size, process_memory_bytes};

/// How long a graceful stop or a kill may take before escalating.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(60_000);

const SHUTDOWN_NOTICE: &str = "kick @a Server has shut down";
const BACKUP_NOTICE: &str = "kick @a a backup was requested, the server has automatically been shut down for this process. It will be up again in a bit.";
const STOP_COMMAND: &str = "stop";

/// Supervises a single configured server process.
///
/// Cloning is cheap and every clone drives the same process. Dropping the
/// last clone force-kills a process that is still alive.
#[derive(Clone)]
pub struct ServerSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    world_dir: PathBuf,
    backup_dir: PathBuf,
    shutdown_timeout: Duration,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ServerState,
    faulty_shutdowns: u32,
    // held for a whole make_backup, stop included; exits seen meanwhile skip their own archive
    creating_backup: bool,
    process: Option<ProcessHandle>,
    generation: u64,
}

struct FollowUp {
    backup: bool,
    restart: bool,
}

impl ServerSupervisor {
    pub fn new(config: ServerConfig, backup_root: &Path) -> Result<Self, AppError> {
        Self::with_shutdown_timeout(config, backup_root, SHUTDOWN_TIMEOUT)
    }

    fn with_shutdown_timeout(
        config: ServerConfig,
        backup_root: &Path,
        shutdown_timeout: Duration,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let world_dir = config.world_dir();
        let backup_dir = backup_root.join(&config.name);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                world_dir,
                backup_dir,
                shutdown_timeout,
                shared: Mutex::new(Shared {
                    state: ServerState::STOPPED,
                    faulty_shutdowns: 0,
                    creating_backup: false,
                    process: None,
                    generation: 0,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn backup_dir(&self) -> &Path {
        &self.inner.backup_dir
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn faulty_shutdowns(&self) -> u32 {
        self.lock().faulty_shutdowns
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the server process.
    ///
    /// Must be called from within a tokio runtime; exit handling is scheduled on it.
    pub fn start(&self) -> Result<(), AppError> {
        let runtime = Handle::try_current()
            .map_err(|e| AppError::Internal(format!("no async runtime available: {}", e)))?;
        let name = self.name();

        let mut shared = self.lock();
        if !shared.state.can_start() || shared.creating_backup {
            let reason = if shared.creating_backup {
                "a backup is in progress".to_string()
            } else {
                format!("it is {}", shared.state)
            };
            return Err(AppError::InvalidState(format!(
                "can't start '{}' because {}",
                name, reason
            )));
        }

        info!(server = %name, "starting server...");
        let (program, args) = self.inner.config.launch_command()?;

        shared.generation += 1;
        let generation = shared.generation;
        let weak = Arc::downgrade(&self.inner);
        let on_exit = move |exit: ProcessExit| {
            if let Some(inner) = weak.upgrade() {
                ServerSupervisor { inner }.handle_exit(generation, exit, &runtime);
            }
        };

        let server_dir = self.inner.config.server_dir();
        match ProcessHandle::spawn(name, &program, &args, &server_dir, on_exit) {
            Ok(process) => {
                shared.process = Some(process);
                shared.state = ServerState::RUNNING;
                Ok(())
            }
            Err(e) => {
                shared.state = ServerState::ERROR;
                error!(server = %name, "failed to spawn '{}': {}", program, e);
                Err(AppError::Spawn(format!("'{}': {}", name, e)))
            }
        }
    }

    /// Asks the server to stop and waits for it to exit, killing it on timeout.
    pub async fn stop(&self) -> Result<(), AppError> {
        let name = self.name();
        let mut exited = {
            let mut shared = self.lock();
            if !shared.state.can_stop() {
                return Err(AppError::InvalidState(format!(
                    "can't stop '{}' because it is {}",
                    name, shared.state
                )));
            }
            let state = shared.state;
            let process = shared.process.as_mut().ok_or_else(|| {
                AppError::Internal(format!("'{}' is {} without a process", name, state))
            })?;

            info!(server = %name, "stopping server...");
            for line in [SHUTDOWN_NOTICE, STOP_COMMAND] {
                if let Err(e) = process.send_line(line) {
                    warn!(server = %name, "failed to send '{}': {}", line, e);
                }
            }
            let exited = process.exit_receiver();
            shared.state = ServerState::STOPPING;
            exited
        };

        if timeout(self.inner.shutdown_timeout, wait_for_exit(&mut exited))
            .await
            .is_ok()
        {
            return Ok(());
        }

        error!(server = %name, "shutdown took too long! Killing the server instead.");
        match self.kill().await {
            // exited in between the timeout and the kill
            Err(AppError::InvalidState(_)) if exited.borrow().is_some() => Ok(()),
            other => other,
        }
    }

    /// Kills the whole process tree and waits for the exit to be confirmed.
    pub async fn kill(&self) -> Result<(), AppError> {
        let name = self.name();
        let mut exited = {
            let mut shared = self.lock();
            if !shared.state.can_kill() {
                return Err(AppError::InvalidState(format!(
                    "can't kill '{}' because it is {}",
                    name, shared.state
                )));
            }
            let state = shared.state;
            let process = shared.process.as_ref().ok_or_else(|| {
                AppError::Internal(format!("'{}' is {} without a process", name, state))
            })?;

            warn!(server = %name, "forcefully killing server!");
            if let Err(e) = process.kill_tree() {
                warn!(server = %name, "failed to signal process group {}: {}", process.pid(), e);
            }
            let exited = process.exit_receiver();
            shared.state = ServerState::KILLED;
            exited
        };

        timeout(self.inner.shutdown_timeout, wait_for_exit(&mut exited))
            .await
            .map_err(|_| {
                error!(server = %name, "kill was not confirmed in time");
                AppError::Timeout(format!("attempted to kill '{}', but it took too long", name))
            })?;
        Ok(())
    }

    /// Archives the data directory, stopping the server for the duration if it is running.
    ///
    /// Neither `start` nor another backup is accepted until this returns.
    pub async fn make_backup(&self) -> Result<BackupReport, AppError> {
        let name = self.name();
        info!(server = %name, "a backup has been requested, creating one now!");

        let was_running = {
            let mut shared = self.lock();
            if shared.creating_backup {
                return Err(AppError::InvalidState(format!(
                    "a backup of '{}' is already in progress",
                    name
                )));
            }
            if shared.state.is_transition() {
                return Err(AppError::InvalidState(format!(
                    "can't back up '{}' because it is {}",
                    name, shared.state
                )));
            }
            shared.creating_backup = true;

            let running = shared.state.is_running();
            if running {
                if let Some(process) = shared.process.as_mut() {
                    if let Err(e) = process.send_line(BACKUP_NOTICE) {
                        warn!(server = %name, "failed to notify players: {}", e);
                    }
                }
            }
            running
        };

        if was_running {
            if let Err(e) = self.stop_for_backup().await {
                self.lock().creating_backup = false;
                return Err(e);
            }
            warn!(server = %name, "server has been shut down, it is unsafe to leave it on during a backup");
        }

        let result = self.run_backup().await;
        self.lock().creating_backup = false;

        match &result {
            Ok(report) => info!(
                server = %name,
                "the backup has concluded! it took {:.1}s",
                report.elapsed_ms as f64 / 1000.0
            ),
            Err(e) => error!(server = %name, "backup failed: {}", e),
        }

        let restarted = if was_running { self.start() } else { Ok(()) };
        let report = result?;
        restarted?;
        Ok(report)
    }

    // A stop that races with the process exiting on its own still leaves it down.
    async fn stop_for_backup(&self) -> Result<(), AppError> {
        match self.stop().await {
            Err(AppError::InvalidState(_)) if self.lock().state.can_start() => Ok(()),
            other => other,
        }
    }

    /// Writes one line to the server console.
    pub fn send_command(&self, command: &str) -> Result<(), AppError> {
        let mut shared = self.lock();
        if !shared.state.is_running() {
            return Err(AppError::InvalidState(format!(
                "'{}' is {}, commands need a running server",
                self.name(),
                shared.state
            )));
        }
        let process = shared
            .process
            .as_mut()
            .ok_or_else(|| AppError::Internal("running without a process".into()))?;
        process
            .send_line(command)
            .map_err(|e| AppError::Internal(format!("failed to send command: {}", e)))
    }

    pub fn run_commands(&self, commands: &[String]) -> Result<(), AppError> {
        for command in commands {
            self.send_command(command)?;
        }
        Ok(())
    }

    pub fn status(&self) -> ServerStatus {
        let (state, faulty_shutdowns, creating_backup, pid, started_at) = {
            let shared = self.lock();
            let live = shared.process.as_ref().filter(|p| !p.has_exited());
            (
                shared.state,
                shared.faulty_shutdowns,
                shared.creating_backup,
                live.map(|p| p.pid()),
                live.map(|p| p.started_at().to_rfc3339()),
            )
        };

        let backup_count = backup_service::list_backups(&self.inner.backup_dir, self.name())
            .map(|b| b.len())
            .unwrap_or(0);

        ServerStatus {
            name: self.name().to_string(),
            state,
            running: state.is_running(),
            faulty_shutdowns,
            max_restart_attempts: self.inner.config.max_restart_attempts,
            creating_backup,
            pid,
            started_at,
            memory_usage_bytes: pid.and_then(process_memory_bytes),
            world_dir: self.inner.world_dir.clone(),
            disk_usage_bytes: directory_size(&self.inner.world_dir),
            backup_count,
        }
    }

    // Runs on the reaper thread, so the state is settled before any waiter sees the exit.
    fn handle_exit(&self, generation: u64, exit: ProcessExit, runtime: &Handle) {
        let name = self.name();
        let config = &self.inner.config;

        let follow_up = {
            let mut shared = self.lock();
            if shared.generation != generation {
                debug!(server = %name, "ignoring exit of a previous process");
                return;
            }
            info!(server = %name, "the server has exited with {}", exit);

            let killed = shared.state == ServerState::KILLED;
            let stopping = shared.state == ServerState::STOPPING;
            let backing_up = shared.creating_backup;

            let mut restart = false;
            if killed {
                shared.faulty_shutdowns = 0;
            } else if stopping || exit.is_clean() {
                shared.faulty_shutdowns = 0;
                shared.state = ServerState::STOPPED;
            } else {
                shared.faulty_shutdowns += 1;
                shared.state = ServerState::ERROR;
                // a running make_backup restarts the server itself
                restart = !backing_up && shared.faulty_shutdowns <= config.max_restart_attempts;
                if backing_up {
                    warn!(server = %name, "abnormal exit detected while a backup is being made");
                } else if restart {
                    warn!(
                        server = %name,
                        "abnormal exit detected, restarting server... ({}/{})",
                        shared.faulty_shutdowns, config.max_restart_attempts
                    );
                } else {
                    error!(
                        server = %name,
                        "abnormal exit detected, won't restart as the maximum number of restart attempts has been reached ({})",
                        config.max_restart_attempts
                    );
                }
            }

            let backup = !killed && !backing_up && config.automatic_backups;
            if backup {
                shared.creating_backup = true;
            }
            FollowUp { backup, restart }
        };

        if follow_up.backup || follow_up.restart {
            let supervisor = self.clone();
            runtime.spawn(async move { supervisor.after_exit(follow_up).await });
        }
    }

    async fn after_exit(&self, follow_up: FollowUp) {
        let name = self.name();

        if follow_up.backup {
            match self.run_backup().await {
                Ok(report) => info!(
                    server = %name,
                    "created backup '{}' after exit",
                    report.path.display()
                ),
                Err(e) => error!(server = %name, "backup after exit failed: {}", e),
            }
            self.lock().creating_backup = false;
        }

        if follow_up.restart {
            if let Err(e) = self.start() {
                error!(server = %name, "automatic restart failed: {}", e);
            }
        }
    }

    async fn run_backup(&self) -> Result<BackupReport, AppError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            backup_service::create_backup(
                &inner.world_dir,
                &inner.backup_dir,
                &inner.config.name,
                inner.config.max_backups,
            )
        })
        .await
        .map_err(|e| AppError::Internal(format!("backup task failed: {}", e)))?
        .map_err(AppError::from)
    }
}
