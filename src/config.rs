use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;
use crate::utils::memory::heap_megabytes;

/// Application settings loaded from environment variables
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub servers_config: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8443),
            servers_config: std::env::var("SERVERS_CONFIG")
                .unwrap_or_else(|_| "./data/servers.json".into()),
        }
    }
}

/// The document listing every managed server.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    pub backup_dir: PathBuf,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,
}

/// A named sequence of console commands.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionConfig {
    pub name: String,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub min_memory_gb: f32,
    pub max_memory_gb: f32,
    pub executable_path: PathBuf,
    pub max_restart_attempts: u32,
    #[serde(default)]
    pub automatic_startup: bool,
    #[serde(default)]
    pub additional_launch_args: Option<String>,
    #[serde(default)]
    pub java_path: Option<String>,
    /// Number of archives kept per server, 0 keeps all of them.
    #[serde(default)]
    pub max_backups: u32,
    /// Archive the data directory after every exit that was not a kill.
    #[serde(default = "default_true")]
    pub automatic_backups: bool,
}

fn default_true() -> bool {
    true
}

/// How the managed process gets launched, derived from the executable's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    Jar,
    Script,
}

impl ManagerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Configuration(format!("can't read '{}': {}", path.display(), e))
        })?;
        let config: ManagerConfig = serde_json::from_str(&content).map_err(|e| {
            AppError::Configuration(format!("can't parse '{}': {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.backup_dir.as_os_str().is_empty() {
            return Err(AppError::Configuration("backup_dir cannot be empty".into()));
        }

        for server in &self.servers {
            server.validate()?;
        }

        let mut names = HashSet::new();
        for function in &self.functions {
            if !names.insert(function.name.as_str()) {
                return Err(AppError::Configuration(format!(
                    "a function with the name '{}' has already been defined",
                    function.name
                )));
            }
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::Configuration(
                "the server name cannot be blank".into(),
            ));
        }
        if self.min_memory_gb < 0.5 {
            return Err(AppError::Configuration(format!(
                "'{}': min_memory_gb must be at least 0.5",
                self.name
            )));
        }
        if self.min_memory_gb > self.max_memory_gb {
            return Err(AppError::Configuration(format!(
                "'{}': min_memory_gb cannot exceed max_memory_gb",
                self.name
            )));
        }
        if !self.executable_path.is_file() {
            return Err(AppError::Configuration(format!(
                "'{}': executable '{}' does not exist",
                self.name,
                self.executable_path.display()
            )));
        }
        self.launch_kind()?;
        Ok(())
    }

    pub fn launch_kind(&self) -> Result<LaunchKind, AppError> {
        match self.executable_path.extension().and_then(|e| e.to_str()) {
            Some("jar") => Ok(LaunchKind::Jar),
            Some("sh") => Ok(LaunchKind::Script),
            _ => Err(AppError::Configuration(format!(
                "'{}': executable '{}' is not a .jar or .sh file",
                self.name,
                self.executable_path.display()
            ))),
        }
    }

    /// Directory containing the executable, used as the process working directory.
    pub fn server_dir(&self) -> PathBuf {
        match self.executable_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Data directory named by `level-name` in server.properties, `world` otherwise.
    pub fn world_dir(&self) -> PathBuf {
        let server_dir = self.server_dir();
        let level = std::fs::read_to_string(server_dir.join("server.properties"))
            .ok()
            .and_then(|props| {
                props.lines().find_map(|line| {
                    line.strip_prefix("level-name")
                        .and_then(|rest| rest.trim_start().strip_prefix('='))
                        .map(|value| value.trim().to_string())
                })
            })
            .filter(|level| !level.is_empty());

        server_dir.join(level.unwrap_or_else(|| "world".into()))
    }

    /// Program and arguments used to spawn the server.
    pub fn launch_command(&self) -> Result<(String, Vec<String>), AppError> {
        let file_name = self
            .executable_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| AppError::Configuration("executable has no file name".into()))?;

        let mut args = Vec::new();
        let program = match self.launch_kind()? {
            LaunchKind::Jar => {
                args.push(format!("-Xms{}M", heap_megabytes(self.min_memory_gb)));
                args.push(format!("-Xmx{}M", heap_megabytes(self.max_memory_gb)));
                args.push("-jar".into());
                args.push(file_name);
                if !cfg!(debug_assertions) {
                    args.push("nogui".into());
                }
                self.java_path.clone().unwrap_or_else(|| "java".into())
            }
            LaunchKind::Script => {
                args.push(file_name);
                "bash".into()
            }
        };

        if let Some(extra) = &self.additional_launch_args {
            args.extend(extra.split_whitespace().map(String::from));
        }

        Ok((program, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server(dir: &TempDir, file: &str) -> ServerConfig {
        let executable_path = dir.path().join(file);
        std::fs::write(&executable_path, "").unwrap();
        ServerConfig {
            name: "alpha".into(),
            min_memory_gb: 1.0,
            max_memory_gb: 2.5,
            executable_path,
            max_restart_attempts: 2,
            automatic_startup: false,
            additional_launch_args: Some("--port 25565".into()),
            java_path: None,
            max_backups: 0,
            automatic_backups: true,
        }
    }

    #[test]
    fn accepts_valid_jar_config() {
        let dir = TempDir::new().unwrap();
        assert!(server(&dir, "server.jar").validate().is_ok());
    }

    #[test]
    fn rejects_blank_name() {
        let dir = TempDir::new().unwrap();
        let mut config = server(&dir, "server.jar");
        config.name = "   ".into();
        assert!(matches!(config.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn memory_bounds() {
        let dir = TempDir::new().unwrap();

        let mut config = server(&dir, "server.jar");
        config.min_memory_gb = 0.25;
        assert!(config.validate().is_err());

        let mut config = server(&dir, "server.jar");
        config.min_memory_gb = 3.0;
        assert!(config.validate().is_err());

        let mut config = server(&dir, "server.jar");
        config.min_memory_gb = 0.5;
        config.max_memory_gb = 0.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_missing_or_unsupported_executable() {
        let dir = TempDir::new().unwrap();

        let mut config = server(&dir, "server.jar");
        config.executable_path = dir.path().join("missing.jar");
        assert!(config.validate().is_err());

        assert!(server(&dir, "server.exe").validate().is_err());
        assert!(server(&dir, "start.sh").validate().is_ok());
    }

    #[test]
    fn jar_launch_command_uses_heap_flags() {
        let dir = TempDir::new().unwrap();
        let (program, args) = server(&dir, "server.jar").launch_command().unwrap();

        assert_eq!(program, "java");
        assert_eq!(&args[..4], ["-Xms1024M", "-Xmx2560M", "-jar", "server.jar"]);
        assert_eq!(&args[args.len() - 2..], ["--port", "25565"]);
    }

    #[test]
    fn script_launch_command_skips_jvm_args() {
        let dir = TempDir::new().unwrap();
        let (program, args) = server(&dir, "start.sh").launch_command().unwrap();

        assert_eq!(program, "bash");
        assert_eq!(args, ["start.sh", "--port", "25565"]);
    }

    #[test]
    fn world_dir_follows_level_name() {
        let dir = TempDir::new().unwrap();
        let config = server(&dir, "server.jar");
        assert_eq!(config.world_dir(), dir.path().join("world"));

        std::fs::write(
            dir.path().join("server.properties"),
            "motd=hello\nlevel-name=survival\n",
        )
        .unwrap();
        assert_eq!(config.world_dir(), dir.path().join("survival"));
    }

    #[test]
    fn rejects_duplicate_functions() {
        let config = ManagerConfig {
            backup_dir: "backups".into(),
            servers: Vec::new(),
            functions: vec![
                FunctionConfig { name: "save".into(), commands: vec!["save-all".into()] },
                FunctionConfig { name: "save".into(), commands: Vec::new() },
            ],
        };
        assert!(config.validate().is_err());
    }
}
