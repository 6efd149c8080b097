use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;

use serde::{Serialize, Serializer};

/// Lifecycle state of a supervised server.
///
/// Settled states occupy the low nibble. A transitional state is its settled
/// target shifted into the high nibble, so `STARTING`/`STOPPING` never share a
/// bit with any settled state and capability sets can be tested with a plain
/// intersection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerState(u8);

impl ServerState {
    pub const ERROR: Self = Self(0b0000_0001);
    pub const STOPPED: Self = Self(0b0000_0010);
    pub const RUNNING: Self = Self(0b0000_0100);
    pub const KILLED: Self = Self(0b0000_1000);
    pub const TRANSITION: Self = Self(0b1111_0000);

    pub const STARTING: Self = Self::RUNNING.in_transition();
    pub const STOPPING: Self = Self::STOPPED.in_transition();

    pub const CAN_START: Self = Self(Self::ERROR.0 | Self::STOPPED.0 | Self::KILLED.0);
    pub const CAN_STOP: Self = Self(Self::RUNNING.0 | Self::STARTING.0);
    pub const CAN_KILL: Self = Self(Self::CAN_STOP.0 | Self::STOPPING.0);
    pub const ANY: Self = Self(0xFF);

    /// The transitional counterpart of a settled state.
    pub const fn in_transition(self) -> Self {
        Self(self.0 << 4)
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_transition(self) -> bool {
        self.intersects(Self::TRANSITION)
    }

    pub const fn can_start(self) -> bool {
        self.intersects(Self::CAN_START)
    }

    pub const fn can_stop(self) -> bool {
        self.intersects(Self::CAN_STOP)
    }

    pub const fn can_kill(self) -> bool {
        self.intersects(Self::CAN_KILL)
    }

    pub const fn is_running(self) -> bool {
        self.intersects(Self::RUNNING)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ERROR => "error",
            Self::STOPPED => "stopped",
            Self::RUNNING => "running",
            Self::KILLED => "killed",
            Self::STARTING => "starting",
            Self::STOPPING => "stopping",
            _ => "unknown",
        }
    }
}

impl BitOr for ServerState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name().to_uppercase(), self.0)
    }
}

impl Serialize for ServerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Point-in-time view of a supervised server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub running: bool,
    pub faulty_shutdowns: u32,
    pub max_restart_attempts: u32,
    pub creating_backup: bool,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub memory_usage_bytes: Option<u64>,
    pub world_dir: PathBuf,
    pub disk_usage_bytes: u64,
    pub backup_count: usize,
}

/// Result of a completed backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub elapsed_ms: u64,
    pub removed: Vec<PathBuf>,
}
