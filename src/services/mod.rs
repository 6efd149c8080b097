pub mod backup_service;
pub mod process;
pub mod registry;
pub mod supervisor;

pub use registry::ServerRegistry;
pub use supervisor::ServerSupervisor;
