pub mod assembler;
pub mod error;
pub mod hooks;
pub mod maintenance;
#[allow(clippy::module_inception)]
pub mod manager;
pub mod state_machine;
pub mod types;

pub use assembler::RetrievalAssembler;
pub use error::{ManagerError, ManagerResult};
pub use hooks::{Announcer, FileAnnouncement, KeyProvider, KeyRing, LogAnnouncer};
pub use maintenance::MaintenanceHandle;
pub use manager::{NetworkManager, NetworkManagerBuilder};
pub use state_machine::HostingStateMachine;
pub use types::{
    CancelToken, ChunkDistribution, DistributionResult, HostOutcome, HostingState, HostingStatus,
    MaintenanceReport, NetworkStats,
};
