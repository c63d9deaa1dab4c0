pub mod console;
pub mod control_uds;
pub mod opener;
pub mod orchestrator;
pub mod peers;
pub mod service;
pub mod supervisor;
pub mod workspaces;

pub use console::{Console, LineSink};
pub use control_uds::{ControlChannel, ControlEndpoint, ControlHandler};
pub use opener::{SystemBrowser, UrlOpener};
pub use orchestrator::{OrchestratorHandle, WorkspaceOrchestrator};
pub use peers::{PeerInfo, PeerProbe};
pub use service::{Listenable, RunningService};
pub use supervisor::{ServerSupervisor, SupervisorConfig, SupervisorError, SupervisorHandle};
pub use workspaces::{Workspace, WorkspaceError};
