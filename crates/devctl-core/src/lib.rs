pub mod control_proto;
pub mod env_config;
pub mod identity;
pub mod ports;

pub use control_proto::{ControlCommand, InfoSnapshot, ProtocolError, Reply};
pub use identity::Identity;
pub use ports::PortError;
