pub mod codec;
pub mod config;
pub mod instance;
pub mod outcome;
pub mod registry;
pub mod reload;
pub mod wire;

pub use config::{BridgeConfig, TransportMode};
pub use instance::{InstanceKey, InstanceRecord};
pub use outcome::CommandOutcome;
