pub mod blocking;
pub mod config;
pub mod error;
pub mod hub;
pub mod server;

pub use blocking::HubHandle;
pub use config::{HubConfig, PendingPolicy};
pub use error::HubError;
pub use hub::{PluginHub, Registration, SessionInfo};
pub use server::{router, serve};
