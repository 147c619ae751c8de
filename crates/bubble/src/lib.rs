pub mod bridge;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;
pub mod store;
pub mod sync;
pub mod time;

#[cfg(test)]
mod test_engine;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use engine::{Engine, SocketEngine};
pub use error::{BridgeError, BridgeResult, TransportError};
pub use store::{ClientState, ClientStore};
pub use sync::{LocationSnapshot, LocationSync, SyncState};

/// Service domain reported by the production engine.
pub const DEFAULT_DOMAIN: &str = "bubble.app";
