pub mod config;
mod dispatch;
pub mod engine;
pub mod error;
pub mod journal;
pub mod message;
pub mod node;
pub mod peers;
pub mod registry;
mod runtime;
pub mod transport;
pub mod types;

pub use config::{DaemonConfig, EngineConfig};
pub use engine::{Engine, Event};
pub use error::{AppendFailure, ConfigurationError, Error, LifecycleError, Result};
pub use journal::Journal;
pub use node::{CallbackHandler, Node, NoopHandler};
pub use peers::{PeerEndpoint, PeerRegistry};
pub use registry::NodeHandle;
pub use types::*;
