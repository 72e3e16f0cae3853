//! came-connect-bridge - CAME Connect gate client
//!
//! Authenticates against the CAME Connect cloud, keeps a per-device status
//! snapshot current from REST polling and the realtime push channel, and
//! drives gate commands with fast polling while the gate is in motion.

pub mod came;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hub;
pub mod models;
pub mod realtime;
pub mod session;

pub use came::{CameClient, GateApi, TokenManager, TokenSource};
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{GateError, GateResult};
pub use hub::EventHub;
pub use models::{DeviceSnapshot, Direction, GateCommand, GateState, Phase, PhaseEvent, RefreshPolicy};
pub use realtime::{ConnectionState, EventClient};
pub use session::Session;
