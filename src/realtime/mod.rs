//! Realtime push channel
//!
//! - `frame`: decoding of vendor event frames
//! - `client`: WebSocket connection lifecycle with reconnect/backoff

pub mod client;
pub mod frame;

pub use client::{Backoff, ConnectionState, EventCallback, EventClient};
pub use frame::{decode_frame, FrameError};
