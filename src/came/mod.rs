//! CAME Connect cloud API
//!
//! - `auth`: OAuth2 PKCE token manager
//! - `client`: REST client (device status, commands) with 401 retry

pub mod auth;
pub mod client;

pub use auth::{TokenManager, TokenSource};
pub use client::{CameClient, GateApi};
