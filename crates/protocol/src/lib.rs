//! Companion Protocol
//!
//! Shared types for communication between the Companion daemon and its
//! browser clients. These types are serialized as JSON over WebSocket and
//! the HTTP session routes.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::BrowserCommand;
pub use server::{Envelope, EventPayload};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
