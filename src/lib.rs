//! portcullis gateway library
//!
//! Core functionality for the portcullis gateway: the primary WebSocket
//! listener with its handshake/dispatch/broadcast protocol, the node bridge
//! listener, and the shared gateway state (presence, health, dedupe, chat
//! runs, hot-reloadable configuration).

pub mod auth;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod logging;
pub mod providers;
pub mod server;
pub mod state;
