//! Gateway server: HTTP probe, WebSocket listeners, startup and shutdown.

pub mod http;
pub mod startup;
pub mod ws;

pub use startup::{run_server, ServerConfig, ServerError, ServerHandle};
