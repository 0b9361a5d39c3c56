//! Comms subsystem: the external I/O surface of the service.
//!
//! Today that is one channel, the axum HTTP API. It implements
//! [`Component`] and is spawned by [`start`] through
//! [`spawn_components`], sharing the caller's shutdown token.
//!
//! [`start`] is synchronous; it returns a [`SubsystemHandle`] as soon as the
//! task is spawned and the caller decides when to await it.

pub mod axum_channel;

pub use axum_channel::{AppState, AxumChannel, build_router};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::subsystems::runtime::{Component, SubsystemHandle, spawn_components};

/// Spawn the HTTP channel and return its handle.
pub fn start(config: &Config, state: AppState, shutdown: CancellationToken) -> SubsystemHandle {
    let components: Vec<Box<dyn Component>> = vec![Box::new(AxumChannel::new(
        "http0",
        config.server.bind.clone(),
        config.server.cors_origins.clone(),
        state,
    ))];
    info!(bind = %config.server.bind, "comms: starting http channel");
    spawn_components(components, shutdown)
}
