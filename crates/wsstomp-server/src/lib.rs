//! # wsstomp-server
//!
//! Axum front end for the broker engine.
//!
//! - `GET /ws`: WebSocket upgrade, one STOMP frame per message
//! - `GET /health`: liveness plus connection and topic counts
//! - `GET /metrics`: Prometheus text when a recorder is installed
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::{AppState, WsStompServer};
pub use shutdown::ShutdownCoordinator;
