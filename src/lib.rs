//! Event realtime service
//!
//! Real-time connection registry, channel batching and broadcast layer for the
//! event platform. The [`realtime`] module holds the connection machinery; the
//! [`api`] module exposes it over HTTP and WebSocket.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod realtime;

pub use config::Config;
pub use error::{AppError, Result};
