//! # parley-server
//!
//! Real-time messaging engine: sessions, topic actors and the hub that
//! routes between them, served over WebSocket and long-poll by axum.

#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod errors;
pub mod health;
pub mod hub;
pub mod longpoll;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod topic;
pub mod websocket;

pub use config::{QueueCapacities, ServerConfig, TopicConfig};
pub use context::ServerContext;
pub use errors::{SessionClosed, TransportError};
pub use hub::Hub;
pub use server::{build_router, start, ServerHandle};
pub use session::{Session, SessionStore};
