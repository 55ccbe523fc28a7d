//! LiveDesk API Library
//!
//! This crate contains the chat desk engine, its storage and automated
//! responder adapters, the viewer sync loop, and the HTTP server components.

pub mod assistant;
pub mod config;
pub mod desk;
pub mod directory;
pub mod error;
pub mod routes;
pub mod state;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use config::Config;
pub use desk::{ChatService, DeskSettings};
pub use error::{ApiError, ApiResult};
pub use state::AppState;
