//! LiveDesk Shared Types and Utilities
//!
//! This crate contains the chat session domain model, the core error
//! taxonomy, and database helpers shared by the API server and the worker.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
