//! `tunlink` Core Library
//!
//! Shared functionality for `tunlink` components:
//! - Client configuration model, loading and validation
//! - Tracing/logging initialization
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::ClientConfig;
pub use error::{Error, Result};
