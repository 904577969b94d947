//! Infrastructure layer for cross-cutting concerns.
//!
//! Provides:
//! - Configuration management and validation
//! - Error handling and result types
//! - Logger initialization

pub mod config;
pub mod error;
pub mod logging;
