//! `foadmin-core`: configuration and shared error types for the foadmin
//! admin backend.

pub mod config;
pub mod error;

pub use config::FoadminConfig;
pub use error::{FoadminError, Result};
