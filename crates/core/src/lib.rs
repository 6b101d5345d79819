//! Core types shared across ripfetch crates.
//!
//! This crate provides:
//! - The classified error taxonomy used at every component boundary
//! - Layered configuration loading

pub mod config;
pub mod error;

pub use config::{AppConfig, ConfigError};
pub use error::{ClassifiedError, ErrorKind};
