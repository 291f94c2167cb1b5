//! mailjudge common - Shared types and utilities
//!
//! This crate provides the configuration, error taxonomy and the small
//! value types shared by the storage, core and CLI crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
