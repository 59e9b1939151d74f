//! # CGX Common Library
//!
//! Shared code for the CGX services:
//! - Error and Result types
//! - Bootstrap configuration and root folder resolution
//! - Event types (CgxEvent enum) and the EventBus

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
