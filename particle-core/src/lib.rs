//! Core types for particle
//!
//! This crate holds the chat session model, configuration loading and
//! logging setup shared by the other particle crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod utils;

pub use error::{Error, Result};
