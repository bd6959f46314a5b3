//! Keymint Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the Keymint platform.

pub mod cache;
pub mod db;
pub mod types;

pub use cache::*;
pub use db::*;
pub use types::*;
