//! Core types for the fpnd overlay node agent.
//!
//! This crate defines the shared data structures used by the kernel and the
//! CLI: node state and its diffs, overlay status records, settings and the
//! shared error type. It contains no business logic.

pub mod config;
pub mod error;
pub mod state;
pub mod status;
