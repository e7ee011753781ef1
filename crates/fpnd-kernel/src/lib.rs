//! Control-plane kernel of the fpnd overlay node agent.
//!
//! The kernel reconciles the node's tunnel state against the overlay
//! daemon's view, ages cached status, drives the moon orbit lifecycle,
//! supervises the messaging daemons and dispatches interface jobs.

pub mod cache;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod exec;
pub mod kernel;
pub mod moon;
pub mod reconciler;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use kernel::FpndKernel;
