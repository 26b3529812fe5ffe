// src/lib.rs
//! Poll voting engine: vote toggling and replacement, tallies, and
//! crash-safe scheduled poll closure.

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod models;
pub mod notify;
pub mod poll;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod store;
#[cfg(test)]
mod testing;
pub mod vote;

pub use error::{PollError, StoreError};
pub use poll::PollLifecycle;
pub use scheduler::{ClosureScheduler, ClosureWorker};
pub use vote::VoteEngine;
