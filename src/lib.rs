//! Purchase Gateway Library
//!
//! Orchestrates card purchases across fraud screening, stored payment
//! templates, bin routing and a cascade of billers. Every dependency call is
//! guarded by a circuit breaker and every purchase is an event-sourced
//! [`models::PurchaseProcess`].
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod circuit_breaker;
pub mod commands;
pub mod config;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod models;
pub mod services;

pub use errors::{ErrorResponse, ServiceError};
pub use services::purchase::{PurchaseOutcome, PurchaseResult, PurchaseService};
