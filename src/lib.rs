//! Petfolio API Library
//!
//! Tiered admission control and rate limiting for the Petfolio pet-care API:
//! a burst guard, tier/category quota enforcement, and geography-adjusted
//! limits composed into a single admission pipeline, backed by a shared
//! TTL-capable counter store.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod admission;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;

use std::sync::Arc;

use admission::{AdmissionPipeline, CounterStore};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: config::AppConfig,
    pub store: Arc<dyn CounterStore>,
    pub pipeline: Arc<AdmissionPipeline>,
}
