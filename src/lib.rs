//! Biodiversity-unit allocation backend library.
//!
//! Exposes the pipeline modules for the server binary and integration
//! tests: reference snapshots, metric parsing, geography resolution, the
//! allocation engine, and the job queue.

pub mod allocation;
pub mod api;
pub mod geography;
pub mod jobs;
pub mod metric;
pub mod middleware;
pub mod models;
pub mod reference;
