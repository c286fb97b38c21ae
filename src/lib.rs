//! Video ingestion pipeline
//!
//! Clients upload video archives straight to object storage through
//! pre-signed grants. Object-created notifications become messages on a
//! durable queue with a dead-letter queue; stateless workers lease them,
//! claim the job with a conditional write, run the analysis and commit the
//! result. Job status lives in a state store keyed by job id.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
