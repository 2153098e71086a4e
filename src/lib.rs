//! # Stratum Tenancy Service Library
//!
//! This library provides the core functionality for the Stratum tenancy
//! service: per-request tenant context, the per-tenant connection pool
//! cache, session-scoped connection routing, and tenant provisioning.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod tenancy;
pub use migration;
