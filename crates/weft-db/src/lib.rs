//! Persistence layer for weft: connection pool, row models, and query
//! functions for the workflow store.
//!
//! Every table carries a `tenant_id` column and every query that serves a
//! tenant request filters on it. Queries that belong to the background
//! planes (worker claim, overdue scan, schedule dispatch) operate across
//! tenants by design and are marked as such in their doc comments.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
