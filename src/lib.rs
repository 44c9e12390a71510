//! PostgreSQL DBA tools over the Model Context Protocol.
//!
//! The crate exposes nine `postgres_*` tools backed by a version-aware
//! analysis engine: a guarded SQL driver for restricted deployments, an
//! EXPLAIN engine with hypothetical-index support, a workload-driven index
//! advisor, and a set of database health calculators. All database access
//! goes through one pooled async driver; server capabilities are probed
//! once per pool and cached.

pub mod advisor;
pub mod config;
pub mod db;
pub mod error;
pub mod explain;
pub mod health;
pub mod models;
pub mod server;
pub mod top_queries;
pub mod version;
