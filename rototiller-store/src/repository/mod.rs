//! Repository Module
//!
//! Data access layer for the Postgres catalog. Each repository handles the
//! queries for one table.

pub mod job;
pub mod storage;
pub mod task;
