//! Rototiller Core
//!
//! Core types shared by the Rototiller job pipeline.
//!
//! This crate contains:
//! - Domain types: Jobs, Storage, Tasks and Events with their status machines
//! - Volumes: enumerable collections of named files exchanged between blob
//!   storage and local staging
//!
//! Persistence lives in `rototiller-store`, transport in `rototiller-bus`,
//! execution in `rototiller-worker`.

pub mod domain;
pub mod volume;

pub use domain::ParseError;
