//! # Transcript Harness Core
//!
//! Shared, I/O-free logic for Transcript Harness: conversation models,
//! token estimation, the priority-based semantic sampler, the narrative
//! builder, and the persistence [`store::Store`] abstraction.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies.

pub mod models;
pub mod narrative;
pub mod sampler;
pub mod store;
pub mod tokens;
