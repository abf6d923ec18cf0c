// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the Elasticsearch Operator
//!
//! This module contains unit tests for:
//! - Resource generators (StatefulSet, Service, PDB, Secret, Job)
//! - The admission guard and the webhook handlers
//! - Status management
//! - State machine transitions
//! - Backup scheduling
//! - Apply planning in the materializer

#[path = "../common/mod.rs"]
mod common;

mod materializer;
mod resources;
mod scheduler;
