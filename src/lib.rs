// src/lib.rs

//! Harvester Library
//!
//! Incremental ingestion of community posts from several upstream sources
//! into a versioned collection store.

pub mod error;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
