//! Geospatial event catalog import pipeline.
//!
//! Source files arrive by upload, scheduled URL fetch, or webhook trigger,
//! then flow through a persisted stage machine: dataset detection, duplicate
//! analysis, schema inference and validation, batched event creation, and
//! geocoding. All coordination happens through the database, so any number
//! of workers can share the queue.

pub mod config;
pub mod dedupe;
pub mod error;
pub mod fetch;
pub mod geocode;
pub mod limits;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod schema;
pub mod schema_engine;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod transform;

pub use error::{ImportError, Result};
