//! `ingest-core`: identifiers and validation errors shared by the ingestion pipeline.
//!
//! This crate has no runtime or storage concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, LeaseToken, RunnerId, TaskId};
