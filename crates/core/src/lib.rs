//! `eva-core`: scheduler foundation building blocks.
//!
//! This crate contains the identifiers, error taxonomy and flat configuration
//! model shared by every other crate (no I/O, no threads).

pub mod config;
pub mod error;
pub mod id;

pub use config::{ConfigSection, FlatConfig};
pub use error::{EvaError, EvaResult};
pub use id::{AdapterId, EventId, JobId};
