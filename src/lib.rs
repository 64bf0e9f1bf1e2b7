//! Dataslot: content-addressed dataset storage, a three-slot query
//! workspace, chunked browsing, and bounded SQL/pipeline execution.

#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod error;
pub mod query;
pub mod registry;
pub mod server;
pub mod storage;

pub use crate::config::ServiceConfig;
pub use crate::error::{DataslotError, Result};
