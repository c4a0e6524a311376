//! Storage core of a block-level, deduplicating backup tool.
//!
//! Volumes are split into fixed-size blocks. Every block's data lives in a
//! content blob kept by a [`blobstore::BlobStore`], written and read through
//! the concurrent [`backend::DataBackend`] pipeline, and referenced from the
//! [`catalog::Catalog`].

pub mod backend;
pub mod blobstore;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod hints;
pub mod mapper;
pub mod reader;
pub mod throttle;

pub use backend::{DataBackend, ReadCompletion};
pub use blobstore::{BlobStore, BlobUid};
pub use config::BackendConfig;
pub use error::{Error, Result};
