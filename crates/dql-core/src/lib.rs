//! DQL core library: a local dataset catalog.
//!
//! Storages are crawled into partial indexes, files are collected into
//! mutable shadow datasets, and shadows are promoted into immutable
//! registered dataset versions with recorded lineage. Versions can be
//! merged, pulled from a remote dataset service, or produced by running
//! query scripts in a child interpreter.
//!
//! Everything goes through a [`Catalog`] handle built from a
//! [`CatalogConfig`].

pub mod catalog;
pub mod config;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod query;
pub mod remote;
pub mod store;

#[cfg(test)]
mod test_support;

pub use catalog::Catalog;
pub use config::CatalogConfig;
pub use errors::{CatalogError, CatalogResult};
