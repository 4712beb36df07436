//! Storage indexing: clients that crawl storages, listings over a crawled
//! index, and the enlist workflow that keeps indexes fresh.

pub mod client;
pub mod enlist;
pub mod listing;
