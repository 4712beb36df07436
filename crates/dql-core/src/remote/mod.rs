//! Remote dataset service: wire protocol, chunked row fetching, and pulls.

pub mod fetcher;
pub mod protocol;
pub mod pull;
