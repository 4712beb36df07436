//! Query scripts: compilation, result records, and execution.

pub mod compile;
pub mod runner;
pub mod sentinel;
