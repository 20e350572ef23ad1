//! Testing utilities and mock implementations
//!
//! Mocks for the analysis service and the queue, so the pipeline can be
//! exercised without an HTTP backend or a real broker.

pub mod mocks;

pub use mocks::*;
