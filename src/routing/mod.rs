//! Routing infrastructure
//!
//! Routers pull task references off the shared queue and hand them to the
//! agent harness under a bounded concurrency budget. Any number of router
//! instances may consume the same queue.

pub mod router;

pub use router::{Router, RouterSettings};
