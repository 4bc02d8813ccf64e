//! Per-pipeline worker pools.
//!
//! A pool runs `concurrency` consumer tasks. Each one loops
//! reserve, run handler, resolve, until the pool drains.

mod consumer;
pub mod handler;
pub mod pool;

pub use handler::{JobHandler, Outcome};
pub use pool::{DrainReport, PoolState, WorkerPool};
