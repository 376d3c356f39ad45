//! Background workers.
//!
//! Worker threads pull runnable jobs and step them through the state
//! machine. They run on plain OS threads: the real inference provider uses a
//! blocking HTTP client and the Postgres store blocks on its own runtime.

pub mod pool;

pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
