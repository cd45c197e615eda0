//! Model Pool Manager.
//!
//! One [`ModelHandle`] per configured GPU device, leased to workers one batch
//! at a time. The number of ready handles bounds batch concurrency.

mod handle;
mod manager;

pub use handle::{GeneratedPair, LoadState, ModelHandle, ModelLoader, QaGenerator};
pub use manager::{HandleLease, LoadReport, ModelPool, PoolError};
