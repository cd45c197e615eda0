//! Batch Scheduler.
//!
//! ```text
//!   filtered documents
//!          │  schedule(docs, batch_size)
//!          ▼
//!   ┌─────────────┐      acquire()      ┌───────────┐
//!   │   Batches   │ ──────────────────▶ │ ModelPool │
//!   └─────────────┘                     └─────┬─────┘
//!          │ one task per batch, holding a lease
//!          ▼
//!   ┌──────────┐ ┌──────────┐     ┌──────────┐
//!   │ device 0 │ │ device 1 │ ... │ device N │
//!   └──────────┘ └──────────┘     └──────────┘
//!          │
//!          ▼
//!   BatchOutcome (completed | failed | cancelled), ordered by batch id
//! ```

mod batch;
mod cancel;
mod dispatcher;

pub use batch::{schedule, Batch, Batches};
pub use cancel::CancelToken;
pub use dispatcher::{BatchOutcome, BatchScheduler, DispatchReport, DispatchStats};
