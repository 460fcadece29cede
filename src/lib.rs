//! Crash-durable paged FIFO queue backed by memory-mapped page files.
//!
//! Producers append opaque byte items; consumers pull batches asynchronously
//! and acknowledge them explicitly. Storage is split into fixed-size pages
//! of three kinds (metadata, index records, item payloads), each kind served
//! through a ref-counted TTL cache of mapped page handles.

pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod page;
pub mod queue;
pub mod records;
pub mod state;

pub use config::QueueConfiguration;
pub use error::{Error, Result};
pub use queue::{DequeueResult, PersistentQueue, QueueStatistics};
pub use state::{QueueState, QueueStateMonitor};
