//! Job production and consumption.
//!
//! - **Queues**: named FIFO lists consumed in configured priority order
//! - **Job**: job records, creation with id allocation, rollback
//! - **HandlerRegistry**: maps handler names to the code that runs them
//!
//! # Architecture
//!
//! ```text
//!      ┌──────────────┐
//!      │   Producer   │  Job::create(handler, args, queue)
//!      │  (API/CLI)   │
//!      └──────┬───────┘
//!             │ push (tail)
//!   ┌─────────▼─────────┐
//!   │ queue:critical    │
//!   │ queue:default     │  priority order = config order
//!   └─────────┬─────────┘
//!             │ Job::next (blocking pop, first non-empty)
//!      ┌──────▼───────┐
//!      │   Strategy   │──► worker ──► handler.perform(args)
//!      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use workforge::scheduler::{EnqueueOptions, Job};
//! use serde_json::json;
//!
//! let ctx = workforge::Context::connect(config).await?;
//! Job::create(&ctx, "Mailer", vec![json!("user@example.com")], EnqueueOptions::queue("critical")).await?;
//! ```

pub mod handler;
pub mod job;
pub mod queue;

pub use handler::{arg, handler_fn, register_builtin, Handler, HandlerRegistry};
pub use job::{EnqueueOptions, Job, JobRecord};
pub use queue::{Polled, Queue, QueueError, Queues};
