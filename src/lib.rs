//! ArborDB page-state core
//!
//! The concurrency heart of an in-memory, copy-friendly B+tree storage
//! engine: per-page 64-bit state words manipulated by CAS, intrusive
//! per-worker waiter lists with selective wakeup, optimistic readers
//! driven by a monotonic change count, and the two-phase page-split
//! completion protocol.
//!
//! ## Example
//!
//! ```rust,no_run
//! use arbordb::{Engine, Settings};
//!
//! let engine = Engine::new(Settings::default()).unwrap();
//! let mut worker = engine.register_worker().unwrap();
//!
//! worker.lock_page(0);
//! worker.page_block_reads(0);
//! // ... mutate the page payload ...
//! worker.unlock_page(0);
//! ```

pub mod btree;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod page;
pub mod pool;
pub mod worker;

pub use btree::page_state::{TupleLockOutcome, WaiterTuple};
pub use btree::{KeyKind, TreeDescr, TreeId, TreeKind, TupleOps, UndoKind};
pub use config::Settings;
pub use error::{Error, Result};
pub use logging::{init_from_env, init_logging, LogConfig};
pub use page::Blkno;
pub use worker::{Engine, Worker};
