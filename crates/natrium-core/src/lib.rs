#![forbid(unsafe_code)]

//! Natrium: a transactional, glitch-free functional reactive engine.
//!
//! Programs are graphs of [`Stream`]s (discrete events) and [`Cell`]s
//! (values over time). External stimuli enter through [`StreamSink::send`];
//! each stimulus, or each group sent inside one [`Transaction::run`], is
//! propagated in rank order, committed atomically and delivered to
//! listeners exactly once.
//!
//! ```
//! use natrium_core::{StreamSink, Transaction};
//!
//! let a = StreamSink::new();
//! let b = StreamSink::new();
//! let total = a.stream().hold(0).lift2(&b.stream().hold(0), |x: &i32, y: &i32| x + y);
//!
//! Transaction::run(|| {
//!     a.send(5);
//!     b.send(42);
//! });
//! assert_eq!(total.sample(), 47);
//! ```
//!
//! The engine is single-threaded: the graph and the active transaction live
//! in thread-local storage, and handles are `!Send`.

pub mod cell;
pub mod config;
pub mod error;
mod graph;
pub mod listener;
pub mod loops;
pub mod stream;
pub mod timer;
pub mod transaction;

pub use cell::{Cell, CellFn};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use graph::live_nodes;
pub use listener::Listener;
pub use loops::{CellLoop, StreamLoop};
pub use stream::{Stream, StreamSink};
pub use timer::{Clock, ManualClock, MillisecondsClock, TimerSystem};
pub use transaction::Transaction;
