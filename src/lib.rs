//! Counter orchestration over the `perf_event_open` syscall family.
//!
//! The crate turns a high-level request ("measure these events on these
//! threads and CPUs, with these modifiers") into a population of kernel event
//! file descriptors organized into atomically scheduled groups, drives their
//! lifecycle from a single-threaded event loop, and aggregates the readings
//! into per-event summaries with derived rate comments.
//!
//! ## Example
//!
//! Count instructions and cycles for half a second, then summarize:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use perfstat::selection::EventSelectionSet;
//!
//! let mut set = EventSelectionSet::new(true).unwrap();
//! set.add_event_type("cpu-cycles", true).unwrap();
//! set.add_event_type("instructions", true).unwrap();
//! set.add_monitored_processes([std::process::id() as i32]);
//! set.open_event_files().unwrap();
//!
//! std::thread::sleep(Duration::from_millis(500));
//!
//! for info in set.read_counters().unwrap() {
//!     let total: u64 = info.counters.iter().map(|c| c.counter.value).sum();
//!     println!("{}: {total}", info.event_name);
//! }
//! ```
//!
//! # Permission
//!
//! Access to performance monitoring needs `CAP_PERFMON` or `CAP_SYS_ADMIN`,
//! or a permissive `/proc/sys/kernel/perf_event_paranoid` setting (-1 allows
//! almost everything; 2 restricts to user-space profiling of own processes).

pub mod attr;
pub mod cli;
pub mod env;
mod error;
pub mod evloop;
pub mod event;
pub mod fd;
pub mod feature;
mod ffi;
pub mod selection;
pub mod stat;
pub mod summary;
pub mod workload;

pub use error::{Error, Result};
