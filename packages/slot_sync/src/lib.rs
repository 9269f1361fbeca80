//! Lock-free building blocks for thread-safe collections.
//!
//! This crate provides four primitives:
//!
//! * [`Bucket`] - a fixed-capacity array of atomic slots, each empty or holding one value, with
//!   compare-and-swap style insert, exchange, conditional remove and conditional update.
//! * [`Pool`] - a bounded cache of reusable objects built on a bucket-backed
//!   [`FixedSizeQueue`], with an optional recycler and protection against reentrant donation.
//! * [`Promise`] - a reusable single-assignment completion signal, split into a consumer view
//!   and a producer-side [`Promised`] handle.
//! * [`CollectionMonitor`] - a broadcaster that tells weakly held subscribers "a collection cycle
//!   happened", with a process-wide instance reached through [`subscribe()`] and friends.
//!
//! None of the operations take locks on the hot path. Contention is resolved by retrying with
//! backoff and never surfaces as an error; a conditional operation whose condition does not hold
//! reports that through its return value.
//!
//! # Quick start
//!
//! ```rust
//! use slot_sync::{Bucket, Pool, Promise};
//!
//! let bucket = Bucket::<String>::new(4);
//! assert!(bucket.insert(0, "first".to_string()));
//! assert!(!bucket.insert(0, "second".to_string()));
//! assert_eq!(*bucket.try_get(0).unwrap(), "first");
//!
//! let pool = Pool::new(2);
//! pool.donate(String::from("reuse me"));
//! assert_eq!(pool.try_get().as_deref(), Some("reuse me"));
//!
//! let (promise, promised) = Promise::<String>::pending();
//! promised.on_error("failed".to_string());
//! assert_eq!(promise.error().as_deref(), Some("failed"));
//! ```
//!
//! # Logging
//!
//! The crate reports unusual but handled situations (panicking monitor subscribers, abandoned
//! promise handles, discarded pool entries) through [`tracing`](https://docs.rs/tracing). It never
//! installs a subscriber of its own.

mod bucket;
mod collection_monitor;
mod error;
mod fixed_size_queue;
mod pool;
mod promise;
mod reentry;

pub use bucket::*;
pub use collection_monitor::*;
pub use error::Error;
pub(crate) use error::Result;
pub use fixed_size_queue::*;
pub use pool::*;
pub use promise::*;
