//! # Paceline
//!
//! Pacing and credit rate-limiting primitives for keyed admission control.
//!
//! ## Features
//! - **Pacing limiters** - leaky-bucket pacers that space admissions at a
//!   minimum interval, with bounded burst slack, in two lock-free variants
//! - **Token bucket** - tick-quantized credit limiter with non-blocking,
//!   blocking, and bounded-wait acquisition
//! - **Keyed registries** - lazily build exactly one limiter per key under
//!   concurrency
//! - **Virtual time** - every limiter is generic over a [`Clock`], and the
//!   bundled [`MockClock`] drives deterministic multi-threaded tests
//!
//! Admission adapters (HTTP middleware and the like) are intentionally out
//! of scope: they extract a key, ask a registry for the limiter bound to
//! it, and call [`Pacer::take`] or [`TokenBucket::take_available`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    clippy::all
)]

pub mod clock;
pub mod node;
pub mod pacer;
pub mod registry;
pub mod token_bucket;

pub use clock::{Clock, MockClock, SystemClock};
pub use node::{MemoryNodeRegistry, NodeInfo, NodeRegistry};
pub use pacer::{AtomicPacer, Pacer, PacerConfig, SwapPacer, Unlimited};
pub use registry::{PacerMap, TokenBucketMap};
pub use token_bucket::TokenBucket;
