//! Memory primitives for the skein shared-memory log transport.
//!
//! Everything in here operates on raw shared memory: an offset-addressed
//! [`AtomicBuffer`] over a mapped (or heap) region, position counters in a
//! shared counters region, and the file-backed [`MmapRegion`] that carries
//! a log across processes.

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod buffer;
pub mod counters;
pub mod sync;

#[cfg(any(test, feature = "alloc"))]
pub use buffer::HeapBuffer;
pub use buffer::{AtomicBuffer, CACHE_LINE_LENGTH};
#[cfg(any(test, feature = "alloc"))]
pub use counters::Counters;
pub use counters::{Position, PositionReader, COUNTER_LENGTH};

// OS-level mapping primitives (requires std).
#[cfg(all(feature = "std", unix))]
pub mod mmap;

#[cfg(all(feature = "std", unix))]
pub use mmap::MmapRegion;
