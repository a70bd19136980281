//! The skein shared log: a memory-mapped, term-partitioned log that one or
//! more publishers append into and consumers read without copying.
//!
//! A log is three equal power-of-two term partitions followed by a
//! metadata page. Publishers reserve space with a single fetch-add on the
//! active partition's raw tail, write a framed record into the reserved
//! range, and commit by release-storing the frame length. When a
//! reservation runs off the end of a term the appender pads the remainder
//! and rotates the log to the next partition.
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬──────────┐
//! │  term 0    │  term 1    │  term 2    │ metadata │
//! └────────────┴────────────┴────────────┴──────────┘
//! ```
//!
//! The modules map onto the moving parts:
//!
//! - [`descriptor`]: metadata page layout, raw-tail packing, position
//!   arithmetic and log rotation
//! - [`frame`]: data-frame header layout and accessors
//! - [`header`]: per-frame header stamping
//! - [`claim`]: zero-copy buffer claims
//! - [`unblock`]: padding over abandoned claims
//! - [`log_buffers`]: creating, mapping and attaching logs
//! - [`publication`]: the lock-free append engine

pub mod claim;
pub mod descriptor;
pub mod frame;
pub mod header;
pub mod log_buffers;
pub mod publication;
pub mod unblock;

pub use claim::BufferClaim;
pub use descriptor::{LogMetaData, LogMetaDataInit, PARTITION_COUNT};
pub use header::HeaderWriter;
pub use log_buffers::{AttachError, LogBuffers, LogConfig};
pub use publication::{
    default_reserved_value, Publication, PublishOutcome, ADMIN_ACTION, BACK_PRESSURED,
    MAX_POSITION_EXCEEDED, NOT_CONNECTED, PUBLICATION_CLOSED,
};
pub use unblock::{unblock_log, unblock_term, UnblockStatus};
