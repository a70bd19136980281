//! Driver-wide configuration and system counters.
//!
//! A [`DriverContext`] is built once at driver start and shared immutably
//! with every resource. All timeouts are nanoseconds.

use skein_primitives::{Counters, Position};

const MS: i64 = 1_000_000;
const SECOND: i64 = 1_000 * MS;

/// Tunables for driver-side publication resources.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// How long a publisher may sit at the consumer position with an
    /// uncommitted claim before the driver unblocks the log.
    pub unblock_timeout_ns: i64,
    /// How long an unreferenced publication with no subscribers stays
    /// active before draining begins.
    pub liveness_timeout_ns: i64,
    /// How long a drained publication lingers for late readers.
    pub linger_timeout_ns: i64,
    /// Grace period for an untethered subscriber outside the window.
    pub untethered_window_limit_timeout_ns: i64,
    /// How long an untethered subscriber lingers before resting.
    pub untethered_linger_timeout_ns: i64,
    /// How long a resting subscriber stays out before rejoining.
    pub untethered_resting_timeout_ns: i64,
    /// How long a revoked publication refuses new subscriptions.
    pub cool_down_timeout_ns: i64,
    /// Delay before a NAK is honoured; zero resends immediately.
    pub retransmit_delay_ns: i64,
    /// Suppression window after a resend.
    pub retransmit_linger_ns: i64,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            unblock_timeout_ns: 15 * SECOND,
            liveness_timeout_ns: 5 * SECOND,
            linger_timeout_ns: 5 * SECOND,
            untethered_window_limit_timeout_ns: 5 * SECOND,
            untethered_linger_timeout_ns: 5 * SECOND,
            untethered_resting_timeout_ns: 10 * SECOND,
            cool_down_timeout_ns: 5 * SECOND,
            retransmit_delay_ns: 0,
            retransmit_linger_ns: 60 * MS,
        }
    }
}

impl DriverContext {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.unblock_timeout_ns <= 0 {
            return Err("unblock_timeout_ns must be positive");
        }
        if self.liveness_timeout_ns <= 0 {
            return Err("liveness_timeout_ns must be positive");
        }
        if self.linger_timeout_ns <= 0 {
            return Err("linger_timeout_ns must be positive");
        }
        if self.untethered_window_limit_timeout_ns <= 0
            || self.untethered_linger_timeout_ns <= 0
            || self.untethered_resting_timeout_ns <= 0
        {
            return Err("untethered timeouts must be positive");
        }
        if self.cool_down_timeout_ns <= 0 {
            return Err("cool_down_timeout_ns must be positive");
        }
        if self.retransmit_delay_ns < 0 || self.retransmit_linger_ns <= 0 {
            return Err("retransmit timeouts out of range");
        }
        Ok(())
    }
}

/// Counters the core increments, allocated once at driver start.
#[derive(Clone, Copy)]
pub struct SystemCounters {
    /// Publications unblocked after a stalled claim.
    pub unblocked_publications: Position,
    /// Publications revoked by the conductor.
    pub publications_revoked: Position,
    /// Bytes of log currently mapped.
    pub mapped_bytes: Position,
    /// NAKs naming an invalid range.
    pub invalid_packets: Position,
    /// NAKs dropped because the retransmit pool was full.
    pub retransmit_overflow: Position,
}

impl SystemCounters {
    /// Allocate the full set from a counters region.
    pub fn allocate(counters: &mut Counters) -> Option<Self> {
        Some(Self {
            unblocked_publications: position(counters)?,
            publications_revoked: position(counters)?,
            mapped_bytes: position(counters)?,
            invalid_packets: position(counters)?,
            retransmit_overflow: position(counters)?,
        })
    }
}

fn position(counters: &mut Counters) -> Option<Position> {
    let id = counters.allocate()?;
    Some(counters.position(id))
}
