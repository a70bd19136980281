//! Log-buffer descriptor: the metadata page and position arithmetic.
//!
//! A log is three term partitions of identical power-of-two length followed
//! by one metadata page. The metadata page holds the three raw-tail cells
//! (one per partition, each on its own cache line), the active term count,
//! stream end-of-stream state, and the immutable log parameters written at
//! creation.
//!
//! A raw tail packs `(term_id << 32) | tail_offset` so that one 64-bit
//! fetch-add reserves a byte range in a term while carrying the term id
//! along with it. All position arithmetic derives from term id, term offset
//! and the initial term id.

use core::mem::{offset_of, size_of};

use skein_primitives::sync::{AtomicI32, AtomicI64, Ordering};

use crate::frame::{self, HEADER_LENGTH};

/// Number of term partitions in a log.
pub const PARTITION_COUNT: usize = 3;

/// Minimum term length in bytes.
pub const TERM_MIN_LENGTH: i32 = 64 * 1024;

/// Maximum term length in bytes.
pub const TERM_MAX_LENGTH: i32 = 1024 * 1024 * 1024;

/// Minimum page size in bytes.
pub const PAGE_MIN_SIZE: i32 = 4 * 1024;

/// Maximum page size in bytes.
pub const PAGE_MAX_SIZE: i32 = 1024 * 1024 * 1024;

/// Minimum MTU in bytes.
pub const MTU_MIN_LENGTH: i32 = HEADER_LENGTH + frame::FRAME_ALIGNMENT;

/// Maximum MTU in bytes.
pub const MTU_MAX_LENGTH: i32 = 65504;

/// Total size of the metadata page at the end of the log file.
pub const LOG_META_DATA_LENGTH: usize = 4096;

/// Upper bound on any message, independent of term length.
pub const MAX_MESSAGE_LENGTH: i32 = 16 * 1024 * 1024;

/// One raw-tail cell, padded to a full cache line so concurrent fetch-adds
/// on different partitions never contend.
#[repr(C)]
pub struct RawTailCell {
    raw_tail: AtomicI64,
    _pad: [u8; 56],
}

impl RawTailCell {
    #[inline]
    pub fn cell(&self) -> &AtomicI64 {
        &self.raw_tail
    }
}

/// The metadata page of a log.
///
/// Mutable cells are atomics; the parameter fields after them are written
/// once at creation and read-only thereafter.
#[repr(C, align(64))]
pub struct LogMetaData {
    term_tail_counters: [RawTailCell; PARTITION_COUNT],

    active_term_count: AtomicI32,
    _pad0: [u8; 4],
    end_of_stream_position: AtomicI64,
    is_connected: AtomicI32,
    active_transport_count: AtomicI32,
    _pad1: [u8; 40],

    correlation_id: i64,
    initial_term_id: i32,
    default_frame_header_length: i32,
    mtu_length: i32,
    pub(crate) term_length: i32,
    page_size: i32,
    _pad2: [u8; 36],

    default_frame_header: [u8; HEADER_LENGTH as usize],
}

#[cfg(not(loom))]
const _: () = {
    assert!(size_of::<LogMetaData>() == 384);
    assert!(offset_of!(LogMetaData, active_term_count) == 192);
    assert!(offset_of!(LogMetaData, end_of_stream_position) == 200);
    assert!(offset_of!(LogMetaData, is_connected) == 208);
    assert!(offset_of!(LogMetaData, correlation_id) == 256);
    assert!(offset_of!(LogMetaData, default_frame_header) == 320);
    assert!(size_of::<LogMetaData>() <= LOG_META_DATA_LENGTH);
};

/// Parameters stamped into a metadata page at creation.
pub struct LogMetaDataInit {
    pub correlation_id: i64,
    pub initial_term_id: i32,
    pub mtu_length: i32,
    pub term_length: i32,
    pub page_size: i32,
    pub session_id: i32,
    pub stream_id: i32,
}

impl LogMetaData {
    /// Write initial values for a fresh log.
    ///
    /// Partition 0 starts at `(initial_term_id, 0)`. The other partitions
    /// are seeded three terms back so the rotation CAS recognises them as
    /// stale when their turn comes around.
    pub fn init(&mut self, params: LogMetaDataInit) {
        for (index, counter) in self.term_tail_counters.iter_mut().enumerate() {
            let term_id = if index == 0 {
                params.initial_term_id
            } else {
                params
                    .initial_term_id
                    .wrapping_add(index as i32)
                    .wrapping_sub(PARTITION_COUNT as i32)
            };
            counter.raw_tail = AtomicI64::new(pack_tail(term_id, 0));
            counter._pad = [0; 56];
        }

        self.active_term_count = AtomicI32::new(0);
        self._pad0 = [0; 4];
        self.end_of_stream_position = AtomicI64::new(i64::MAX);
        self.is_connected = AtomicI32::new(0);
        self.active_transport_count = AtomicI32::new(0);
        self._pad1 = [0; 40];

        self.correlation_id = params.correlation_id;
        self.initial_term_id = params.initial_term_id;
        self.default_frame_header_length = HEADER_LENGTH;
        self.mtu_length = params.mtu_length;
        self.term_length = params.term_length;
        self.page_size = params.page_size;
        self._pad2 = [0; 36];

        self.default_frame_header = default_frame_header(params.session_id, params.stream_id);
    }

    /// Raw-tail cell of the given partition.
    #[inline]
    pub fn raw_tail(&self, index: usize) -> &AtomicI64 {
        self.term_tail_counters[index].cell()
    }

    /// Raw tail of the currently active partition, read with acquire.
    #[inline]
    pub fn raw_tail_volatile(&self) -> i64 {
        let index = index_by_term_count(self.active_term_count_volatile());
        self.raw_tail(index).load(Ordering::Acquire)
    }

    #[inline]
    pub fn active_term_count_volatile(&self) -> i32 {
        self.active_term_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn cas_active_term_count(&self, expected: i32, update: i32) -> bool {
        self.active_term_count
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire) == 1
    }

    #[inline]
    pub fn set_is_connected(&self, is_connected: bool) {
        self.is_connected
            .store(if is_connected { 1 } else { 0 }, Ordering::Release);
    }

    #[inline]
    pub fn end_of_stream_position(&self) -> i64 {
        self.end_of_stream_position.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_end_of_stream_position(&self, position: i64) {
        self.end_of_stream_position
            .store(position, Ordering::Release);
    }

    #[inline]
    pub fn active_transport_count(&self) -> i32 {
        self.active_transport_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_active_transport_count(&self, count: i32) {
        self.active_transport_count.store(count, Ordering::Release);
    }

    #[inline]
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    #[inline]
    pub fn mtu_length(&self) -> i32 {
        self.mtu_length
    }

    #[inline]
    pub fn term_length(&self) -> i32 {
        self.term_length
    }

    #[inline]
    pub fn page_size(&self) -> i32 {
        self.page_size
    }

    #[inline]
    pub fn default_frame_header_length(&self) -> i32 {
        self.default_frame_header_length
    }

    /// The pre-populated data-frame header template.
    #[inline]
    pub fn default_frame_header(&self) -> &[u8; HEADER_LENGTH as usize] {
        &self.default_frame_header
    }

    /// Sanity-check a page attached from an existing file.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !is_power_of_two_i32(self.term_length)
            || self.term_length < TERM_MIN_LENGTH
            || self.term_length > TERM_MAX_LENGTH
        {
            return Err("term length out of range");
        }
        if !is_power_of_two_i32(self.page_size)
            || self.page_size < PAGE_MIN_SIZE
            || self.page_size > PAGE_MAX_SIZE
        {
            return Err("page size out of range");
        }
        if self.default_frame_header_length != HEADER_LENGTH {
            return Err("unexpected default frame header length");
        }
        if self.mtu_length < MTU_MIN_LENGTH || self.mtu_length > MTU_MAX_LENGTH {
            return Err("mtu length out of range");
        }
        Ok(())
    }
}

/// Build a default header template: version, unfragmented flags, DATA type,
/// session and stream ids; per-frame fields left zero.
pub fn default_frame_header(session_id: i32, stream_id: i32) -> [u8; HEADER_LENGTH as usize] {
    let mut header = [0u8; HEADER_LENGTH as usize];
    header[frame::VERSION_FIELD_OFFSET as usize] = frame::CURRENT_VERSION;
    header[frame::FLAGS_FIELD_OFFSET as usize] = frame::UNFRAGMENTED;
    header[frame::TYPE_FIELD_OFFSET as usize..][..2]
        .copy_from_slice(&frame::HDR_TYPE_DATA.to_le_bytes());
    header[frame::SESSION_ID_FIELD_OFFSET as usize..][..4]
        .copy_from_slice(&session_id.to_le_bytes());
    header[frame::STREAM_ID_FIELD_OFFSET as usize..][..4]
        .copy_from_slice(&stream_id.to_le_bytes());
    header
}

#[inline]
const fn is_power_of_two_i32(value: i32) -> bool {
    value > 0 && (value & (value - 1)) == 0
}

// ── raw-tail packing ───────────────────────────────────────────────────────

/// Pack a term id and tail offset into a raw-tail value.
#[inline]
pub const fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

/// Term id carried in a raw tail.
#[inline]
pub const fn term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Tail offset carried in a raw tail, capped at the term length.
///
/// The low half keeps growing past the term length as losing reservations
/// overshoot, so observers clamp it.
#[inline]
pub fn term_offset(raw_tail: i64, term_length: i32) -> i32 {
    let tail = raw_tail & 0xFFFF_FFFF;
    tail.min(term_length as i64) as i32
}

// ── position arithmetic ────────────────────────────────────────────────────

/// Number of terms the stream has progressed from its initial term.
#[inline]
pub const fn compute_term_count(term_id: i32, initial_term_id: i32) -> i32 {
    term_id.wrapping_sub(initial_term_id)
}

/// Partition index for a term count.
#[inline]
pub const fn index_by_term_count(term_count: i32) -> usize {
    term_count.rem_euclid(PARTITION_COUNT as i32) as usize
}

/// Partition index for a stream position.
#[inline]
pub const fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    ((position >> position_bits_to_shift) as i32).rem_euclid(PARTITION_COUNT as i32) as usize
}

/// Stream position of `(term_id, term_offset)`.
#[inline]
pub const fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = compute_term_count(term_id, initial_term_id) as i64;
    (term_count << position_bits_to_shift) + term_offset as i64
}

/// Stream position at which the given term begins.
#[inline]
pub const fn compute_term_begin_position(
    term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    compute_position(term_id, 0, position_bits_to_shift, initial_term_id)
}

/// Term offset within a term for a stream position.
#[inline]
pub const fn compute_term_offset_from_position(position: i64, term_length: i32) -> i32 {
    (position & (term_length as i64 - 1)) as i32
}

/// Number of bits to shift a position right to get a term count.
#[inline]
pub const fn position_bits_to_shift(term_length: i32) -> u32 {
    term_length.trailing_zeros()
}

/// The stream is bounded by the 32-bit term-id space.
#[inline]
pub const fn compute_max_possible_position(term_length: i32) -> i64 {
    (term_length as i64) << 31
}

/// Largest message the log accepts: an eighth of a term, capped globally.
#[inline]
pub const fn compute_max_message_length(term_length: i32) -> i32 {
    let bound = term_length / 8;
    if bound < MAX_MESSAGE_LENGTH {
        bound
    } else {
        MAX_MESSAGE_LENGTH
    }
}

/// Producer flow-control window: half a term.
#[inline]
pub const fn term_window_length(term_length: i32) -> i32 {
    term_length / 2
}

/// Total framed length of a message once fragmented at `max_payload_length`
/// bytes per fragment. Every fragment but the last is a full MTU.
#[inline]
pub fn compute_fragmented_frame_length(length: i32, max_payload_length: i32) -> i32 {
    let num_max_payloads = length / max_payload_length;
    let remaining_payload = length % max_payload_length;
    let last_frame_length = if remaining_payload > 0 {
        frame::align(remaining_payload + HEADER_LENGTH, frame::FRAME_ALIGNMENT)
    } else {
        0
    };

    num_max_payloads * (max_payload_length + HEADER_LENGTH) + last_frame_length
}

/// Size of the whole log file: three partitions plus the metadata page.
#[inline]
pub const fn compute_log_length(term_length: i32) -> usize {
    PARTITION_COUNT * term_length as usize + LOG_META_DATA_LENGTH
}

// ── rotation ───────────────────────────────────────────────────────────────

/// Rotate the log to the next term.
///
/// The partition that will host the next term still carries the raw tail
/// of the term it held three terms ago. CAS it to `(next_term_id, 0)` if
/// so, then advance the active term count. Either CAS may lose to another
/// appender performing the same rotation, which is fine: the rotation
/// happens exactly once either way.
pub fn rotate_log(meta: &LogMetaData, current_term_count: i32, current_term_id: i32) -> bool {
    let next_term_id = current_term_id.wrapping_add(1);
    let next_term_count = current_term_count + 1;
    let next_index = index_by_term_count(next_term_count);
    let expected_term_id = next_term_id.wrapping_sub(PARTITION_COUNT as i32);

    loop {
        let raw_tail = meta.raw_tail(next_index).load(Ordering::Acquire);
        if expected_term_id != term_id(raw_tail) {
            break;
        }
        if meta
            .raw_tail(next_index)
            .compare_exchange(
                raw_tail,
                pack_tail(next_term_id, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            break;
        }
    }

    meta.cas_active_term_count(current_term_count, next_term_count)
}
