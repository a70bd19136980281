//! Unblocks a term buffer behind an abandoned or stalled claim.
//!
//! A publisher that reserves a range and then dies before committing leaves
//! a frame whose length is negative (header written) or zero (nothing
//! written), and every reader spins on it. The driver, after a timeout,
//! overwrites the gap with a padding frame so readers can move on.

use skein_primitives::AtomicBuffer;

use crate::descriptor::{
    self, compute_term_offset_from_position, index_by_position, LogMetaData, PARTITION_COUNT,
};
use crate::frame::{self, FRAME_ALIGNMENT, HDR_TYPE_PAD};
use crate::header::HeaderWriter;

/// Outcome of an unblock attempt on one term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockStatus {
    /// Nothing to do at the blocked offset.
    NoAction,
    /// A padding frame was published over the gap.
    Unblocked,
    /// The gap ran to the end of the term; the log needs rotating.
    UnblockedToEnd,
}

/// Try to unblock the term at `blocked_offset`.
///
/// A negative frame length there is an in-progress claim: complete it as
/// padding of the claimed length. A zero length means not even the header
/// landed: scan forward for a committed frame and pad the gap up to it, or
/// to the end of the term if appenders have moved on entirely.
pub fn unblock_term(
    meta: &LogMetaData,
    term: &AtomicBuffer,
    blocked_offset: i32,
    tail_offset: i32,
    term_id: i32,
) -> UnblockStatus {
    let mut status = UnblockStatus::NoAction;
    let frame_length = frame::frame_length_volatile(term, blocked_offset);

    if frame_length < 0 {
        reset_header(meta, term, blocked_offset, term_id, -frame_length);
        status = UnblockStatus::Unblocked;
    } else if frame_length == 0 {
        let mut current_offset = blocked_offset + FRAME_ALIGNMENT;

        while current_offset < tail_offset {
            if frame::frame_length_volatile(term, current_offset) != 0 {
                if scan_back_to_confirm_zeroed(term, current_offset, blocked_offset) {
                    reset_header(
                        meta,
                        term,
                        blocked_offset,
                        term_id,
                        current_offset - blocked_offset,
                    );
                    status = UnblockStatus::Unblocked;
                }
                break;
            }
            current_offset += FRAME_ALIGNMENT;
        }

        if current_offset == term.capacity() as i32
            && frame::frame_length_volatile(term, blocked_offset) == 0
        {
            reset_header(
                meta,
                term,
                blocked_offset,
                term_id,
                current_offset - blocked_offset,
            );
            status = UnblockStatus::UnblockedToEnd;
        }
    }

    status
}

/// Unblock a log at a blocked stream position.
///
/// Picks the partition, reads its raw tail, and runs the term unblocker;
/// rotates the log when the padding ran to the end of the term. Returns
/// true if a padding frame was published.
pub fn unblock_log(
    meta: &LogMetaData,
    term_buffers: &[AtomicBuffer; PARTITION_COUNT],
    blocked_position: i64,
) -> bool {
    let term_length = meta.term_length();
    let bits = descriptor::position_bits_to_shift(term_length);
    let index = index_by_position(blocked_position, bits);
    let term = &term_buffers[index];

    let raw_tail = meta.raw_tail(index).load(skein_primitives::sync::Ordering::Acquire);
    let term_id = descriptor::term_id(raw_tail);
    let tail_offset = descriptor::term_offset(raw_tail, term_length);
    let blocked_offset = compute_term_offset_from_position(blocked_position, term_length);

    match unblock_term(meta, term, blocked_offset, tail_offset, term_id) {
        UnblockStatus::UnblockedToEnd => {
            let term_count = descriptor::compute_term_count(term_id, meta.initial_term_id());
            descriptor::rotate_log(meta, term_count, term_id);
            true
        }
        UnblockStatus::Unblocked => true,
        UnblockStatus::NoAction => false,
    }
}

/// Publish a padding frame of `frame_length` bytes at `term_offset`.
fn reset_header(
    meta: &LogMetaData,
    term: &AtomicBuffer,
    term_offset: i32,
    term_id: i32,
    frame_length: i32,
) {
    let writer = HeaderWriter::new(meta.default_frame_header());
    writer.write(term, term_offset, frame_length, term_id);
    frame::set_frame_type(term, term_offset, HDR_TYPE_PAD);
    frame::frame_length_release(term, term_offset, frame_length);
}

/// Confirm every frame slot in `[limit, from)` still reads zero, walking
/// backwards. Guards against a slow appender committing underneath the
/// forward scan.
fn scan_back_to_confirm_zeroed(term: &AtomicBuffer, from: i32, limit: i32) -> bool {
    let mut offset = from - FRAME_ALIGNMENT;
    while offset >= limit {
        if frame::frame_length_volatile(term, offset) != 0 {
            return false;
        }
        offset -= FRAME_ALIGNMENT;
    }
    true
}
