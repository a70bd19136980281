//! Data-frame layout and field accessors.
//!
//! Every record in a term buffer starts with a fixed 32-byte header and is
//! padded out to the frame alignment. All fields are little-endian. The
//! `length` field doubles as the commit protocol: readers treat zero as
//! "not yet published" and a negative value as "claimed, in progress"; the
//! final positive length is written last with release semantics.

use skein_primitives::AtomicBuffer;

/// Length of the fixed data-frame header in bytes.
pub const HEADER_LENGTH: i32 = 32;

/// Frames are padded to multiples of this many bytes.
pub const FRAME_ALIGNMENT: i32 = 32;

/// Frame format version written into every header.
pub const CURRENT_VERSION: u8 = 0;

// Header field byte offsets.
pub const FRAME_LENGTH_FIELD_OFFSET: i32 = 0;
pub const VERSION_FIELD_OFFSET: i32 = 4;
pub const FLAGS_FIELD_OFFSET: i32 = 5;
pub const TYPE_FIELD_OFFSET: i32 = 6;
pub const TERM_OFFSET_FIELD_OFFSET: i32 = 8;
pub const SESSION_ID_FIELD_OFFSET: i32 = 12;
pub const STREAM_ID_FIELD_OFFSET: i32 = 16;
pub const TERM_ID_FIELD_OFFSET: i32 = 20;
pub const RESERVED_VALUE_FIELD_OFFSET: i32 = 24;

/// Frame type of a padding record.
pub const HDR_TYPE_PAD: u16 = 0x00;
/// Frame type of a data record.
pub const HDR_TYPE_DATA: u16 = 0x01;

/// Set on the first fragment of a message.
pub const BEGIN_FRAG_FLAG: u8 = 0x80;
/// Set on the last fragment of a message.
pub const END_FRAG_FLAG: u8 = 0x40;
/// A single-fragment message carries both flags.
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub const fn align(value: i32, alignment: i32) -> i32 {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Read a frame length with acquire semantics.
#[inline]
pub fn frame_length_volatile(term: &AtomicBuffer, frame_offset: i32) -> i32 {
    term.get_i32_volatile(frame_offset + FRAME_LENGTH_FIELD_OFFSET)
}

/// Commit a frame by publishing its final length with release semantics.
#[inline]
pub fn frame_length_release(term: &AtomicBuffer, frame_offset: i32, length: i32) {
    term.put_i32_release(frame_offset + FRAME_LENGTH_FIELD_OFFSET, length);
}

/// Read the frame type field.
#[inline]
pub fn frame_type(term: &AtomicBuffer, frame_offset: i32) -> u16 {
    term.get_u16(frame_offset + TYPE_FIELD_OFFSET)
}

/// Stamp the frame type field.
#[inline]
pub fn set_frame_type(term: &AtomicBuffer, frame_offset: i32, frame_type: u16) {
    term.put_u16(frame_offset + TYPE_FIELD_OFFSET, frame_type);
}

/// Read the flags byte.
#[inline]
pub fn frame_flags(term: &AtomicBuffer, frame_offset: i32) -> u8 {
    term.get_u8(frame_offset + FLAGS_FIELD_OFFSET)
}

/// Stamp the flags byte.
#[inline]
pub fn set_frame_flags(term: &AtomicBuffer, frame_offset: i32, flags: u8) {
    term.put_u8(frame_offset + FLAGS_FIELD_OFFSET, flags);
}

/// Read the frame's own term offset field.
#[inline]
pub fn frame_term_offset(term: &AtomicBuffer, frame_offset: i32) -> i32 {
    term.get_i32(frame_offset + TERM_OFFSET_FIELD_OFFSET)
}

/// Read the frame's term id field.
#[inline]
pub fn frame_term_id(term: &AtomicBuffer, frame_offset: i32) -> i32 {
    term.get_i32(frame_offset + TERM_ID_FIELD_OFFSET)
}

/// Read the frame's session id field.
#[inline]
pub fn frame_session_id(term: &AtomicBuffer, frame_offset: i32) -> i32 {
    term.get_i32(frame_offset + SESSION_ID_FIELD_OFFSET)
}

/// Read the frame's reserved value.
#[inline]
pub fn frame_reserved_value(term: &AtomicBuffer, frame_offset: i32) -> i64 {
    term.get_i64(frame_offset + RESERVED_VALUE_FIELD_OFFSET)
}

/// Returns true if the frame at `frame_offset` is a padding record.
#[inline]
pub fn is_padding(term: &AtomicBuffer, frame_offset: i32) -> bool {
    frame_type(term, frame_offset) == HDR_TYPE_PAD
}
