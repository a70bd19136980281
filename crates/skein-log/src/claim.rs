//! Zero-copy claims over a reserved term-buffer range.

use skein_primitives::AtomicBuffer;

use crate::frame::{
    self, FLAGS_FIELD_OFFSET, HDR_TYPE_PAD, HEADER_LENGTH, RESERVED_VALUE_FIELD_OFFSET,
};

/// A claimed range in a term buffer, produced by `try_claim`.
///
/// The header has already been written with an in-progress (negative)
/// length. The caller fills the payload window and then either commits,
/// publishing the frame, or aborts, turning the range into padding that
/// readers skip. Both consume the claim; further calls are no-ops, so a
/// claim value can be reused across try_claim calls without allocation.
pub struct BufferClaim {
    /// Window over the whole claimed frame, header included.
    frame: AtomicBuffer,
}

impl Default for BufferClaim {
    fn default() -> Self {
        Self {
            frame: AtomicBuffer::empty(),
        }
    }
}

impl BufferClaim {
    /// Point this claim at a freshly reserved frame.
    pub(crate) fn wrap(&mut self, term: &AtomicBuffer, term_offset: i32, frame_length: i32) {
        self.frame = term.slice(term_offset as usize, frame_length as usize);
    }

    /// The payload window of the claim.
    #[inline]
    pub fn buffer(&self) -> AtomicBuffer {
        self.frame
            .slice(HEADER_LENGTH as usize, self.length() as usize)
    }

    /// Payload bytes of the claim as a mutable slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let payload = self.buffer();
        unsafe { core::slice::from_raw_parts_mut(payload.as_ptr(), payload.capacity()) }
    }

    /// Offset of the payload within the claimed frame.
    #[inline]
    pub fn offset(&self) -> i32 {
        HEADER_LENGTH
    }

    /// Payload length in bytes.
    #[inline]
    pub fn length(&self) -> i32 {
        self.frame.capacity() as i32 - HEADER_LENGTH
    }

    /// Length of the whole frame, header included.
    #[inline]
    pub fn frame_length(&self) -> i32 {
        self.frame.capacity() as i32
    }

    /// Flags byte of the claimed frame's header.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.frame.get_u8(FLAGS_FIELD_OFFSET)
    }

    /// Reserved value currently in the claimed frame's header.
    #[inline]
    pub fn reserved_value(&self) -> i64 {
        self.frame.get_i64(RESERVED_VALUE_FIELD_OFFSET)
    }

    /// Set the reserved value of the claimed frame's header.
    #[inline]
    pub fn set_reserved_value(&mut self, value: i64) {
        self.frame.put_i64(RESERVED_VALUE_FIELD_OFFSET, value);
    }

    /// Returns true if this claim has been committed, aborted, or never
    /// wrapped a frame.
    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.frame.is_empty()
    }

    /// Publish the frame by writing its final length with release.
    pub fn commit(&mut self) {
        if !self.is_consumed() {
            let frame_length = self.frame.capacity() as i32;
            frame::frame_length_release(&self.frame, 0, frame_length);
            self.frame = AtomicBuffer::empty();
        }
    }

    /// Turn the claimed range into a padding frame and publish it, so
    /// readers skip over an abandoned claim.
    pub fn abort(&mut self) {
        if !self.is_consumed() {
            let frame_length = self.frame.capacity() as i32;
            frame::set_frame_type(&self.frame, 0, HDR_TYPE_PAD);
            frame::frame_length_release(&self.frame, 0, frame_length);
            self.frame = AtomicBuffer::empty();
        }
    }
}
