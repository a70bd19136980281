//! Writes data-frame headers into a term buffer.
//!
//! The writer is primed once from the log's default header template, which
//! already carries the version, unfragmented flags, DATA type, session id
//! and stream id. Per frame it stamps the length (negative, marking the
//! frame in progress), term offset and term id; the appender publishes the
//! final positive length separately once payload and reserved value are in
//! place.

use skein_primitives::AtomicBuffer;

use crate::frame::{
    FRAME_LENGTH_FIELD_OFFSET, STREAM_ID_FIELD_OFFSET, TERM_OFFSET_FIELD_OFFSET,
    TYPE_FIELD_OFFSET, VERSION_FIELD_OFFSET,
};

/// Stamps per-frame header fields from a pre-parsed template.
#[derive(Clone, Copy)]
pub struct HeaderWriter {
    /// Version, flags and type bytes of the template, as the high half of
    /// the header's first 64-bit word.
    version_flags_type: i32,
    session_id: i32,
    stream_id: i32,
}

impl HeaderWriter {
    /// Build a writer from a 32-byte default header template.
    pub fn new(default_header: &[u8; 32]) -> Self {
        let version_flags_type = i32::from_le_bytes(
            default_header[VERSION_FIELD_OFFSET as usize..=TYPE_FIELD_OFFSET as usize + 1]
                .try_into()
                .expect("template version/flags/type bytes"),
        );
        let session_id = i32::from_le_bytes(
            default_header[12..16].try_into().expect("template session id"),
        );
        let stream_id = i32::from_le_bytes(
            default_header[16..20].try_into().expect("template stream id"),
        );

        Self {
            version_flags_type,
            session_id,
            stream_id,
        }
    }

    /// Write a header for a frame of `frame_length` bytes at `term_offset`.
    ///
    /// The first word goes in with release so a concurrent unblocker sees
    /// either nothing or a negative in-progress length, never a torn word.
    pub fn write(
        &self,
        term: &AtomicBuffer,
        term_offset: i32,
        frame_length: i32,
        term_id: i32,
    ) {
        let length_and_vft =
            ((self.version_flags_type as i64) << 32) | ((-frame_length) as u32 as i64);
        term.put_i64_release(term_offset + FRAME_LENGTH_FIELD_OFFSET, length_and_vft);

        let offset_and_session =
            ((self.session_id as i64) << 32) | (term_offset as u32 as i64);
        term.put_i64(term_offset + TERM_OFFSET_FIELD_OFFSET, offset_and_session);

        let stream_and_term = ((term_id as i64) << 32) | (self.stream_id as u32 as i64);
        term.put_i64(term_offset + STREAM_ID_FIELD_OFFSET, stream_and_term);
    }

    #[inline]
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }
}
