//! The publication append engine.
//!
//! Thread-safe, lock-free appends into the active term of a shared log.
//! Serialization between concurrent publishers is the fetch-add on the
//! active partition's raw tail; the commit is the release store of the
//! frame's final length. Nothing here blocks, and nothing allocates on the
//! append path.
//!
//! Every operation returns either the stream position reached or one of
//! the negative sentinel values. The transient sentinels
//! ([`NOT_CONNECTED`], [`BACK_PRESSURED`], [`ADMIN_ACTION`]) invite a
//! retry; [`PUBLICATION_CLOSED`] and [`MAX_POSITION_EXCEEDED`] are final.

use skein_primitives::sync::Ordering;
use skein_primitives::{AtomicBuffer, PositionReader};

use crate::claim::BufferClaim;
use crate::descriptor::{
    self, compute_max_message_length, compute_max_possible_position, index_by_term_count,
    LogMetaData, PARTITION_COUNT,
};
use crate::frame::{self, align, FRAME_ALIGNMENT, HEADER_LENGTH, RESERVED_VALUE_FIELD_OFFSET};
use crate::header::HeaderWriter;
use crate::log_buffers::LogBuffers;

/// No subscriber has a position hooked up to this publication.
pub const NOT_CONNECTED: i64 = -1;
/// The publication limit has been reached; retry after consumers advance.
pub const BACK_PRESSURED: i64 = -2;
/// An administrative action (term rotation) ran instead; retry at once.
pub const ADMIN_ACTION: i64 = -3;
/// The publication has been closed.
pub const PUBLICATION_CLOSED: i64 = -4;
/// The stream has consumed its 32-bit term-id space.
pub const MAX_POSITION_EXCEEDED: i64 = -5;

/// Classification of an append-path return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The append committed at the contained stream position.
    Position(i64),
    NotConnected,
    BackPressured,
    AdminAction,
    Closed,
    MaxPositionExceeded,
}

impl PublishOutcome {
    /// Classify a raw return value from `offer`/`try_claim`.
    pub fn from_result(result: i64) -> Self {
        match result {
            NOT_CONNECTED => PublishOutcome::NotConnected,
            BACK_PRESSURED => PublishOutcome::BackPressured,
            ADMIN_ACTION => PublishOutcome::AdminAction,
            PUBLICATION_CLOSED => PublishOutcome::Closed,
            MAX_POSITION_EXCEEDED => PublishOutcome::MaxPositionExceeded,
            position => {
                debug_assert!(position >= 0, "unknown publish sentinel {position}");
                PublishOutcome::Position(position)
            }
        }
    }

    /// True for outcomes a caller should retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PublishOutcome::NotConnected
                | PublishOutcome::BackPressured
                | PublishOutcome::AdminAction
        )
    }
}

/// Channel status value when no status counter is allocated (IPC).
pub const CHANNEL_STATUS_ACTIVE: i64 = 1;

/// Supplies the reserved-value field of a frame, called after the payload
/// is in place and before the length is published.
///
/// The default supplier leaves the field zero.
pub fn default_reserved_value(_term: &AtomicBuffer, _term_offset: i32, _frame_length: i32) -> i64 {
    0
}

struct TermSample {
    index: usize,
    position: i64,
    limit: i64,
}

/// A publisher's handle over a shared log.
///
/// Cheap to share by reference across publisher threads; every public
/// operation is safe for concurrent use.
pub struct Publication {
    log: LogBuffers,
    term_buffers: [AtomicBuffer; PARTITION_COUNT],
    header_writer: HeaderWriter,
    publication_limit: PositionReader,
    channel_status: Option<PositionReader>,
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    term_length: i32,
    position_bits_to_shift: u32,
    max_possible_position: i64,
    max_payload_length: i32,
    max_message_length: i32,
    is_closed: core::sync::atomic::AtomicBool,
}

impl Publication {
    /// Wrap an open log. Session, stream and framing parameters come from
    /// the log's metadata page; the limit counter comes from the driver.
    pub fn new(
        log: LogBuffers,
        publication_limit: PositionReader,
        channel_status: Option<PositionReader>,
        registration_id: i64,
    ) -> Self {
        let meta = log.meta();
        let term_length = meta.term_length();
        let header_writer = HeaderWriter::new(meta.default_frame_header());

        Self {
            term_buffers: log.term_buffers(),
            header_writer,
            publication_limit,
            channel_status,
            registration_id,
            session_id: header_writer.session_id(),
            stream_id: header_writer.stream_id(),
            initial_term_id: meta.initial_term_id(),
            term_length,
            position_bits_to_shift: descriptor::position_bits_to_shift(term_length),
            max_possible_position: compute_max_possible_position(term_length),
            max_payload_length: meta.mtu_length() - HEADER_LENGTH,
            max_message_length: compute_max_message_length(term_length),
            is_closed: core::sync::atomic::AtomicBool::new(false),
            log,
        }
    }

    // ── append paths ───────────────────────────────────────────────────────

    /// Non-blocking publish of a message.
    pub fn offer(&self, msg: &[u8]) -> i64 {
        self.offer_with_reserved(msg, default_reserved_value)
    }

    /// Non-blocking publish of a message with a reserved-value supplier.
    pub fn offer_with_reserved<F>(&self, msg: &[u8], mut reserved_value_supplier: F) -> i64
    where
        F: FnMut(&AtomicBuffer, i32, i32) -> i64,
    {
        let length = message_length(msg.len());
        let sample = match self.sample_active_term() {
            Ok(sample) => sample,
            Err(status) => return status,
        };

        if sample.position < sample.limit {
            if length <= self.max_payload_length {
                self.append_unfragmented(sample.index, msg, &mut reserved_value_supplier)
            } else {
                self.check_max_message_length(length);
                self.append_fragmented(sample.index, msg, length, &mut reserved_value_supplier)
            }
        } else {
            self.back_pressure_status(sample.position, length)
        }
    }

    /// Non-blocking publish of a message gathered from multiple segments.
    ///
    /// Segment boundaries have no effect on framing; only the MTU decides
    /// where fragments split.
    pub fn offer_gather<F>(&self, segments: &[&[u8]], mut reserved_value_supplier: F) -> i64
    where
        F: FnMut(&AtomicBuffer, i32, i32) -> i64,
    {
        let mut length: i32 = 0;
        for segment in segments {
            length = length
                .checked_add(message_length(segment.len()))
                .expect("total gather length exceeds i32 range");
        }

        let sample = match self.sample_active_term() {
            Ok(sample) => sample,
            Err(status) => return status,
        };

        if sample.position < sample.limit {
            if length <= self.max_payload_length {
                self.append_unfragmented_gather(
                    sample.index,
                    segments,
                    length,
                    &mut reserved_value_supplier,
                )
            } else {
                self.check_max_message_length(length);
                self.append_fragmented_gather(
                    sample.index,
                    segments,
                    length,
                    &mut reserved_value_supplier,
                )
            }
        } else {
            self.back_pressure_status(sample.position, length)
        }
    }

    /// Reserve a range in the log for zero-copy writing.
    ///
    /// On success the claim wraps the reserved payload range; the caller
    /// must commit (or abort) it to let readers past. Restricted to
    /// payloads that fit a single frame.
    ///
    /// # Panics
    ///
    /// If `length` exceeds the maximum payload length.
    pub fn try_claim(&self, length: i32, claim: &mut BufferClaim) -> i64 {
        self.check_payload_length(length);
        let sample = match self.sample_active_term() {
            Ok(sample) => sample,
            Err(status) => return status,
        };

        if sample.position >= sample.limit {
            return self.back_pressure_status(sample.position, length);
        }

        let term = &self.term_buffers[sample.index];
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        let raw_tail = self.get_and_add_raw_tail(sample.index, aligned_length);
        let term_offset = descriptor::term_offset(raw_tail, self.term_length);
        let term_id = descriptor::term_id(raw_tail);

        let resulting_offset = term_offset + aligned_length;
        let position = self.compute_position(term_id, resulting_offset);
        if resulting_offset > self.term_length {
            self.handle_end_of_log(term, term_offset, term_id, position)
        } else {
            self.header_writer
                .write(term, term_offset, frame_length, term_id);
            claim.wrap(term, term_offset, frame_length);
            position
        }
    }

    // ── observers ──────────────────────────────────────────────────────────

    /// Current producer position of the stream.
    pub fn position(&self) -> i64 {
        if self.is_closed() {
            return PUBLICATION_CLOSED;
        }

        let raw_tail = self.log.meta().raw_tail_volatile();
        let term_offset = descriptor::term_offset(raw_tail, self.term_length);
        self.compute_position(descriptor::term_id(raw_tail), term_offset)
    }

    /// Position beyond which appends are back-pressured.
    pub fn publication_limit(&self) -> i64 {
        if self.is_closed() {
            return PUBLICATION_CLOSED;
        }
        self.publication_limit.get_volatile()
    }

    /// Counter id of the publication-limit position.
    pub fn publication_limit_id(&self) -> i32 {
        self.publication_limit.id()
    }

    /// Room left before back pressure applies.
    pub fn available_window(&self) -> i64 {
        if self.is_closed() {
            return PUBLICATION_CLOSED;
        }
        self.publication_limit.get_volatile() - self.position()
    }

    /// Has a subscriber been connected recently?
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.log.meta().is_connected()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(core::sync::atomic::Ordering::Acquire)
    }

    /// Close the publication. Idempotent; subsequent operations return
    /// [`PUBLICATION_CLOSED`].
    pub fn close(&self) {
        self.is_closed
            .store(true, core::sync::atomic::Ordering::Release);
    }

    /// Status of the channel this publication writes to.
    pub fn channel_status(&self) -> i64 {
        if self.is_closed() {
            return NOT_CONNECTED;
        }
        match &self.channel_status {
            Some(reader) => reader.get_volatile(),
            None => CHANNEL_STATUS_ACTIVE,
        }
    }

    #[inline]
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    #[inline]
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    #[inline]
    pub fn term_length(&self) -> i32 {
        self.term_length
    }

    #[inline]
    pub fn max_message_length(&self) -> i32 {
        self.max_message_length
    }

    #[inline]
    pub fn max_payload_length(&self) -> i32 {
        self.max_payload_length
    }

    #[inline]
    pub fn max_possible_position(&self) -> i64 {
        self.max_possible_position
    }

    #[inline]
    pub fn position_bits_to_shift(&self) -> u32 {
        self.position_bits_to_shift
    }

    /// The underlying log.
    pub fn log_buffers(&self) -> &LogBuffers {
        &self.log
    }

    // ── internals ──────────────────────────────────────────────────────────

    #[inline]
    fn meta(&self) -> &LogMetaData {
        self.log.meta()
    }

    #[inline]
    fn compute_position(&self, term_id: i32, term_offset: i32) -> i64 {
        descriptor::compute_position(
            term_id,
            term_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }

    #[inline]
    fn get_and_add_raw_tail(&self, index: usize, aligned_length: i32) -> i64 {
        self.meta()
            .raw_tail(index)
            .fetch_add(aligned_length as i64, Ordering::AcqRel)
    }

    /// Sample the limit and the active term. Fails with `ADMIN_ACTION`
    /// while a rotation is in flight (term count and raw tail disagree).
    fn sample_active_term(&self) -> Result<TermSample, i64> {
        if self.is_closed() {
            return Err(PUBLICATION_CLOSED);
        }

        let limit = self.publication_limit.get_volatile();
        let term_count = self.meta().active_term_count_volatile();
        let index = index_by_term_count(term_count);
        let raw_tail = self.meta().raw_tail(index).load(Ordering::Acquire);
        let term_offset = descriptor::term_offset(raw_tail, self.term_length);
        let term_id = descriptor::term_id(raw_tail);

        if term_count != descriptor::compute_term_count(term_id, self.initial_term_id) {
            return Err(ADMIN_ACTION);
        }

        Ok(TermSample {
            index,
            position: self.compute_position(term_id, term_offset),
            limit,
        })
    }

    fn append_unfragmented<F>(&self, index: usize, msg: &[u8], reserved_value_supplier: &mut F) -> i64
    where
        F: FnMut(&AtomicBuffer, i32, i32) -> i64,
    {
        let term = &self.term_buffers[index];
        let frame_length = msg.len() as i32 + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        let raw_tail = self.get_and_add_raw_tail(index, aligned_length);
        let term_offset = descriptor::term_offset(raw_tail, self.term_length);
        let term_id = descriptor::term_id(raw_tail);

        let resulting_offset = term_offset + aligned_length;
        let position = self.compute_position(term_id, resulting_offset);
        if resulting_offset > self.term_length {
            return self.handle_end_of_log(term, term_offset, term_id, position);
        }

        self.header_writer
            .write(term, term_offset, frame_length, term_id);
        term.put_bytes(term_offset + HEADER_LENGTH, msg);

        let reserved_value = reserved_value_supplier(term, term_offset, frame_length);
        term.put_i64(term_offset + RESERVED_VALUE_FIELD_OFFSET, reserved_value);

        frame::frame_length_release(term, term_offset, frame_length);
        position
    }

    fn append_fragmented<F>(
        &self,
        index: usize,
        msg: &[u8],
        length: i32,
        reserved_value_supplier: &mut F,
    ) -> i64
    where
        F: FnMut(&AtomicBuffer, i32, i32) -> i64,
    {
        let term = &self.term_buffers[index];
        let framed_length =
            descriptor::compute_fragmented_frame_length(length, self.max_payload_length);
        let raw_tail = self.get_and_add_raw_tail(index, framed_length);
        let term_offset = descriptor::term_offset(raw_tail, self.term_length);
        let term_id = descriptor::term_id(raw_tail);

        let resulting_offset = term_offset + framed_length;
        let position = self.compute_position(term_id, resulting_offset);
        if resulting_offset > self.term_length {
            return self.handle_end_of_log(term, term_offset, term_id, position);
        }

        let mut flags = frame::BEGIN_FRAG_FLAG;
        let mut remaining = length;
        let mut frame_offset = term_offset;

        loop {
            let bytes_to_write = remaining.min(self.max_payload_length);
            let frame_length = bytes_to_write + HEADER_LENGTH;
            let aligned_length = align(frame_length, FRAME_ALIGNMENT);

            self.header_writer
                .write(term, frame_offset, frame_length, term_id);
            term.put_bytes(
                frame_offset + HEADER_LENGTH,
                &msg[(length - remaining) as usize..][..bytes_to_write as usize],
            );

            if remaining <= self.max_payload_length {
                flags |= frame::END_FRAG_FLAG;
            }
            frame::set_frame_flags(term, frame_offset, flags);

            let reserved_value = reserved_value_supplier(term, frame_offset, frame_length);
            term.put_i64(frame_offset + RESERVED_VALUE_FIELD_OFFSET, reserved_value);

            frame::frame_length_release(term, frame_offset, frame_length);

            flags = 0;
            frame_offset += aligned_length;
            remaining -= bytes_to_write;
            if remaining <= 0 {
                break;
            }
        }

        position
    }

    fn append_unfragmented_gather<F>(
        &self,
        index: usize,
        segments: &[&[u8]],
        length: i32,
        reserved_value_supplier: &mut F,
    ) -> i64
    where
        F: FnMut(&AtomicBuffer, i32, i32) -> i64,
    {
        let term = &self.term_buffers[index];
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        let raw_tail = self.get_and_add_raw_tail(index, aligned_length);
        let term_offset = descriptor::term_offset(raw_tail, self.term_length);
        let term_id = descriptor::term_id(raw_tail);

        let resulting_offset = term_offset + aligned_length;
        let position = self.compute_position(term_id, resulting_offset);
        if resulting_offset > self.term_length {
            return self.handle_end_of_log(term, term_offset, term_id, position);
        }

        self.header_writer
            .write(term, term_offset, frame_length, term_id);

        let mut offset = term_offset + HEADER_LENGTH;
        for segment in segments {
            term.put_bytes(offset, segment);
            offset += segment.len() as i32;
        }

        let reserved_value = reserved_value_supplier(term, term_offset, frame_length);
        term.put_i64(term_offset + RESERVED_VALUE_FIELD_OFFSET, reserved_value);

        frame::frame_length_release(term, term_offset, frame_length);
        position
    }

    fn append_fragmented_gather<F>(
        &self,
        index: usize,
        segments: &[&[u8]],
        length: i32,
        reserved_value_supplier: &mut F,
    ) -> i64
    where
        F: FnMut(&AtomicBuffer, i32, i32) -> i64,
    {
        let term = &self.term_buffers[index];
        let framed_length =
            descriptor::compute_fragmented_frame_length(length, self.max_payload_length);
        let raw_tail = self.get_and_add_raw_tail(index, framed_length);
        let term_offset = descriptor::term_offset(raw_tail, self.term_length);
        let term_id = descriptor::term_id(raw_tail);

        let resulting_offset = term_offset + framed_length;
        let position = self.compute_position(term_id, resulting_offset);
        if resulting_offset > self.term_length {
            return self.handle_end_of_log(term, term_offset, term_id, position);
        }

        let mut flags = frame::BEGIN_FRAG_FLAG;
        let mut remaining = length;
        let mut frame_offset = term_offset;
        let mut segment_index = 0usize;
        let mut segment_offset = 0usize;

        loop {
            let bytes_to_write = remaining.min(self.max_payload_length);
            let frame_length = bytes_to_write + HEADER_LENGTH;
            let aligned_length = align(frame_length, FRAME_ALIGNMENT);

            self.header_writer
                .write(term, frame_offset, frame_length, term_id);

            let mut bytes_written = 0;
            let mut payload_offset = frame_offset + HEADER_LENGTH;
            while bytes_written < bytes_to_write {
                let segment = segments[segment_index];
                let segment_remaining = segment.len() - segment_offset;
                let num_bytes =
                    ((bytes_to_write - bytes_written) as usize).min(segment_remaining);

                term.put_bytes(payload_offset, &segment[segment_offset..][..num_bytes]);

                bytes_written += num_bytes as i32;
                payload_offset += num_bytes as i32;
                segment_offset += num_bytes;

                if segment_offset == segment.len() {
                    segment_index += 1;
                    segment_offset = 0;
                }
            }

            if remaining <= self.max_payload_length {
                flags |= frame::END_FRAG_FLAG;
            }
            frame::set_frame_flags(term, frame_offset, flags);

            let reserved_value = reserved_value_supplier(term, frame_offset, frame_length);
            term.put_i64(frame_offset + RESERVED_VALUE_FIELD_OFFSET, reserved_value);

            frame::frame_length_release(term, frame_offset, frame_length);

            flags = 0;
            frame_offset += aligned_length;
            remaining -= bytes_to_write;
            if remaining <= 0 {
                break;
            }
        }

        position
    }

    /// A reservation straddled the end of the term: pad out the remainder,
    /// refuse if the stream is out of term-id space, otherwise rotate.
    fn handle_end_of_log(
        &self,
        term: &AtomicBuffer,
        term_offset: i32,
        term_id: i32,
        position: i64,
    ) -> i64 {
        if term_offset < self.term_length {
            let padding_length = self.term_length - term_offset;
            self.header_writer
                .write(term, term_offset, padding_length, term_id);
            frame::set_frame_type(term, term_offset, frame::HDR_TYPE_PAD);
            frame::frame_length_release(term, term_offset, padding_length);
        }

        if position >= self.max_possible_position {
            return MAX_POSITION_EXCEEDED;
        }

        let term_count = descriptor::compute_term_count(term_id, self.initial_term_id);
        descriptor::rotate_log(self.meta(), term_count, term_id);

        ADMIN_ACTION
    }

    /// Position is at or past the limit: classify why.
    fn back_pressure_status(&self, current_position: i64, message_length: i32) -> i64 {
        let aligned = align(message_length + HEADER_LENGTH, FRAME_ALIGNMENT) as i64;
        if current_position + aligned >= self.max_possible_position {
            return MAX_POSITION_EXCEEDED;
        }

        if self.meta().is_connected() {
            BACK_PRESSURED
        } else {
            NOT_CONNECTED
        }
    }

    #[inline]
    fn check_max_message_length(&self, length: i32) {
        assert!(
            length <= self.max_message_length,
            "message exceeds max message length: {length} > {}",
            self.max_message_length
        );
    }

    #[inline]
    fn check_payload_length(&self, length: i32) {
        assert!(length >= 0, "payload length must be non-negative: {length}");
        assert!(
            length <= self.max_payload_length,
            "claim exceeds max payload length: {length} > {}",
            self.max_payload_length
        );
    }
}

#[inline]
fn message_length(len: usize) -> i32 {
    i32::try_from(len).expect("message length exceeds i32 range")
}
