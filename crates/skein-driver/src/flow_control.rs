//! Flow-control capping of retransmission lengths.
//!
//! A resend is never allowed to run past the end of its term, nor to
//! exceed a multiple of the estimated receiver window. The strategy is a
//! trait so media-specific controllers can plug in their own estimate.

/// Default multiple of the receiver window a resend may cover.
pub const RETRANSMIT_RECEIVER_WINDOW_MULTIPLE: usize = 4;

/// Upper bound used by strategies that allow the largest resends.
pub const MAX_RETRANSMIT_RECEIVER_WINDOW_MULTIPLE: usize = 16;

/// Cap on the estimated receiver window.
pub const INITIAL_RECEIVER_WINDOW_LENGTH: usize = 128 * 1024;

/// Estimated receiver window for a term length: half a term, capped.
#[inline]
pub fn receiver_window_length(term_length: usize) -> usize {
    (term_length / 2).min(INITIAL_RECEIVER_WINDOW_LENGTH)
}

/// Cap a resend to the term remainder and the window multiple.
pub fn calculate_retransmission_length(
    resend_length: usize,
    term_length: usize,
    term_offset: usize,
    receiver_window_multiple: usize,
) -> usize {
    let window_limited_length = receiver_window_length(term_length) * receiver_window_multiple;
    let length_to_end_of_term = term_length - term_offset;

    resend_length
        .min(window_limited_length)
        .min(length_to_end_of_term)
}

/// Strategy hook consulted once per scheduled retransmit.
pub trait FlowControl {
    /// The most bytes a resend starting at `term_offset` may carry.
    fn max_retransmission_length(
        &self,
        term_offset: usize,
        resend_length: usize,
        term_length: usize,
        mtu_length: usize,
    ) -> usize;
}

/// Default strategy: window-multiple capping, MTU ignored.
pub struct RetransmitWindowFlowControl {
    pub receiver_window_multiple: usize,
}

impl Default for RetransmitWindowFlowControl {
    fn default() -> Self {
        Self {
            receiver_window_multiple: MAX_RETRANSMIT_RECEIVER_WINDOW_MULTIPLE,
        }
    }
}

impl FlowControl for RetransmitWindowFlowControl {
    fn max_retransmission_length(
        &self,
        term_offset: usize,
        resend_length: usize,
        term_length: usize,
        _mtu_length: usize,
    ) -> usize {
        calculate_retransmission_length(
            resend_length,
            term_length,
            term_offset,
            self.receiver_window_multiple,
        )
    }
}
