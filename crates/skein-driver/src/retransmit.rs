//! Coalesced, bounded retransmission scheduling.
//!
//! Each inbound NAK either matches an action already in flight (and is
//! dropped), claims a free action from a fixed pool, or overflows. An
//! action with zero configured delay resends immediately and then lingers,
//! suppressing duplicate NAKs for the same range; with a delay it waits
//! for [`RetransmitHandler::process_timeouts`] to fire it. The handler is
//! single-threaded: it runs on the receiver thread and is never re-entered.

use skein_log::frame::HEADER_LENGTH;
use skein_primitives::Position;

use crate::flow_control::FlowControl;

/// Hard cap on concurrently scheduled retransmits.
pub const RETRANSMIT_MAX_RESEND: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionState {
    Inactive,
    Delayed,
    Lingering,
}

#[derive(Clone, Copy)]
struct RetransmitAction {
    expiry_ns: i64,
    term_id: i32,
    term_offset: i32,
    length: usize,
    state: ActionState,
}

const IDLE_ACTION: RetransmitAction = RetransmitAction {
    expiry_ns: 0,
    term_id: 0,
    term_offset: 0,
    length: 0,
    state: ActionState::Inactive,
};

/// Bounded retransmit state machine for one publication.
pub struct RetransmitHandler {
    actions: [RetransmitAction; RETRANSMIT_MAX_RESEND],
    capacity: usize,
    delay_timeout_ns: i64,
    linger_timeout_ns: i64,
    has_group_semantics: bool,
    invalid_packets: Position,
    retransmit_overflow: Position,
    active_retransmit_count: usize,
}

impl RetransmitHandler {
    /// Create a handler with up to `capacity` concurrent retransmits.
    ///
    /// `delay_timeout_ns == 0` resends on NAK arrival; otherwise resends
    /// are deferred by that delay. `has_group_semantics` records whether
    /// the channel is multicast-like; upstream NAK generation keys off it.
    pub fn new(
        invalid_packets: Position,
        delay_timeout_ns: i64,
        linger_timeout_ns: i64,
        has_group_semantics: bool,
        capacity: usize,
        retransmit_overflow: Position,
    ) -> Result<Self, &'static str> {
        if capacity == 0 || capacity > RETRANSMIT_MAX_RESEND {
            return Err("retransmit capacity must be 1..=16");
        }
        if delay_timeout_ns < 0 || linger_timeout_ns <= 0 {
            return Err("retransmit timeouts out of range");
        }

        Ok(Self {
            actions: [IDLE_ACTION; RETRANSMIT_MAX_RESEND],
            capacity,
            delay_timeout_ns,
            linger_timeout_ns,
            has_group_semantics,
            invalid_packets,
            retransmit_overflow,
            active_retransmit_count: 0,
        })
    }

    /// Number of actions currently delayed or lingering.
    #[inline]
    pub fn active_retransmit_count(&self) -> usize {
        self.active_retransmit_count
    }

    #[inline]
    pub fn has_group_semantics(&self) -> bool {
        self.has_group_semantics
    }

    /// Handle one inbound NAK.
    ///
    /// Returns the resend callback's result when a resend fired, zero
    /// otherwise (scheduled, coalesced, invalid, or overflowed).
    #[allow(clippy::too_many_arguments)]
    pub fn on_nak<F>(
        &mut self,
        term_id: i32,
        term_offset: i32,
        length: usize,
        term_length: usize,
        mtu_length: usize,
        flow_control: &dyn FlowControl,
        now_ns: i64,
        resend: &mut F,
    ) -> i32
    where
        F: FnMut(i32, i32, usize) -> i32,
    {
        if is_invalid(term_offset, length, term_length) {
            self.invalid_packets.increment();
            return 0;
        }

        if self.find_containing(term_id, term_offset, length).is_some() {
            // Duplicate of an in-flight action; coalesce silently.
            return 0;
        }

        let Some(index) = self.find_free() else {
            self.retransmit_overflow.increment();
            return 0;
        };

        let capped_length = flow_control.max_retransmission_length(
            term_offset as usize,
            length,
            term_length,
            mtu_length,
        );

        let delay_timeout_ns = self.delay_timeout_ns;
        let linger_timeout_ns = self.linger_timeout_ns;
        let action = &mut self.actions[index];
        action.term_id = term_id;
        action.term_offset = term_offset;
        action.length = capped_length;

        let mut result = 0;
        if delay_timeout_ns == 0 {
            result = resend(term_id, term_offset, capped_length);
            action.state = ActionState::Lingering;
            action.expiry_ns = now_ns + linger_timeout_ns;
        } else {
            action.state = ActionState::Delayed;
            action.expiry_ns = now_ns + delay_timeout_ns;
        }

        self.active_retransmit_count += 1;
        result
    }

    /// Fire due delays and expire finished lingers.
    ///
    /// Returns the number of state transitions, which callers use for
    /// duty-cycle back-off.
    pub fn process_timeouts<F>(&mut self, now_ns: i64, resend: &mut F) -> usize
    where
        F: FnMut(i32, i32, usize) -> i32,
    {
        let linger_timeout_ns = self.linger_timeout_ns;
        let mut transitions = 0;

        for action in self.actions[..self.capacity].iter_mut() {
            match action.state {
                ActionState::Delayed if now_ns >= action.expiry_ns => {
                    resend(action.term_id, action.term_offset, action.length);
                    action.state = ActionState::Lingering;
                    action.expiry_ns = now_ns + linger_timeout_ns;
                    transitions += 1;
                }
                ActionState::Lingering if now_ns >= action.expiry_ns => {
                    action.state = ActionState::Inactive;
                    self.active_retransmit_count -= 1;
                    transitions += 1;
                }
                _ => {}
            }
        }

        transitions
    }

    /// Drop every scheduled action.
    pub fn close(&mut self) {
        self.actions = [IDLE_ACTION; RETRANSMIT_MAX_RESEND];
        self.active_retransmit_count = 0;
    }

    fn find_containing(&self, term_id: i32, term_offset: i32, length: usize) -> Option<usize> {
        let nak_end = term_offset as i64 + length as i64;
        self.actions[..self.capacity].iter().position(|action| {
            action.state != ActionState::Inactive
                && action.term_id == term_id
                && term_offset >= action.term_offset
                && nak_end <= action.term_offset as i64 + action.length as i64
        })
    }

    fn find_free(&self) -> Option<usize> {
        self.actions[..self.capacity]
            .iter()
            .position(|action| action.state == ActionState::Inactive)
    }
}

fn is_invalid(term_offset: i32, length: usize, term_length: usize) -> bool {
    term_offset < 0
        || term_offset as usize > term_length - HEADER_LENGTH as usize
        || length > term_length
}
