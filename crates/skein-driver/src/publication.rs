//! Driver-side per-publication resource.
//!
//! Owns the mapped raw log and the publication-limit / producer-position
//! counters, tracks the subscriber set, and walks the publication through
//! its life: Active while referenced or fed, Draining once abandoned,
//! Linger for late readers, Done when reclaimable. Every mutation here
//! happens on the conductor thread; publishers and subscribers only ever
//! see the atomic cells this resource publishes to.

use std::io;
use std::path::Path;

use skein_log::descriptor::{
    self, compute_term_offset_from_position, index_by_position, term_window_length,
};
use skein_log::log_buffers::{LogBuffers, LogConfig};
use skein_log::unblock::unblock_log;
use skein_log::PARTITION_COUNT;
use skein_primitives::{AtomicBuffer, Counters, Position};

use crate::context::{DriverContext, SystemCounters};
use crate::tether::{TetherState, TetherablePosition};

/// Lifecycle of a driver-side publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationState {
    Active,
    Draining,
    Linger,
    Done,
}

/// Conductor-facing hooks invoked on notable transitions.
///
/// The unit impl ignores everything, for callers that do not care.
pub trait DriverHooks {
    /// An untethered subscriber changed tether state.
    fn on_untethered_state_change(
        &mut self,
        _counter_id: i32,
        _now_ns: i64,
        _new_state: TetherState,
        _stream_id: i32,
        _session_id: i32,
    ) {
    }

    /// The publication was revoked at the given position.
    fn on_publication_revoke(&mut self, _revoked_position: i64, _session_id: i32, _stream_id: i32) {
    }
}

impl DriverHooks for () {}

/// Errors from creating a publication resource.
#[derive(Debug)]
pub enum CreateError {
    Io(io::Error),
    Config(&'static str),
    CountersExhausted,
}

impl From<io::Error> for CreateError {
    fn from(e: io::Error) -> Self {
        CreateError::Io(e)
    }
}

impl std::fmt::Display for CreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateError::Io(e) => write!(f, "I/O error: {e}"),
            CreateError::Config(msg) => write!(f, "bad publication config: {msg}"),
            CreateError::CountersExhausted => write!(f, "counters region exhausted"),
        }
    }
}

impl std::error::Error for CreateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CreateError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Driver-side state for one IPC publication.
pub struct IpcPublication {
    log: LogBuffers,
    term_buffers: [AtomicBuffer; PARTITION_COUNT],
    pub_lmt: Position,
    pub_pos: Position,
    subscribers: Vec<TetherablePosition>,
    counters: SystemCounters,

    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    channel: String,
    initial_term_id: i32,
    position_bits_to_shift: u32,
    term_length: i32,
    term_window_length: i64,
    trip_gain: i64,

    unblock_timeout_ns: i64,
    liveness_timeout_ns: i64,
    linger_timeout_ns: i64,
    untethered_window_limit_timeout_ns: i64,
    untethered_linger_timeout_ns: i64,
    untethered_resting_timeout_ns: i64,
    cool_down_timeout_ns: i64,

    state: PublicationState,
    refcnt: i32,
    has_reached_end_of_life: bool,
    trip_limit: i64,
    clean_position: i64,
    consumer_position: i64,
    last_consumer_position: i64,
    time_of_last_consumer_position_change_ns: i64,
    time_of_last_state_change_ns: i64,
    time_of_last_activity_ns: i64,
    in_cool_down: bool,
    cool_down_expire_time_ns: i64,
}

impl IpcPublication {
    /// Create the raw log at `path`, allocate positions, and start Active
    /// with one reference held by the creator.
    ///
    /// Any failure releases whatever was acquired before it.
    pub fn create(
        path: &Path,
        config: &LogConfig,
        channel: &str,
        registration_id: i64,
        ctx: &DriverContext,
        counters: &mut Counters,
        system: SystemCounters,
        now_ns: i64,
    ) -> Result<Self, CreateError> {
        config.validate().map_err(CreateError::Config)?;
        ctx.validate().map_err(CreateError::Config)?;

        let Some(pub_pos_id) = counters.allocate() else {
            return Err(CreateError::CountersExhausted);
        };
        let Some(pub_lmt_id) = counters.allocate() else {
            counters.free(pub_pos_id);
            return Err(CreateError::CountersExhausted);
        };

        let log = match LogBuffers::create(path, config) {
            Ok(log) => log,
            Err(e) => {
                counters.free(pub_lmt_id);
                counters.free(pub_pos_id);
                return Err(CreateError::Io(e));
            }
        };

        system.mapped_bytes.get_and_add(log.log_length() as i64);

        let window = term_window_length(config.term_length) as i64;
        let publication = Self {
            term_buffers: log.term_buffers(),
            pub_lmt: counters.position(pub_lmt_id),
            pub_pos: counters.position(pub_pos_id),
            subscribers: Vec::new(),
            counters: system,
            registration_id,
            session_id: config.session_id,
            stream_id: config.stream_id,
            channel: channel.to_owned(),
            initial_term_id: config.initial_term_id,
            position_bits_to_shift: descriptor::position_bits_to_shift(config.term_length),
            term_length: config.term_length,
            term_window_length: window,
            trip_gain: window / 8,
            unblock_timeout_ns: ctx.unblock_timeout_ns,
            liveness_timeout_ns: ctx.liveness_timeout_ns,
            linger_timeout_ns: ctx.linger_timeout_ns,
            untethered_window_limit_timeout_ns: ctx.untethered_window_limit_timeout_ns,
            untethered_linger_timeout_ns: ctx.untethered_linger_timeout_ns,
            untethered_resting_timeout_ns: ctx.untethered_resting_timeout_ns,
            cool_down_timeout_ns: ctx.cool_down_timeout_ns,
            state: PublicationState::Active,
            refcnt: 1,
            has_reached_end_of_life: false,
            trip_limit: 0,
            clean_position: 0,
            consumer_position: 0,
            last_consumer_position: 0,
            time_of_last_consumer_position_change_ns: now_ns,
            time_of_last_state_change_ns: now_ns,
            time_of_last_activity_ns: now_ns,
            in_cool_down: false,
            cool_down_expire_time_ns: 0,
            log,
        };

        publication.pub_pos.set_release(0);
        publication.pub_lmt.set_release(0);
        info!(
            "ipc publication created: channel={} session={} stream={} registration={}",
            channel, config.session_id, config.stream_id, registration_id
        );
        Ok(publication)
    }

    // ── accessors ──────────────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> PublicationState {
        self.state
    }

    #[inline]
    pub fn registration_id(&self) -> i64 {
        self.registration_id
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
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[inline]
    pub fn has_reached_end_of_life(&self) -> bool {
        self.has_reached_end_of_life
    }

    #[inline]
    pub fn consumer_position(&self) -> i64 {
        self.consumer_position
    }

    #[inline]
    pub fn clean_position(&self) -> i64 {
        self.clean_position
    }

    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// The log this publication owns.
    #[inline]
    pub fn log_buffers(&self) -> &LogBuffers {
        &self.log
    }

    /// Counter id of the publication-limit position.
    #[inline]
    pub fn publication_limit_id(&self) -> i32 {
        self.pub_lmt.id()
    }

    /// Counter id of the producer position.
    #[inline]
    pub fn producer_position_id(&self) -> i32 {
        self.pub_pos.id()
    }

    /// Current producer position derived from the active raw tail.
    pub fn producer_position(&self) -> i64 {
        let raw_tail = self.log.meta().raw_tail_volatile();
        descriptor::compute_position(
            descriptor::term_id(raw_tail),
            descriptor::term_offset(raw_tail, self.term_length),
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }

    /// Position a new subscriber joins the stream at.
    pub fn join_position(&self) -> i64 {
        let mut position = self.consumer_position;
        for subscriber in &self.subscribers {
            if subscriber.is_consuming() {
                position = position.min(subscriber.position.get_volatile());
            }
        }
        position
    }

    /// Have all consuming subscribers caught up with the producer?
    pub fn is_drained(&self) -> bool {
        let producer_position = self.producer_position();
        self.subscribers
            .iter()
            .filter(|s| s.is_consuming())
            .all(|s| s.position.get_volatile() >= producer_position)
    }

    /// A publisher is possibly blocked if the appenders are mid-rotation
    /// or ahead of the consumers.
    pub fn is_possibly_blocked(&self, producer_position: i64, consumer_position: i64) -> bool {
        let producer_term_count = self.log.meta().active_term_count_volatile();
        let expected_term_count = (consumer_position >> self.position_bits_to_shift) as i32;

        if producer_term_count != expected_term_count {
            return true;
        }

        producer_position > consumer_position
    }

    /// Accepting subscriptions while Active, or while Draining with data
    /// still to deliver, and never in cool-down.
    pub fn is_accepting_subscriptions(&self) -> bool {
        !self.in_cool_down
            && (self.state == PublicationState::Active
                || (self.state == PublicationState::Draining && !self.is_drained()))
    }

    // ── reference counting ─────────────────────────────────────────────────

    pub fn incref(&mut self) {
        self.refcnt += 1;
    }

    /// Drop one reference. The last reference starts draining.
    pub fn decref(&mut self, now_ns: i64) {
        self.refcnt -= 1;
        if self.refcnt == 0 && self.state == PublicationState::Active {
            self.transition_to(PublicationState::Draining, now_ns);
        }
    }

    // ── subscriber set ─────────────────────────────────────────────────────

    /// Register a subscriber position.
    ///
    /// Marks the log connected on every add, not only the first arrival.
    pub fn add_subscriber(&mut self, position: Position, is_tether: bool, now_ns: i64) {
        debug!(
            "subscriber added: counter={} tethered={} session={} stream={}",
            position.id(),
            is_tether,
            self.session_id,
            self.stream_id
        );
        self.subscribers
            .push(TetherablePosition::new(position, is_tether, now_ns));
        self.log.meta().set_is_connected(true);
        self.time_of_last_activity_ns = now_ns;
    }

    /// Remove a subscriber by its counter id. Dropping the last one marks
    /// the log disconnected.
    pub fn remove_subscriber(&mut self, counter_id: i32) {
        self.subscribers.retain(|s| s.counter_id() != counter_id);
        if self.subscribers.is_empty() {
            self.log.meta().set_is_connected(false);
        }
    }

    // ── position and limit management ──────────────────────────────────────

    /// Recompute the producer position, publication limit and cleaning.
    ///
    /// Returns a work count for duty-cycle accounting.
    pub fn update_pub_pos_and_lmt(&mut self) -> usize {
        if self.state != PublicationState::Active {
            return 0;
        }

        let mut work_count = 0;
        let producer_position = self.producer_position();
        self.pub_pos.set_release(producer_position);

        let mut min_subscriber_position = i64::MAX;
        let mut max_subscriber_position = self.consumer_position;
        let mut consuming_subscribers = 0;

        for subscriber in &self.subscribers {
            if subscriber.is_consuming() {
                let position = subscriber.position.get_volatile();
                min_subscriber_position = min_subscriber_position.min(position);
                max_subscriber_position = max_subscriber_position.max(position);
                consuming_subscribers += 1;
            }
        }

        if consuming_subscribers > 0 {
            let proposed_limit = min_subscriber_position + self.term_window_length;
            if proposed_limit > self.trip_limit {
                self.clean_buffer(min_subscriber_position);
                self.pub_lmt.set_release(proposed_limit);
                self.trip_limit = proposed_limit + self.trip_gain;
                work_count = 1;
            }

            self.consumer_position = max_subscriber_position;
        } else if self.pub_lmt.get() > self.consumer_position {
            // Nobody is reading: hold the publisher at the last consumed
            // position until a subscriber returns.
            self.trip_limit = self.consumer_position;
            self.pub_lmt.set_release(self.consumer_position);
            self.clean_buffer(self.consumer_position);
            work_count = 1;
        }

        work_count
    }

    /// Zero dirty term bytes between the clean position and `position`.
    ///
    /// At most one term-remainder per call; the trailing word of the swept
    /// range is zeroed last with release so readers of a recycled
    /// partition never see stale frame headers.
    pub fn clean_buffer(&mut self, position: i64) {
        let clean_position = self.clean_position;
        if position <= clean_position {
            return;
        }

        let dirty_index = index_by_position(clean_position, self.position_bits_to_shift);
        let term = &self.term_buffers[dirty_index];
        let term_offset = compute_term_offset_from_position(clean_position, self.term_length);
        let bytes_left_in_term = (self.term_length - term_offset) as i64;
        let length = (position - clean_position).min(bytes_left_in_term) as i32;

        if length >= 8 {
            term.set_memory(term_offset, length as usize - 8, 0);
            term.put_i64_release(term_offset + length - 8, 0);
            self.clean_position = clean_position + length as i64;
        }
    }

    // ── time-driven state machine ──────────────────────────────────────────

    /// One conductor tick.
    pub fn on_time_event(&mut self, now_ns: i64, _now_ms: i64, hooks: &mut dyn DriverHooks) {
        match self.state {
            PublicationState::Active => {
                self.check_untethered_subscriptions(now_ns, hooks);

                if self.in_cool_down && now_ns > self.cool_down_expire_time_ns {
                    self.in_cool_down = false;
                }

                let producer_position = self.producer_position();
                self.pub_pos.set_release(producer_position);
                self.check_for_blocked_publisher(producer_position, now_ns);

                if self.refcnt > 0 || !self.subscribers.is_empty() {
                    self.time_of_last_activity_ns = now_ns;
                } else if now_ns > self.time_of_last_activity_ns + self.liveness_timeout_ns {
                    self.transition_to(PublicationState::Draining, now_ns);
                }
            }
            PublicationState::Draining => {
                let producer_position = self.producer_position();
                self.pub_pos.set_release(producer_position);

                if self.is_drained() {
                    self.log.meta().set_end_of_stream_position(producer_position);
                    self.transition_to(PublicationState::Linger, now_ns);
                } else if unblock_log(
                    self.log.meta(),
                    &self.term_buffers,
                    self.consumer_position,
                ) {
                    self.counters.unblocked_publications.increment();
                }
            }
            PublicationState::Linger => {
                if now_ns > self.time_of_last_state_change_ns + self.linger_timeout_ns {
                    self.has_reached_end_of_life = true;
                    self.transition_to(PublicationState::Done, now_ns);
                }
            }
            PublicationState::Done => {}
        }
    }

    /// Pad over a stalled claim once the publisher has sat at the consumer
    /// position past the unblock timeout.
    pub fn check_for_blocked_publisher(&mut self, producer_position: i64, now_ns: i64) {
        let consumer_position = self.consumer_position;

        if consumer_position == self.last_consumer_position
            && self.is_possibly_blocked(producer_position, consumer_position)
        {
            if now_ns
                > self.time_of_last_consumer_position_change_ns + self.unblock_timeout_ns
                && unblock_log(self.log.meta(), &self.term_buffers, consumer_position)
            {
                warn_event!(
                    "blocked publisher unblocked: session={} stream={} position={}",
                    self.session_id,
                    self.stream_id,
                    consumer_position
                );
                self.counters.unblocked_publications.increment();
            }
        } else {
            self.time_of_last_consumer_position_change_ns = now_ns;
            self.last_consumer_position = consumer_position;
        }
    }

    /// Revoke the publication at `position`.
    ///
    /// Publishes end-of-stream, pins the limit so appends past the revoked
    /// position back-pressure, and skips straight to Linger under a
    /// cool-down that refuses new subscriptions.
    pub fn reject(&mut self, position: i64, reason: &str, now_ns: i64, hooks: &mut dyn DriverHooks) {
        if matches!(self.state, PublicationState::Linger | PublicationState::Done) {
            return;
        }

        warn_event!(
            "ipc publication revoked: session={} stream={} position={} reason={}",
            self.session_id,
            self.stream_id,
            position,
            reason
        );
        self.log.meta().set_end_of_stream_position(position);
        self.pub_lmt.set_release(position);
        self.trip_limit = position;
        hooks.on_publication_revoke(position, self.session_id, self.stream_id);
        self.counters.publications_revoked.increment();
        self.in_cool_down = true;
        self.cool_down_expire_time_ns = now_ns + self.cool_down_timeout_ns;
        self.transition_to(PublicationState::Linger, now_ns);
    }

    /// Release the counters and account the unmapping. The mapping itself
    /// goes away when the publication is dropped.
    pub fn close(&mut self, counters: &mut Counters) {
        self.counters
            .mapped_bytes
            .get_and_add(-(self.log.log_length() as i64));
        counters.free(self.pub_lmt.id());
        counters.free(self.pub_pos.id());
        info!(
            "ipc publication closed: session={} stream={} registration={}",
            self.session_id, self.stream_id, self.registration_id
        );
    }

    // ── internals ──────────────────────────────────────────────────────────

    fn transition_to(&mut self, state: PublicationState, now_ns: i64) {
        debug!(
            "ipc publication {:?} -> {:?}: session={} stream={}",
            self.state, state, self.session_id, self.stream_id
        );
        self.state = state;
        self.time_of_last_state_change_ns = now_ns;
    }

    fn check_untethered_subscriptions(&mut self, now_ns: i64, hooks: &mut dyn DriverHooks) {
        let untethered_window_limit =
            (self.consumer_position - self.term_window_length) + (self.term_window_length / 8);
        let producer_position = self.producer_position();

        for subscriber in &mut self.subscribers {
            if subscriber.is_tether {
                continue;
            }

            match subscriber.state {
                TetherState::Active => {
                    if subscriber.position.get_volatile() > untethered_window_limit {
                        subscriber.time_of_last_update_ns = now_ns;
                    } else if now_ns
                        > subscriber.time_of_last_update_ns
                            + self.untethered_window_limit_timeout_ns
                    {
                        subscriber.state = TetherState::Linger;
                        subscriber.time_of_last_update_ns = now_ns;
                        hooks.on_untethered_state_change(
                            subscriber.counter_id(),
                            now_ns,
                            TetherState::Linger,
                            self.stream_id,
                            self.session_id,
                        );
                    }
                }
                TetherState::Linger => {
                    if now_ns
                        > subscriber.time_of_last_update_ns + self.untethered_linger_timeout_ns
                    {
                        subscriber.state = TetherState::Resting;
                        subscriber.time_of_last_update_ns = now_ns;
                        hooks.on_untethered_state_change(
                            subscriber.counter_id(),
                            now_ns,
                            TetherState::Resting,
                            self.stream_id,
                            self.session_id,
                        );
                    }
                }
                TetherState::Resting => {
                    if now_ns
                        > subscriber.time_of_last_update_ns + self.untethered_resting_timeout_ns
                    {
                        // Rejoin at the live edge of the stream.
                        subscriber.position.set_release(producer_position);
                        subscriber.state = TetherState::Active;
                        subscriber.time_of_last_update_ns = now_ns;
                        hooks.on_untethered_state_change(
                            subscriber.counter_id(),
                            now_ns,
                            TetherState::Active,
                            self.stream_id,
                            self.session_id,
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_log::frame;
    use skein_log::publication::{Publication, ADMIN_ACTION, BACK_PRESSURED};
    use skein_log::HeaderWriter;
    use skein_primitives::{HeapBuffer, PositionReader, COUNTER_LENGTH};

    const TERM_LENGTH: i32 = 64 * 1024;
    const WINDOW: i64 = (TERM_LENGTH / 2) as i64;

    struct Fixture {
        _counters_heap: HeapBuffer,
        counters: Counters,
        system: SystemCounters,
        publication: IpcPublication,
        _dir: tempfile::TempDir,
    }

    fn test_config() -> LogConfig {
        LogConfig {
            term_length: TERM_LENGTH,
            mtu_length: 1408,
            session_id: 99,
            stream_id: 7,
            initial_term_id: 0,
            correlation_id: 55,
            ..LogConfig::default()
        }
    }

    fn test_context() -> DriverContext {
        DriverContext {
            unblock_timeout_ns: 100,
            liveness_timeout_ns: 1_000,
            linger_timeout_ns: 1_000,
            untethered_window_limit_timeout_ns: 500,
            untethered_linger_timeout_ns: 500,
            untethered_resting_timeout_ns: 500,
            cool_down_timeout_ns: 1_000,
            ..DriverContext::default()
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let counters_heap = HeapBuffer::new_zeroed(16 * COUNTER_LENGTH);
        let mut counters = Counters::new(counters_heap.buffer());
        let system = SystemCounters::allocate(&mut counters).unwrap();

        let publication = IpcPublication::create(
            &dir.path().join("pub.logbuffer"),
            &test_config(),
            "skein:ipc",
            101,
            &test_context(),
            &mut counters,
            system,
            0,
        )
        .unwrap();

        Fixture {
            _counters_heap: counters_heap,
            counters,
            system,
            publication,
            _dir: dir,
        }
    }

    fn subscriber(f: &mut Fixture, is_tether: bool, now_ns: i64) -> Position {
        let id = f.counters.allocate().unwrap();
        let position = f.counters.position(id);
        f.publication.add_subscriber(position, is_tether, now_ns);
        position
    }

    fn limit_reader(f: &Fixture) -> PositionReader {
        f.counters.reader(f.publication.publication_limit_id())
    }

    /// An appender attached to the same log file, as a publisher process
    /// would be.
    fn attach_appender(f: &Fixture) -> Publication {
        let path = f.publication.log_buffers().path().unwrap();
        let log = LogBuffers::attach(path).unwrap();
        Publication::new(log, limit_reader(f), None, 101)
    }

    #[test]
    fn create_starts_active_with_zeroed_positions() {
        let f = fixture();

        assert_eq!(f.publication.state(), PublicationState::Active);
        assert!(!f.publication.has_reached_end_of_life());
        assert_eq!(f.publication.producer_position(), 0);
        assert_eq!(f.publication.consumer_position(), 0);
        assert_eq!(limit_reader(&f).get_volatile(), 0);
        assert_eq!(
            f.system.mapped_bytes.get_volatile(),
            f.publication.log_buffers().log_length() as i64
        );
        assert_eq!(f.publication.channel(), "skein:ipc");
    }

    #[test]
    fn create_failure_releases_counters() {
        let dir = tempfile::tempdir().unwrap();
        let counters_heap = HeapBuffer::new_zeroed(8 * COUNTER_LENGTH);
        let mut counters = Counters::new(counters_heap.buffer());
        let system = SystemCounters::allocate(&mut counters).unwrap();

        let mut bad_config = test_config();
        bad_config.term_length = 12345;
        let result = IpcPublication::create(
            &dir.path().join("bad.logbuffer"),
            &bad_config,
            "skein:ipc",
            1,
            &test_context(),
            &mut counters,
            system,
            0,
        );
        assert!(matches!(result, Err(CreateError::Config(_))));

        // The three free cells are still free.
        let a = counters.allocate().unwrap();
        let b = counters.allocate().unwrap();
        let c = counters.allocate().unwrap();
        assert_eq!((a, b, c), (5, 6, 7));
    }

    #[test]
    fn first_subscriber_connects_and_opens_the_window() {
        let mut f = fixture();
        assert!(!f.publication.log_buffers().meta().is_connected());

        let position = subscriber(&mut f, true, 0);
        position.set_release(0);
        assert!(f.publication.log_buffers().meta().is_connected());

        let work = f.publication.update_pub_pos_and_lmt();
        assert_eq!(work, 1);
        assert_eq!(limit_reader(&f).get_volatile(), WINDOW);
    }

    #[test]
    fn limit_follows_the_minimum_subscriber() {
        let mut f = fixture();
        let fast = subscriber(&mut f, true, 0);
        let slow = subscriber(&mut f, true, 0);

        fast.set_release(8192);
        slow.set_release(1024);
        assert_eq!(f.publication.update_pub_pos_and_lmt(), 1);

        assert_eq!(limit_reader(&f).get_volatile(), 1024 + WINDOW);
        assert_eq!(f.publication.consumer_position(), 8192);
    }

    #[test]
    fn limit_updates_are_damped_by_trip_gain() {
        let mut f = fixture();
        let position = subscriber(&mut f, true, 0);
        position.set_release(0);
        assert_eq!(f.publication.update_pub_pos_and_lmt(), 1);
        let first_limit = limit_reader(&f).get_volatile();

        // A small advance within the trip gain publishes nothing new.
        position.set_release(WINDOW / 16);
        assert_eq!(f.publication.update_pub_pos_and_lmt(), 0);
        assert_eq!(limit_reader(&f).get_volatile(), first_limit);

        // Advancing beyond the gain trips a fresh limit.
        position.set_release(WINDOW);
        assert_eq!(f.publication.update_pub_pos_and_lmt(), 1);
        assert_eq!(limit_reader(&f).get_volatile(), WINDOW + WINDOW);
    }

    #[test]
    fn losing_all_subscribers_holds_the_publisher() {
        let mut f = fixture();
        let position = subscriber(&mut f, true, 0);
        position.set_release(0);
        f.publication.update_pub_pos_and_lmt();
        assert!(limit_reader(&f).get_volatile() > 0);

        f.publication.remove_subscriber(position.id());
        assert!(!f.publication.log_buffers().meta().is_connected());

        assert_eq!(f.publication.update_pub_pos_and_lmt(), 1);
        assert_eq!(limit_reader(&f).get_volatile(), 0);
    }

    #[test]
    fn appender_sees_backpressure_through_the_shared_limit() {
        let mut f = fixture();
        let position = subscriber(&mut f, true, 0);
        position.set_release(0);
        f.publication.update_pub_pos_and_lmt();

        let appender = attach_appender(&f);
        let msg = [0u8; 1000];
        let mut result = appender.offer(&msg);
        while result >= 0 || result == ADMIN_ACTION {
            result = appender.offer(&msg);
        }
        assert_eq!(result, BACK_PRESSURED);
        assert!(appender.position() >= WINDOW);

        // The subscriber catching up re-opens the window.
        position.set_release(appender.position());
        f.publication.update_pub_pos_and_lmt();
        assert!(appender.offer(&msg) > 0);
    }

    #[test]
    fn cleaning_zeroes_consumed_terms_behind_the_subscriber() {
        let mut f = fixture();
        let position = subscriber(&mut f, true, 0);
        position.set_release(0);
        f.publication.update_pub_pos_and_lmt();

        let appender = attach_appender(&f);
        let msg = [0x55u8; 1024];

        // Run the stream into the second term.
        while f.publication.producer_position() < TERM_LENGTH as i64 + 4096 {
            position.set_release(f.publication.producer_position());
            f.publication.update_pub_pos_and_lmt();
            let result = appender.offer(&msg);
            assert!(result >= 0 || result == ADMIN_ACTION);
        }
        position.set_release(f.publication.producer_position());
        f.publication.update_pub_pos_and_lmt();

        assert!(f.publication.clean_position() > 0);
        // The swept start of term 0 is zeroed again.
        let term0 = f.publication.log_buffers().term_buffer(0);
        assert_eq!(frame::frame_length_volatile(&term0, 0), 0);
    }

    #[test]
    fn drains_then_lingers_then_dies() {
        let mut f = fixture();
        let position = subscriber(&mut f, true, 0);
        position.set_release(0);
        f.publication.update_pub_pos_and_lmt();

        let appender = attach_appender(&f);
        assert!(appender.offer(&[1u8; 256]) > 0);

        f.publication.decref(10);
        assert_eq!(f.publication.state(), PublicationState::Draining);

        // Not drained: subscriber is behind the producer.
        f.publication.on_time_event(20, 0, &mut ());
        assert_eq!(f.publication.state(), PublicationState::Draining);

        // Caught up: linger begins and end-of-stream is published.
        position.set_release(f.publication.producer_position());
        f.publication.on_time_event(30, 0, &mut ());
        assert_eq!(f.publication.state(), PublicationState::Linger);
        assert_eq!(
            f.publication.log_buffers().meta().end_of_stream_position(),
            f.publication.producer_position()
        );

        // Linger holds until its timeout passes.
        f.publication.on_time_event(900, 0, &mut ());
        assert_eq!(f.publication.state(), PublicationState::Linger);
        f.publication.on_time_event(1031, 0, &mut ());
        assert_eq!(f.publication.state(), PublicationState::Done);
        assert!(f.publication.has_reached_end_of_life());
    }

    #[test]
    fn liveness_timeout_drains_an_abandoned_publication() {
        let mut f = fixture();
        // Keep the reference but never attach a subscriber.
        f.publication.on_time_event(500, 0, &mut ());
        assert_eq!(f.publication.state(), PublicationState::Active);

        // Reference released below the liveness window; no subscribers.
        f.publication.refcnt = 0;
        f.publication.on_time_event(900, 0, &mut ());
        assert_eq!(f.publication.state(), PublicationState::Active);
        f.publication.on_time_event(1600, 0, &mut ());
        assert_eq!(f.publication.state(), PublicationState::Draining);
    }

    #[test]
    fn untethered_subscriber_cycles_linger_resting_rejoin() {
        #[derive(Default)]
        struct RecordingHooks {
            transitions: Vec<(i32, TetherState)>,
        }
        impl DriverHooks for RecordingHooks {
            fn on_untethered_state_change(
                &mut self,
                counter_id: i32,
                _now_ns: i64,
                new_state: TetherState,
                _stream_id: i32,
                _session_id: i32,
            ) {
                self.transitions.push((counter_id, new_state));
            }
        }

        let mut f = fixture();
        let mut hooks = RecordingHooks::default();

        let tethered = subscriber(&mut f, true, 0);
        let untethered = subscriber(&mut f, false, 0);
        tethered.set_release(0);
        untethered.set_release(0);
        f.publication.update_pub_pos_and_lmt();

        let appender = attach_appender(&f);

        // The tethered reader keeps up; the untethered one stays at zero
        // until the publisher has filled the whole window.
        loop {
            let result = appender.offer(&[0u8; 1024]);
            if result == BACK_PRESSURED {
                break;
            }
            assert!(result > 0);
            tethered.set_release(appender.position());
            f.publication.update_pub_pos_and_lmt();
        }

        // Behind the window past the timeout: Active -> Linger.
        f.publication.on_time_event(501, 0, &mut hooks);
        // Linger expires: -> Resting.
        f.publication.on_time_event(1002, 0, &mut hooks);
        // The resting position no longer holds the window back.
        let min_before_rejoin = f.publication.join_position();
        assert_eq!(min_before_rejoin, appender.position());

        // Resting expires: rejoin at the producer position.
        f.publication.on_time_event(1503, 0, &mut hooks);

        let untethered_id = untethered.id();
        assert_eq!(
            hooks.transitions,
            vec![
                (untethered_id, TetherState::Linger),
                (untethered_id, TetherState::Resting),
                (untethered_id, TetherState::Active),
            ]
        );
        assert_eq!(untethered.get_volatile(), appender.position());
    }

    #[test]
    fn blocked_publisher_is_padded_out_after_timeout() {
        let mut f = fixture();
        let position = subscriber(&mut f, true, 0);
        position.set_release(0);
        f.publication.update_pub_pos_and_lmt();

        // A claim that is never committed blocks the stream at offset 0.
        let meta = f.publication.log_buffers().meta();
        let writer = HeaderWriter::new(meta.default_frame_header());
        let term0 = f.publication.log_buffers().term_buffer(0);
        writer.write(&term0, 0, 96, 0);
        meta.raw_tail(0)
            .fetch_add(96, skein_primitives::sync::Ordering::AcqRel);

        // First sighting arms the timer; a later tick past the unblock
        // timeout pads the claim.
        f.publication.on_time_event(10, 0, &mut ());
        assert_eq!(f.system.unblocked_publications.get_volatile(), 0);
        f.publication.on_time_event(200, 0, &mut ());

        assert_eq!(f.system.unblocked_publications.get_volatile(), 1);
        assert!(frame::is_padding(&term0, 0));
        assert_eq!(frame::frame_length_volatile(&term0, 0), 96);
    }

    #[test]
    fn reject_revokes_and_enters_cool_down() {
        #[derive(Default)]
        struct RevokeHooks {
            revoked: Vec<(i64, i32, i32)>,
        }
        impl DriverHooks for RevokeHooks {
            fn on_publication_revoke(&mut self, position: i64, session_id: i32, stream_id: i32) {
                self.revoked.push((position, session_id, stream_id));
            }
        }

        let mut f = fixture();
        let mut hooks = RevokeHooks::default();
        let position = subscriber(&mut f, true, 0);
        position.set_release(0);
        f.publication.update_pub_pos_and_lmt();

        f.publication.reject(4096, "test revoke", 100, &mut hooks);

        assert_eq!(f.publication.state(), PublicationState::Linger);
        assert_eq!(hooks.revoked, vec![(4096, 99, 7)]);
        assert_eq!(f.system.publications_revoked.get_volatile(), 1);
        assert_eq!(
            f.publication.log_buffers().meta().end_of_stream_position(),
            4096
        );
        assert!(!f.publication.is_accepting_subscriptions());

        // Repeat rejects are no-ops.
        f.publication.reject(8192, "again", 200, &mut hooks);
        assert_eq!(f.system.publications_revoked.get_volatile(), 1);
    }

    #[test]
    fn accepting_subscriptions_follows_state_and_cool_down() {
        let mut f = fixture();
        assert!(f.publication.is_accepting_subscriptions());

        let position = subscriber(&mut f, true, 0);
        position.set_release(0);
        f.publication.update_pub_pos_and_lmt();

        let appender = attach_appender(&f);
        assert!(appender.offer(&[1u8; 128]) > 0);

        // Draining with undelivered data still accepts late subscribers.
        f.publication.decref(0);
        assert_eq!(f.publication.state(), PublicationState::Draining);
        assert!(f.publication.is_accepting_subscriptions());

        // Drained: no further subscriptions.
        position.set_release(f.publication.producer_position());
        assert!(!f.publication.is_accepting_subscriptions());
    }

    #[test]
    fn close_returns_counters_and_unmaps_accounting() {
        let mut f = fixture();
        let mapped = f.publication.log_buffers().log_length() as i64;
        assert_eq!(f.system.mapped_bytes.get_volatile(), mapped);

        let lmt_id = f.publication.publication_limit_id();
        let pos_id = f.publication.producer_position_id();
        f.publication.close(&mut f.counters);

        assert_eq!(f.system.mapped_bytes.get_volatile(), 0);
        // Freed ids are reusable.
        let a = f.counters.allocate().unwrap();
        let b = f.counters.allocate().unwrap();
        assert_eq!(
            {
                let mut ids = [a, b];
                ids.sort_unstable();
                ids
            },
            {
                let mut ids = [lmt_id, pos_id];
                ids.sort_unstable();
                ids
            }
        );
    }

    #[test]
    fn join_position_tracks_slowest_consuming_subscriber() {
        let mut f = fixture();
        let a = subscriber(&mut f, true, 0);
        let b = subscriber(&mut f, true, 0);
        a.set_release(100);
        b.set_release(50);
        f.publication.update_pub_pos_and_lmt();

        assert_eq!(f.publication.join_position(), 50);
    }
}
