//! End-to-end publication lifecycle: a driver-side resource and a
//! publisher attached to the same log file, driven by explicit conductor
//! ticks the way the real duty cycle drives them.

use skein_driver::{
    DriverContext, DriverHooks, IpcPublication, PublicationState, RetransmitHandler,
    RetransmitWindowFlowControl, SystemCounters, TetherState,
};
use skein_log::log_buffers::{LogBuffers, LogConfig};
use skein_log::publication::{Publication, ADMIN_ACTION, BACK_PRESSURED, NOT_CONNECTED};
use skein_primitives::{Counters, HeapBuffer, COUNTER_LENGTH};

const TERM_LENGTH: i32 = 64 * 1024;
const MS: i64 = 1_000_000;

fn config() -> LogConfig {
    LogConfig {
        term_length: TERM_LENGTH,
        mtu_length: 1408,
        session_id: 1,
        stream_id: 1001,
        initial_term_id: 0,
        correlation_id: 9,
        ..LogConfig::default()
    }
}

fn context() -> DriverContext {
    DriverContext {
        liveness_timeout_ns: 100 * MS,
        linger_timeout_ns: 100 * MS,
        unblock_timeout_ns: 50 * MS,
        ..DriverContext::default()
    }
}

struct NullHooks;
impl DriverHooks for NullHooks {}

#[test]
fn publication_feeds_publisher_until_drained_and_done() {
    let dir = tempfile::tempdir().unwrap();
    let counters_heap = HeapBuffer::new_zeroed(16 * COUNTER_LENGTH);
    let mut counters = Counters::new(counters_heap.buffer());
    let system = SystemCounters::allocate(&mut counters).unwrap();

    let mut driver_pub = IpcPublication::create(
        &dir.path().join("pub.logbuffer"),
        &config(),
        "skein:ipc?term-length=64k",
        7,
        &context(),
        &mut counters,
        system,
        0,
    )
    .unwrap();

    // Publisher attaches its own mapping, as a separate process would.
    let appender_log = LogBuffers::attach(driver_pub.log_buffers().path().unwrap()).unwrap();
    let limit_reader = counters.reader(driver_pub.publication_limit_id());
    let appender = Publication::new(appender_log, limit_reader, None, 7);

    // No subscriber yet: the window is shut.
    assert_eq!(appender.offer(b"too early"), NOT_CONNECTED);

    // Subscriber arrives; the conductor opens the window.
    let sub_id = counters.allocate().unwrap();
    let sub_position = counters.position(sub_id);
    driver_pub.add_subscriber(sub_position, true, 0);
    driver_pub.update_pub_pos_and_lmt();
    assert!(appender.is_connected());

    // Publish across a term rotation while the subscriber keeps pace.
    let msg = vec![0xA5u8; 900];
    let mut published = 0u32;
    let mut now_ns = 0;
    while published < 100 {
        match appender.offer(&msg) {
            result if result >= 0 => published += 1,
            ADMIN_ACTION => {}
            BACK_PRESSURED => {
                sub_position.set_release(driver_pub.producer_position());
                now_ns += MS;
                driver_pub.update_pub_pos_and_lmt();
                driver_pub.on_time_event(now_ns, now_ns / MS, &mut NullHooks);
            }
            other => panic!("unexpected publish result {other}"),
        }
    }
    assert!(appender.position() >= 100 * 960);

    // The publisher goes away; the subscriber finishes reading.
    appender.close();
    driver_pub.decref(now_ns);
    assert_eq!(driver_pub.state(), PublicationState::Draining);

    sub_position.set_release(driver_pub.producer_position());
    now_ns += MS;
    driver_pub.on_time_event(now_ns, now_ns / MS, &mut NullHooks);
    assert_eq!(driver_pub.state(), PublicationState::Linger);
    assert_eq!(
        driver_pub.log_buffers().meta().end_of_stream_position(),
        driver_pub.producer_position()
    );

    now_ns += 101 * MS;
    driver_pub.on_time_event(now_ns, now_ns / MS, &mut NullHooks);
    assert_eq!(driver_pub.state(), PublicationState::Done);
    assert!(driver_pub.has_reached_end_of_life());

    driver_pub.close(&mut counters);
    assert_eq!(system.mapped_bytes.get_volatile(), 0);
}

#[test]
fn nak_storm_is_coalesced_and_bounded() {
    let counters_heap = HeapBuffer::new_zeroed(4 * COUNTER_LENGTH);
    let mut counters = Counters::new(counters_heap.buffer());
    let invalid_id = counters.allocate().unwrap();
    let overflow_id = counters.allocate().unwrap();
    let invalid = counters.position(invalid_id);
    let overflow = counters.position(overflow_id);

    let mut handler = RetransmitHandler::new(invalid, 0, 20 * MS, true, 16, overflow).unwrap();
    let flow = RetransmitWindowFlowControl::default();
    let mut resends: Vec<(i32, i32, usize)> = Vec::new();

    // A burst of NAKs for the same loss resends once.
    for _ in 0..10 {
        handler.on_nak(
            0x1234,
            72,
            36,
            TERM_LENGTH as usize,
            1408,
            &flow,
            0,
            &mut |term_id, term_offset, length| {
                resends.push((term_id, term_offset, length));
                0
            },
        );
    }
    assert_eq!(resends, vec![(0x1234, 72, 36)]);

    // Once the linger passes, a repeat NAK earns a fresh resend.
    let now = 30 * MS;
    assert_eq!(
        handler.process_timeouts(now, &mut |_, _, _| 0),
        1
    );
    handler.on_nak(
        0x1234,
        72,
        36,
        TERM_LENGTH as usize,
        1408,
        &flow,
        now,
        &mut |term_id, term_offset, length| {
            resends.push((term_id, term_offset, length));
            0
        },
    );
    assert_eq!(resends.len(), 2);
    assert_eq!(overflow.get_volatile(), 0);
    assert_eq!(invalid.get_volatile(), 0);
}

#[test]
fn untethered_subscriber_does_not_wedge_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let counters_heap = HeapBuffer::new_zeroed(16 * COUNTER_LENGTH);
    let mut counters = Counters::new(counters_heap.buffer());
    let system = SystemCounters::allocate(&mut counters).unwrap();

    let ctx = DriverContext {
        untethered_window_limit_timeout_ns: 10 * MS,
        untethered_linger_timeout_ns: 10 * MS,
        untethered_resting_timeout_ns: 10 * MS,
        ..context()
    };

    let mut driver_pub = IpcPublication::create(
        &dir.path().join("wedge.logbuffer"),
        &config(),
        "skein:ipc",
        8,
        &ctx,
        &mut counters,
        system,
        0,
    )
    .unwrap();

    let appender_log = LogBuffers::attach(driver_pub.log_buffers().path().unwrap()).unwrap();
    let appender = Publication::new(
        appender_log,
        counters.reader(driver_pub.publication_limit_id()),
        None,
        8,
    );

    let live_id = counters.allocate().unwrap();
    let stuck_id = counters.allocate().unwrap();
    let live = counters.position(live_id);
    let stuck = counters.position(stuck_id);
    driver_pub.add_subscriber(live, true, 0);
    driver_pub.add_subscriber(stuck, false, 0);
    driver_pub.update_pub_pos_and_lmt();

    // Fill the window; the stuck untethered subscriber pins the limit.
    let msg = [0u8; 1000];
    loop {
        let result = appender.offer(&msg);
        if result == BACK_PRESSURED {
            break;
        }
        assert!(result > 0 || result == ADMIN_ACTION);
        live.set_release(driver_pub.producer_position());
        driver_pub.update_pub_pos_and_lmt();
    }

    struct CountingHooks {
        changes: usize,
    }
    impl DriverHooks for CountingHooks {
        fn on_untethered_state_change(
            &mut self,
            _counter_id: i32,
            _now_ns: i64,
            _new_state: TetherState,
            _stream_id: i32,
            _session_id: i32,
        ) {
            self.changes += 1;
        }
    }
    let mut hooks = CountingHooks { changes: 0 };

    // Linger, then rest. Once resting, the stream frees up.
    driver_pub.on_time_event(11 * MS, 11, &mut hooks);
    driver_pub.on_time_event(22 * MS, 22, &mut hooks);
    assert_eq!(hooks.changes, 2);

    driver_pub.update_pub_pos_and_lmt();
    assert!(appender.offer(&msg) > 0, "stream should be unpinned");

    // After the resting period the subscriber rejoins at the live edge.
    driver_pub.on_time_event(33 * MS, 33, &mut hooks);
    assert_eq!(hooks.changes, 3);
    assert_eq!(stuck.get_volatile(), driver_pub.producer_position());
}
