//! End-to-end relay tests: producer and consumer on separate threads over
//! one shared region, exercising attach, publication, validation, damage
//! planning and the cursor channel together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use framerelay::cursor::{CursorEvent, CursorShapeUpdate, CursorSink};
use framerelay::damage::DamageTracker;
use framerelay::frame::{FramePoll, RenderSink};
use framerelay::protocol::RegionLayout;
use framerelay::{
    CursorKind, CursorShape, DamageRect, Feature, FrameDescriptor, FrameMetadata, PixelFormat,
    RedrawPlan, RelayClient, RelayConfig, RelayHost, Rotation, SharedRegion,
};

const W: u32 = 64;
const H: u32 = 48;

fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.frame.slots = 3;
    config.frame.max_frame_size = W * H * 4 + 256;
    config.cursor.position_slots = 8;
    config.cursor.shape_slots = 2;
    config.cursor.max_shape_size = 4096;
    config.timing.frame_poll_us = 200;
    config.timing.cursor_poll_us = 200;
    config.timing.post_retry_us = 200;
    config.timing.post_retry_attempts = 500;
    config.timing.handshake_timeout_ms = 2000;
    config.timing.handshake_poll_ms = 1;
    config
}

fn meta(damage: Vec<DamageRect>) -> FrameMetadata {
    FrameMetadata {
        format: PixelFormat::Bgra,
        screen_width: W,
        screen_height: H,
        width: W,
        height: H,
        stride: W,
        pitch: W * 4,
        rotation: Rotation::Rot0,
        damage,
    }
}

fn payload(fill: u8) -> Vec<u8> {
    vec![fill; (W * H * 4) as usize]
}

/// Host thread plus client attach over one anonymous region.
fn start_session(config: &RelayConfig) -> (RelayHost, RelayClient) {
    let layout = RegionLayout::compute(config.geometry()).unwrap();
    let region = Arc::new(SharedRegion::anon(layout.total_size()));
    let mut host = RelayHost::create(
        region.clone(),
        config,
        Feature::PartialDamage | Feature::CursorRelay,
    )
    .unwrap();

    let timing = config.timing.clone();
    let attach_region = region.clone();
    let attacher = std::thread::spawn(move || RelayClient::attach(attach_region, &timing));

    let deadline = Instant::now() + Duration::from_secs(2);
    while !host.service().unwrap() {
        assert!(Instant::now() < deadline, "restart request never arrived");
        std::thread::sleep(Duration::from_millis(1));
    }
    let client = attacher.join().unwrap().unwrap();
    (host, client)
}

// =============================================================================
// Sinks
// =============================================================================

#[derive(Default)]
struct FrameCollect {
    serials: Vec<u64>,
    fills: Vec<u8>,
    damage: Vec<Vec<DamageRect>>,
}

impl RenderSink for FrameCollect {
    fn on_frame(&mut self, desc: &FrameDescriptor, payload: &[u8]) -> bool {
        self.serials.push(desc.serial);
        self.fills.push(payload[0]);
        self.damage.push(desc.damage.clone());
        true
    }
}

#[derive(Default)]
struct CursorCollect {
    shapes: Vec<u32>,
    positions: Vec<(i32, i32, bool)>,
}

impl CursorSink for CursorCollect {
    fn on_cursor_shape(&mut self, update: &CursorShapeUpdate, payload: &[u8]) -> bool {
        assert_eq!(payload.len(), update.payload_size());
        self.shapes.push(update.version);
        true
    }

    fn on_cursor_event(&mut self, event: &CursorEvent) -> bool {
        self.positions.push((event.x, event.y, event.visible));
        true
    }
}

fn drain<S>(step: &mut impl FnMut(&mut S) -> bool, sink: &mut S, want: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut got = 0;
    while got < want {
        if step(sink) {
            got += 1;
        } else {
            assert!(Instant::now() < deadline, "timed out after {got} of {want}");
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn frames_cross_threads_in_order() {
    let config = test_config();
    let (mut host, client) = start_session(&config);

    let mut consumer = client.frame_consumer().unwrap();

    let producer = std::thread::spawn(move || {
        for i in 0..50u8 {
            // Bounded retry keeps pace with the consumer.
            host.frame().publish(&meta(vec![]), &payload(i)).unwrap();
        }
        host
    });

    let mut sink = FrameCollect::default();
    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.serials.len() < 50 {
        assert!(Instant::now() < deadline, "timed out");
        if consumer.poll(&mut sink).unwrap() != FramePoll::Delivered {
            std::thread::sleep(Duration::from_micros(200));
        }
    }
    let mut host = producer.join().unwrap();

    let expected: Vec<u64> = (1..=50).collect();
    assert_eq!(sink.serials, expected);
    let fills: Vec<u8> = (0..50).collect();
    assert_eq!(sink.fills, fills);
    assert_eq!(host.frame().stats().published(), 50);
    assert_eq!(consumer.stats().received, 50);
}

#[test]
fn late_subscriber_gets_full_frame_repost() {
    let config = test_config();
    let (mut host, client) = start_session(&config);

    // Publish with partial damage before anyone subscribes to the queue.
    let mut sink = FrameCollect::default();
    {
        let mut consumer = client.frame_consumer().unwrap();
        host.service().unwrap(); // consume the subscribe edge
        host.frame().publish(&meta(vec![]), &payload(1)).unwrap();
        host.frame().publish(&meta(vec![]), &payload(2)).unwrap();
        host.frame()
            .publish(&meta(vec![DamageRect::new(4, 4, 8, 8)]), &payload(3))
            .unwrap();
        drain(
            &mut |s: &mut FrameCollect| consumer.poll(s).unwrap() == FramePoll::Delivered,
            &mut sink,
            3,
        );
    }
    assert_eq!(sink.damage[2], vec![DamageRect::new(4, 4, 8, 8)]);

    // A second consumer attaches later and must get the last frame again,
    // with full damage.
    let mut late = FrameCollect::default();
    let mut consumer = client.frame_consumer().unwrap();
    assert!(host.service().unwrap());
    drain(
        &mut |s: &mut FrameCollect| consumer.poll(s).unwrap() == FramePoll::Delivered,
        &mut late,
        1,
    );
    assert_eq!(late.fills, vec![3]);
    assert!(late.damage[0].is_empty(), "repost must carry full damage");
    assert_eq!(host.frame().stats().reposted(), 1);
}

#[test]
fn cursor_channel_full_path() {
    let config = test_config();
    let (mut host, client) = start_session(&config);

    let mut consumer = client.cursor_consumer().unwrap();

    host.cursor()
        .set_shape(CursorShape {
            kind: CursorKind::Color,
            width: 8,
            height: 8,
            pitch: 32,
            hot_x: 0,
            hot_y: 0,
            data: vec![0x5a; 8 * 32],
        })
        .unwrap();
    host.cursor().move_to(10, 20, true).unwrap();
    host.cursor().move_to(11, 21, false).unwrap();

    let mut sink = CursorCollect::default();
    use framerelay::cursor::CursorPoll;
    drain(
        &mut |s: &mut CursorCollect| consumer.poll(s).unwrap() == CursorPoll::Delivered,
        &mut sink,
        3,
    );

    assert_eq!(sink.shapes, vec![1]);
    // The shape message carries a position event too.
    assert_eq!(sink.positions.len(), 3);
    assert_eq!(sink.positions[1], (10, 20, true));
    assert_eq!(sink.positions[2], (11, 21, false));
}

#[test]
fn damage_flows_into_redraw_plan() {
    let config = test_config();
    let (mut host, client) = start_session(&config);

    let mut consumer = client.frame_consumer().unwrap();
    host.service().unwrap();

    // Two full publications (forced after the shape change), then partial.
    host.frame().publish(&meta(vec![]), &payload(0)).unwrap();
    host.frame().publish(&meta(vec![]), &payload(0)).unwrap();
    host.frame()
        .publish(&meta(vec![DamageRect::new(10, 10, 20, 20)]), &payload(0))
        .unwrap();

    let mut tracker = DamageTracker::new(config.damage.history_length);
    struct TrackSink<'a>(&'a mut DamageTracker);
    impl RenderSink for TrackSink<'_> {
        fn on_frame(&mut self, desc: &FrameDescriptor, _payload: &[u8]) -> bool {
            self.0.set_frame_size(desc.width, desc.height);
            self.0.record(&desc.damage);
            true
        }
    }
    let mut sink = TrackSink(&mut tracker);
    drain(
        &mut |s: &mut TrackSink| consumer.poll(s).unwrap() == FramePoll::Delivered,
        &mut sink,
        3,
    );

    // Age 1: only the latest publication, expanded by one pixel.
    match tracker.plan(1) {
        RedrawPlan::Partial(rects) => {
            assert_eq!(rects, vec![DamageRect::new(9, 9, 22, 22)])
        }
        RedrawPlan::Full => panic!("expected partial plan"),
    }
    // Age 2 walks back into a full-frame publication.
    assert!(tracker.plan(2).is_full());
    // Unknown age is always a full redraw.
    assert!(tracker.plan(0).is_full());
}

#[test]
fn pause_is_visible_across_the_region() {
    let config = test_config();
    let (mut host, client) = start_session(&config);
    let mut consumer = client.frame_consumer().unwrap();
    host.service().unwrap();

    host.set_paused(true).unwrap();
    assert!(client.is_paused().unwrap());
    host.frame().publish(&meta(vec![]), &payload(9)).unwrap();

    let mut sink = FrameCollect::default();
    assert_eq!(consumer.poll(&mut sink).unwrap(), FramePoll::Idle);

    host.set_paused(false).unwrap();
    drain(
        &mut |s: &mut FrameCollect| consumer.poll(s).unwrap() == FramePoll::Delivered,
        &mut sink,
        1,
    );
    assert_eq!(sink.fills, vec![9]);
}

#[test]
fn mismatched_build_cannot_attach() {
    let region = Arc::new(SharedRegion::anon(1 << 16));
    let result = RelayClient::attach(region, &test_config().timing);
    assert!(result.is_err());
}
