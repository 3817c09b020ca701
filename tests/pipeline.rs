use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use mjpeg_receiver::{
    frame_feed, ChannelSource, DecodedFrame, FrameDecoder, FrameFeed, FrameListener,
    FrameSource, QueuePolicy, RawFrame, Receiver, ReceiverConfig, ReceiverState,
    TerminationCause,
};

fn sleeping_decoder(
    delay: impl Fn(u64) -> Duration + Send + Sync + 'static,
) -> Arc<dyn FrameDecoder<u64>> {
    Arc::new(move |raw: &RawFrame| -> Result<u64> {
        thread::sleep(delay(raw.sequence()));
        Ok(raw.sequence())
    })
}

fn instant_decoder() -> Arc<dyn FrameDecoder<u64>> {
    sleeping_decoder(|_| Duration::ZERO)
}

fn channel_receiver(
    policy: QueuePolicy,
    decoder: Arc<dyn FrameDecoder<u64>>,
) -> (Arc<Receiver<u64>>, FrameFeed) {
    let (feed, source) = frame_feed("test");
    let config = ReceiverConfig {
        policy,
        ..ReceiverConfig::with_url("stub://test")
    };
    let receiver = Receiver::with_source_factory(
        config,
        decoder,
        move |_: &ReceiverConfig| -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(ChannelSource::clone(&source)))
        },
    )
    .expect("receiver");
    (Arc::new(receiver), feed)
}

fn recording_listener(seen: &Arc<Mutex<Vec<u64>>>) -> Arc<dyn FrameListener<u64>> {
    let seen = seen.clone();
    Arc::new(move |frame: &Arc<DecodedFrame<u64>>| {
        seen.lock().unwrap().push(*frame.image());
    })
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn send_frames(feed: &FrameFeed, count: u64) {
    for i in 0..count {
        feed.send(vec![0xFF, 0xD8, i as u8, 0xFF, 0xD9]).unwrap();
    }
}

#[test]
fn bounded_policy_delivers_every_frame_in_order() {
    // Uneven decode times so workers finish out of order.
    let decoder = sleeping_decoder(|seq| Duration::from_millis(5 * ((seq * 7) % 4)));
    let (receiver, feed) = channel_receiver(
        QueuePolicy::Bounded {
            capacity: 10,
            decode_workers: 3,
        },
        decoder,
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    receiver.add_listener(recording_listener(&seen));

    receiver.start().unwrap();
    send_frames(&feed, 10);
    drop(feed);

    assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 10));
    assert!(wait_until(Duration::from_secs(1), || receiver
        .source_termination()
        .is_some()));
    assert_eq!(*seen.lock().unwrap(), (1..=10).collect::<Vec<u64>>());

    let termination = receiver.source_termination().unwrap();
    assert_eq!(termination.cause, TerminationCause::EndOfStream);
    assert_eq!(termination.frames_captured, 10);
    assert!(wait_until(Duration::from_secs(1), || receiver.state()
        == ReceiverState::SourceEnded));
    let stats = receiver.stats();
    assert_eq!(stats.frames_captured, 10);
    assert_eq!(stats.frames_dispatched, 10);
    assert_eq!(stats.frames_dropped, 0);

    receiver.stop();
    assert_eq!(receiver.state(), ReceiverState::Stopped);
}

#[test]
fn latest_only_policy_skips_frames_but_ends_on_the_newest() {
    let decoder = sleeping_decoder(|_| Duration::from_millis(50));
    let (receiver, feed) = channel_receiver(QueuePolicy::LatestOnly, decoder);
    let seen = Arc::new(Mutex::new(Vec::new()));
    receiver.add_listener(recording_listener(&seen));

    receiver.start().unwrap();
    send_frames(&feed, 5);
    drop(feed);

    assert!(wait_until(Duration::from_secs(5), || receiver
        .latest_frame()
        .is_some_and(|frame| frame.sequence() == 5)));
    // Let anything still in flight settle before inspecting the calls.
    thread::sleep(Duration::from_millis(100));

    let calls = seen.lock().unwrap().clone();
    assert!(calls.len() < 5, "expected dropped frames, got {:?}", calls);
    assert_eq!(calls.last(), Some(&5));
    assert!(calls.windows(2).all(|pair| pair[0] < pair[1]));

    let stats = receiver.stats();
    assert_eq!(stats.frames_captured, 5);
    assert_eq!(stats.frames_dispatched as usize, calls.len());
    assert!(stats.frames_dropped > 0);
    receiver.stop();
}

#[test]
fn failing_listeners_do_not_block_the_others() {
    let (receiver, feed) = channel_receiver(QueuePolicy::default(), instant_decoder());
    let seen = Arc::new(Mutex::new(Vec::new()));

    struct Failing;
    impl FrameListener<u64> for Failing {
        fn on_frame(&self, frame: &Arc<DecodedFrame<u64>>) -> Result<()> {
            Err(anyhow!("listener rejected frame {}", frame.sequence()))
        }
    }
    receiver.add_listener(Arc::new(Failing));
    receiver.add_listener(Arc::new(|_: &Arc<DecodedFrame<u64>>| panic!("listener bug")));
    receiver.add_listener(recording_listener(&seen));

    receiver.start().unwrap();
    send_frames(&feed, 3);

    assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 3));
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(receiver.stats().listener_failures, 6);
    receiver.stop();
}

#[test]
fn start_and_stop_are_idempotent() {
    let (_feed, source) = frame_feed("idempotent");
    let sessions = Arc::new(AtomicUsize::new(0));
    let counter = sessions.clone();
    let receiver = Receiver::with_source_factory(
        ReceiverConfig::with_url("stub://idempotent"),
        instant_decoder(),
        move |_: &ReceiverConfig| -> Result<Box<dyn FrameSource>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ChannelSource::clone(&source)))
        },
    )
    .unwrap();

    receiver.stop();
    assert_eq!(receiver.state(), ReceiverState::Stopped);

    receiver.create_connection().unwrap();
    receiver.start().unwrap();
    assert_eq!(receiver.state(), ReceiverState::Started);
    assert!(receiver.is_healthy());
    // The second start found a live session and built nothing.
    assert_eq!(sessions.load(Ordering::SeqCst), 1);

    receiver.close_connection();
    receiver.stop();
    assert_eq!(receiver.state(), ReceiverState::Stopped);
    assert!(!receiver.is_started());
    assert!(!receiver.is_healthy());

    receiver.start().unwrap();
    assert_eq!(sessions.load(Ordering::SeqCst), 2);
    receiver.stop();
}

#[test]
fn restart_begins_a_clean_session() {
    let (receiver, feed) = channel_receiver(QueuePolicy::default(), instant_decoder());

    receiver.start().unwrap();
    send_frames(&feed, 2);
    assert!(wait_until(Duration::from_secs(5), || receiver
        .latest_frame()
        .is_some_and(|frame| frame.sequence() == 2)));
    receiver.stop();

    // The last frame outlives stop() and is cleared by the next start().
    assert_eq!(receiver.latest_frame().unwrap().sequence(), 2);
    receiver.start().unwrap();
    assert!(receiver.latest_frame().is_none());
    assert_eq!(receiver.stats().frames_captured, 0);

    send_frames(&feed, 1);
    assert!(wait_until(Duration::from_secs(5), || receiver
        .latest_frame()
        .is_some_and(|frame| frame.sequence() == 1)));
    receiver.stop();
}

#[test]
fn source_failure_is_recorded_and_stop_stays_clean() {
    let (receiver, feed) = channel_receiver(QueuePolicy::default(), instant_decoder());
    let seen = Arc::new(Mutex::new(Vec::new()));
    receiver.add_listener(recording_listener(&seen));

    receiver.start().unwrap();
    send_frames(&feed, 2);
    feed.fail("camera went away").unwrap();

    assert!(wait_until(Duration::from_secs(5), || receiver
        .source_termination()
        .is_some()));
    let termination = receiver.source_termination().unwrap();
    assert_eq!(
        termination.cause,
        TerminationCause::Failed("camera went away".to_string())
    );
    assert_eq!(termination.frames_captured, 2);
    assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 2));

    let started = Instant::now();
    receiver.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(receiver.state(), ReceiverState::Stopped);
}

struct SelfRemoving {
    receiver: Weak<Receiver<u64>>,
    me: OnceLock<Weak<SelfRemoving>>,
    calls: AtomicUsize,
}

impl FrameListener<u64> for SelfRemoving {
    fn on_frame(&self, _frame: &Arc<DecodedFrame<u64>>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let receiver = self.receiver.upgrade().ok_or_else(|| anyhow!("receiver gone"))?;
        let me: Arc<dyn FrameListener<u64>> = self
            .me
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow!("listener gone"))?;
        receiver.remove_listener(&me);
        Ok(())
    }
}

#[test]
fn listener_can_remove_itself_from_its_callback() {
    let (receiver, feed) = channel_receiver(QueuePolicy::default(), instant_decoder());
    let once = Arc::new(SelfRemoving {
        receiver: Arc::downgrade(&receiver),
        me: OnceLock::new(),
        calls: AtomicUsize::new(0),
    });
    once.me.set(Arc::downgrade(&once)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    receiver.add_listener(once.clone());
    receiver.add_listener(recording_listener(&seen));

    receiver.start().unwrap();
    send_frames(&feed, 3);

    assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 3));
    assert_eq!(once.calls.load(Ordering::SeqCst), 1);
    let as_listener: Arc<dyn FrameListener<u64>> = once.clone();
    assert!(!receiver.remove_listener(&as_listener));
    receiver.stop();
}

#[test]
fn stop_from_a_listener_callback_does_not_deadlock() {
    let (receiver, feed) = channel_receiver(QueuePolicy::default(), instant_decoder());
    let weak = Arc::downgrade(&receiver);
    receiver.add_listener(Arc::new(move |_: &Arc<DecodedFrame<u64>>| {
        if let Some(receiver) = weak.upgrade() {
            receiver.stop();
        }
    }));

    receiver.start().unwrap();
    send_frames(&feed, 1);
    assert!(wait_until(Duration::from_secs(5), || receiver.state()
        == ReceiverState::Stopped));
}

#[test]
fn stop_is_bounded_when_a_decode_hangs() {
    let (feed, source) = frame_feed("hung");
    let config = ReceiverConfig {
        stop_timeout: Duration::from_millis(100),
        ..ReceiverConfig::with_url("stub://hung")
    };
    let receiver = Receiver::with_source_factory(
        config,
        sleeping_decoder(|_| Duration::from_secs(3)),
        move |_: &ReceiverConfig| -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(source.clone()))
        },
    )
    .unwrap();

    receiver.start().unwrap();
    send_frames(&feed, 2);
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    receiver.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(receiver.state(), ReceiverState::Stopped);
    assert!(receiver.latest_frame().is_none());
}

#[test]
fn detached_dispatch_delivers_nothing_after_restart() {
    let (feed, source) = frame_feed("restart");
    let config = ReceiverConfig {
        stop_timeout: Duration::from_millis(100),
        ..ReceiverConfig::with_url("stub://restart")
    };
    let receiver = Receiver::with_source_factory(
        config,
        instant_decoder(),
        move |_: &ReceiverConfig| -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(source.clone()))
        },
    )
    .unwrap();

    // The first call outlives the stop timeout, so its dispatch thread is detached.
    let slow_started = Arc::new(AtomicUsize::new(0));
    let first_call = slow_started.clone();
    receiver.add_listener(Arc::new(move |_: &Arc<DecodedFrame<u64>>| {
        if first_call.fetch_add(1, Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(400));
        }
    }));
    let seen = Arc::new(Mutex::new(Vec::new()));
    receiver.add_listener(recording_listener(&seen));

    receiver.start().unwrap();
    send_frames(&feed, 1);
    assert!(wait_until(Duration::from_secs(5), || slow_started
        .load(Ordering::SeqCst)
        > 0));
    receiver.stop();

    receiver.start().unwrap();
    send_frames(&feed, 3);
    assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() >= 3));
    // Past the detached call, so a stale delivery would have happened by now.
    thread::sleep(Duration::from_millis(500));

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(receiver.latest_frame().unwrap().sequence(), 3);
    receiver.stop();
}

#[test]
fn concurrent_readers_see_monotonic_frames() {
    let config = ReceiverConfig::with_url("stub://bench?fps=500&frames=200");
    let receiver = Arc::new(
        Receiver::new(config, sleeping_decoder(|_| Duration::from_micros(200))).unwrap(),
    );
    receiver.start().unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let receiver = receiver.clone();
            thread::spawn(move || {
                let mut last = 0;
                while last < 200 {
                    if let Some(frame) = receiver.latest_frame() {
                        assert!(frame.sequence() >= last);
                        assert_eq!(*frame.image(), frame.sequence());
                        last = frame.sequence();
                    }
                    if receiver.state() == ReceiverState::Stopped {
                        break;
                    }
                }
                last
            })
        })
        .collect();

    assert!(wait_until(Duration::from_secs(10), || receiver
        .latest_frame()
        .is_some_and(|frame| frame.sequence() == 200)));
    for reader in readers {
        assert_eq!(reader.join().unwrap(), 200);
    }
    receiver.stop();
}
