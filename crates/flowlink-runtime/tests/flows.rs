//! Flow scheduling variants driven through the hub

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel;
use flowlink_core::{define_event, Event, FlowConfig, HeartbeatEvent};
use flowlink_runtime::{
    Binder, Case, Flow, FlowState, FnCase, FrameClock, FrameFlow, Hub, MultiThreadFlow,
    SingleThreadFlow, ThreadPoolFlow, ThreadlessFlow, TimeFlow,
};

define_event! {
    pub struct Job = 500 {
        seq: u32 => set_seq,
    }
}

fn job(seq: u32) -> Box<Job> {
    let mut job = Job::new();
    job.set_seq(seq);
    Box::new(job)
}

fn collecting_case(sink: channel::Sender<u32>) -> Arc<dyn Case> {
    Arc::new(FnCase::new("collect", move |binder: &mut Binder| {
        let sink = sink.clone();
        binder.bind_type(move |job: &Job| {
            let _ = sink.send(*job.seq());
        });
    }))
}

fn receive(rx: &channel::Receiver<u32>, count: usize) -> Vec<u32> {
    (0..count)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect()
}

#[test]
fn test_single_thread_flow_preserves_order() {
    let hub = Hub::new();
    let (tx, rx) = channel::unbounded();
    let flow = SingleThreadFlow::new("ordered", FlowConfig::testing());
    flow.add_case(collecting_case(tx));
    hub.attach(flow.clone()).unwrap();

    let guard = hub.startup().unwrap();
    for seq in 0..200 {
        assert_eq!(hub.post(job(seq)), 1);
    }
    assert_eq!(receive(&rx, 200), (0..200).collect::<Vec<_>>());

    guard.shutdown();
    assert_eq!(flow.state(), FlowState::Stopped);
}

#[test]
fn test_single_thread_handlers_never_overlap() {
    let flow = SingleThreadFlow::new("serial", FlowConfig::testing());
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    {
        let (active, overlaps, done) = (active.clone(), overlaps.clone(), done.clone());
        flow.add_case(Arc::new(FnCase::new("serial", move |binder: &mut Binder| {
            let (active, overlaps, done) = (active.clone(), overlaps.clone(), done.clone());
            binder.bind_type(move |_: &Job| {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_micros(200));
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        })));
    }

    flow.start().unwrap();
    for seq in 0..50 {
        assert!(flow.feed(job(seq)));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while done.load(Ordering::SeqCst) < 50 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    flow.stop();

    assert_eq!(done.load(Ordering::SeqCst), 50);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn test_multi_thread_flow_handles_every_event() {
    let hub = Hub::new();
    let (tx, rx) = channel::unbounded();
    let flow = MultiThreadFlow::with_workers("parallel", FlowConfig::testing(), 4);
    flow.add_case(collecting_case(tx));
    hub.attach(flow.clone()).unwrap();

    let _guard = hub.startup().unwrap();
    for seq in 0..400 {
        hub.post(job(seq));
    }
    let mut seen = receive(&rx, 400);
    seen.sort_unstable();
    assert_eq!(seen, (0..400).collect::<Vec<_>>());
}

#[test]
fn test_thread_pool_flow_handles_every_event() {
    let (tx, rx) = channel::unbounded();
    let flow = ThreadPoolFlow::new("legacy", FlowConfig::testing());
    flow.add_case(collecting_case(tx));

    flow.start().unwrap();
    for seq in 0..100 {
        assert!(flow.feed(job(seq)));
    }
    let mut seen = receive(&rx, 100);
    seen.sort_unstable();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
    flow.stop();
    assert_eq!(flow.state(), FlowState::Stopped);
}

#[test]
fn test_threadless_wait_dispatches_until_match() {
    let (tx, rx) = channel::unbounded();
    let flow = ThreadlessFlow::new("pump", FlowConfig::testing());
    flow.add_case(collecting_case(tx));
    flow.start().unwrap();

    for seq in 0..5 {
        flow.feed(job(seq));
    }
    let mut expected = Job::new();
    expected.set_seq(3);
    let matched = flow.wait_for(&expected, Duration::from_secs(1)).unwrap();
    assert_eq!(*matched.seq(), 3);
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);

    expected.set_seq(99);
    assert!(flow.wait_for(&expected, Duration::from_millis(20)).is_none());
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![4]);
}

#[test]
fn test_frame_flow_interleaves_updates_and_events() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    let (tx, rx) = channel::unbounded();
    let flow = FrameFlow::new("frames", FlowConfig::testing(), move |_: &FrameClock| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    flow.add_case(collecting_case(tx));

    flow.start().unwrap();
    for seq in 0..10 {
        flow.feed(job(seq));
    }
    assert_eq!(receive(&rx, 10), (0..10).collect::<Vec<_>>());
    flow.stop();
    assert!(ticks.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_time_flow_posts_heartbeats_through_hub() {
    let hub = Hub::new();
    let time = TimeFlow::new("time", &hub, FlowConfig::testing());
    let beats = Arc::new(Mutex::new(Vec::new()));
    let listener = SingleThreadFlow::new("listener", FlowConfig::testing());
    {
        let beats = beats.clone();
        listener.add_case(Arc::new(FnCase::new("beats", move |binder: &mut Binder| {
            let beats = beats.clone();
            binder.bind_type(move |beat: &HeartbeatEvent| {
                beats.lock().unwrap().push(beat.transform_eligible());
            });
        })));
    }
    hub.attach(time.clone()).unwrap();
    hub.attach(listener).unwrap();

    let _guard = hub.startup().unwrap();
    time.start_heartbeat(Duration::from_millis(10));
    time.reserve(job(1), Duration::from_millis(5));

    let deadline = Instant::now() + Duration::from_secs(5);
    while beats.lock().unwrap().len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let beats = beats.lock().unwrap();
    assert!(beats.len() >= 3);
    assert!(beats.iter().all(|eligible| !eligible));
}
