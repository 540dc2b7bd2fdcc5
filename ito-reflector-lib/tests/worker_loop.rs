//! Worker-loop tests against an in-memory backend: buffer accounting,
//! shutdown latency and counter aggregation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ito_reflector_lib::config::ReflectorConfig;
use ito_reflector_lib::stats::Stats;
use ito_reflector_lib::worker::Worker;
use ito_reflector_lib::{FrameDesc, Platform, WorkerStats};

const LOCAL_MAC: [u8; 6] = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];

fn probeot_frame() -> Vec<u8> {
    let mut f = vec![0u8; 64];
    f[0..6].copy_from_slice(&LOCAL_MAC);
    f[6..12].copy_from_slice(&[0x00, 0xc0, 0x17, 0x54, 0x05, 0x98]);
    f[12..14].copy_from_slice(&[0x08, 0x00]);
    f[14] = 0x45;
    f[16..18].copy_from_slice(&[0x00, 0x27]);
    f[23] = 17;
    f[26..30].copy_from_slice(&[192, 168, 0, 10]);
    f[30..34].copy_from_slice(&[192, 168, 0, 1]);
    f[34..36].copy_from_slice(&[0x0f, 0x02]);
    f[36..38].copy_from_slice(&[0x0f, 0x03]);
    f[38..40].copy_from_slice(&[0x00, 0x14]);
    f[42..47].copy_from_slice(&[0x09, 0x10, 0xea, 0x1d, 0x00]);
    f[47..54].copy_from_slice(b"PROBEOT");
    f
}

fn bad_mac_frame() -> Vec<u8> {
    let mut f = probeot_frame();
    f[0..6].copy_from_slice(&[0xff; 6]);
    f
}

#[derive(Default)]
struct MockState {
    /// Frames waiting to be "received".
    incoming: Vec<Vec<u8>>,
    /// Buffers handed to the worker, keyed by token. Boxed so the
    /// bytes never move while leased.
    leased: HashMap<u64, Box<[u8]>>,
    next_token: u64,
    sent: Vec<Vec<u8>>,
    releases: u64,
    double_releases: u64,
    /// Cap on descriptors accepted per send_batch; tail is reported
    /// unsent.
    send_limit: usize,
}

/// In-memory backend with strict lease bookkeeping: every descriptor
/// handed out must come back exactly once.
struct MockBackend {
    state: Arc<Mutex<MockState>>,
    poll_timeout: Duration,
}

impl MockBackend {
    fn new(frames: Vec<Vec<u8>>, send_limit: usize, poll_timeout: Duration) -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState {
            incoming: frames,
            send_limit,
            ..MockState::default()
        }));
        (MockBackend { state: Arc::clone(&state), poll_timeout }, state)
    }

    fn release_one(state: &mut MockState, token: u64) {
        if state.leased.remove(&token).is_none() {
            state.double_releases += 1;
        } else {
            state.releases += 1;
        }
    }
}

impl Platform for MockBackend {
    fn recv_batch(&mut self, out: &mut [FrameDesc]) -> usize {
        let mut state = self.state.lock().expect("mock state");
        if state.incoming.is_empty() {
            drop(state);
            // Bounded wait, as the contract requires.
            std::thread::sleep(self.poll_timeout);
            return 0;
        }
        let mut n = 0;
        while n < out.len() && !state.incoming.is_empty() {
            let frame = state.incoming.remove(0);
            let token = state.next_token;
            state.next_token += 1;
            let mut boxed = frame.into_boxed_slice();
            let ptr = boxed.as_mut_ptr();
            let len = boxed.len() as u32;
            state.leased.insert(token, boxed);
            out[n] = FrameDesc::from_raw(ptr, len, token);
            out[n].timestamp_ns = ito_reflector_lib::nic::monotonic_ns();
            n += 1;
        }
        n
    }

    fn send_batch(&mut self, pkts: &[FrameDesc]) -> usize {
        let mut state = self.state.lock().expect("mock state");
        let n = pkts.len().min(state.send_limit);
        for pkt in &pkts[..n] {
            assert!(state.leased.contains_key(&pkt.token), "sending unleased buffer");
            state.sent.push(pkt.bytes().to_vec());
        }
        n
    }

    fn release_rejected(&mut self, pkt: &FrameDesc) {
        let mut state = self.state.lock().expect("mock state");
        Self::release_one(&mut state, pkt.token);
    }

    fn release_sent(&mut self, pkts: &[FrameDesc]) {
        let mut state = self.state.lock().expect("mock state");
        for pkt in pkts {
            Self::release_one(&mut state, pkt.token);
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

fn test_config() -> ReflectorConfig {
    let mut cfg = ReflectorConfig::for_interface("mock0");
    cfg.mac = LOCAL_MAC;
    cfg.ito_port = 0x0f03;
    cfg.poll_timeout_ms = 10;
    cfg
}

struct RunningWorker {
    handle: std::thread::JoinHandle<()>,
    running: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    state: Arc<Mutex<MockState>>,
}

fn spawn_worker(
    frames: Vec<Vec<u8>>,
    send_limit: usize,
    config: ReflectorConfig,
) -> RunningWorker {
    let poll = Duration::from_millis(u64::from(config.poll_timeout_ms));
    let (backend, state) = MockBackend::new(frames, send_limit, poll);
    let running = Arc::new(AtomicBool::new(true));
    let stats = Arc::new(WorkerStats::new());
    let worker = Worker {
        id: 0,
        queue_id: 0,
        cpu_id: -1,
        backend: Box::new(backend),
        config: Arc::new(config),
        stats: Arc::clone(&stats),
        running: Arc::clone(&running),
    };
    let handle = std::thread::spawn(move || worker.run());
    RunningWorker { handle, running, stats, state }
}

fn wait_until(state: &Arc<Mutex<MockState>>, deadline: Duration, f: impl Fn(&MockState) -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if f(&state.lock().expect("mock state")) {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("mock backend condition not reached within {deadline:?}");
}

#[test]
fn s5_every_descriptor_returns_exactly_once() {
    let mut frames = Vec::new();
    for i in 0..200 {
        if i % 3 == 0 {
            frames.push(bad_mac_frame());
        } else {
            frames.push(probeot_frame());
        }
    }
    let total = frames.len() as u64;

    let rw = spawn_worker(frames, usize::MAX, test_config());
    wait_until(&rw.state, Duration::from_secs(5), |s| s.releases == total);
    rw.running.store(false, Ordering::Release);
    rw.handle.join().expect("worker join");

    let state = rw.state.lock().expect("mock state");
    assert!(state.leased.is_empty(), "no descriptor still owed");
    assert_eq!(state.double_releases, 0, "no double release");
    assert_eq!(state.releases, total);
    // 1 of 3 frames had a foreign MAC.
    assert_eq!(state.sent.len() as u64, total - total.div_ceil(3));
}

#[test]
fn short_sends_release_the_tail_and_count_failures() {
    let frames = vec![probeot_frame(); 8];
    let mut cfg = test_config();
    cfg.batch_size = 8;
    // Only 3 of each batch fit in the "TX ring".
    let rw = spawn_worker(frames, 3, cfg);
    wait_until(&rw.state, Duration::from_secs(5), |s| s.releases == 8);
    rw.running.store(false, Ordering::Release);
    rw.handle.join().expect("worker join");

    let state = rw.state.lock().expect("mock state");
    assert!(state.leased.is_empty());
    assert_eq!(state.double_releases, 0);
    assert_eq!(state.sent.len(), 3);
    assert_eq!(rw.stats.err_tx_failed.load(Ordering::Relaxed), 5);
    assert_eq!(rw.stats.packets_reflected.load(Ordering::Relaxed), 3);
}

#[test]
fn sent_frames_are_reflected_in_place() {
    let rw = spawn_worker(vec![probeot_frame()], usize::MAX, test_config());
    wait_until(&rw.state, Duration::from_secs(5), |s| !s.sent.is_empty());
    rw.running.store(false, Ordering::Release);
    rw.handle.join().expect("worker join");

    let state = rw.state.lock().expect("mock state");
    let sent = &state.sent[0];
    assert_eq!(&sent[0..6], &[0x00, 0xc0, 0x17, 0x54, 0x05, 0x98]);
    assert_eq!(&sent[6..12], &LOCAL_MAC);
    assert_eq!(&sent[26..30], &[192, 168, 0, 1]);
    assert_eq!(&sent[47..54], b"PROBEOT");
}

#[test]
fn s6_stop_propagates_within_two_poll_timeouts() {
    let mut cfg = test_config();
    cfg.poll_timeout_ms = 100;
    let rw = spawn_worker(Vec::new(), usize::MAX, cfg);

    // Let the worker settle into its idle recv loop.
    std::thread::sleep(Duration::from_millis(50));
    let stop_at = Instant::now();
    rw.running.store(false, Ordering::Release);
    rw.handle.join().expect("worker join");
    assert!(
        stop_at.elapsed() <= Duration::from_millis(2 * 100 + 100),
        "stop took {:?}",
        stop_at.elapsed()
    );
}

#[test]
fn latency_reservoir_fills_when_measuring() {
    let mut cfg = test_config();
    cfg.measure_latency = true;
    let rw = spawn_worker(vec![probeot_frame(); 4], usize::MAX, cfg);
    wait_until(&rw.state, Duration::from_secs(5), |s| s.releases == 4);
    rw.running.store(false, Ordering::Release);
    rw.handle.join().expect("worker join");

    assert_eq!(rw.stats.lat_count.load(Ordering::Relaxed), 4);
    let min = rw.stats.lat_min_ns.load(Ordering::Relaxed);
    let max = rw.stats.lat_max_ns.load(Ordering::Relaxed);
    assert!(min <= max);
    assert!(max < 1_000_000_000, "latency sample implausibly large");
    assert!(
        rw.stats.lat_sum_ns.load(Ordering::Relaxed) >= min,
        "sum covers at least the minimum"
    );
}

#[test]
fn latency_reservoir_stays_empty_when_not_measuring() {
    let rw = spawn_worker(vec![probeot_frame(); 4], usize::MAX, test_config());
    wait_until(&rw.state, Duration::from_secs(5), |s| s.releases == 4);
    rw.running.store(false, Ordering::Release);
    rw.handle.join().expect("worker join");

    assert_eq!(rw.stats.lat_count.load(Ordering::Relaxed), 0);
    assert_eq!(rw.stats.lat_min_ns.load(Ordering::Relaxed), u64::MAX);
}

#[test]
fn aggregated_counters_equal_worker_sums() {
    let a = spawn_worker(vec![probeot_frame(); 6], usize::MAX, test_config());
    let b = spawn_worker(
        vec![probeot_frame(), bad_mac_frame(), bad_mac_frame()],
        usize::MAX,
        test_config(),
    );
    wait_until(&a.state, Duration::from_secs(5), |s| s.releases == 6);
    wait_until(&b.state, Duration::from_secs(5), |s| s.releases == 3);
    a.running.store(false, Ordering::Release);
    b.running.store(false, Ordering::Release);
    a.handle.join().expect("worker a join");
    b.handle.join().expect("worker b join");

    let workers = [Arc::clone(&a.stats), Arc::clone(&b.stats)];
    let agg = Stats::aggregate(&workers, 1.0);

    let sum = |f: fn(&WorkerStats) -> u64| f(&a.stats) + f(&b.stats);
    assert_eq!(agg.packets_received, sum(|w| w.packets_received.load(Ordering::Relaxed)));
    assert_eq!(agg.packets_reflected, sum(|w| w.packets_reflected.load(Ordering::Relaxed)));
    assert_eq!(agg.packets_dropped, sum(|w| w.packets_dropped.load(Ordering::Relaxed)));
    assert_eq!(agg.sig_probeot_count, sum(|w| w.sig_probeot.load(Ordering::Relaxed)));
    assert_eq!(agg.err_invalid_mac, sum(|w| w.err_invalid_mac.load(Ordering::Relaxed)));
    assert_eq!(agg.packets_received, 9);
    assert_eq!(agg.packets_reflected, 7);
    assert_eq!(agg.err_invalid_mac, 2);
}
