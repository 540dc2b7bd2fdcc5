//! Reflector supervisor: owns configuration, workers and aggregation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::config::{BackendKind, ReflectorConfig, MAX_WORKERS};
use crate::error::{ReflectorError, Result};
use crate::nic;
use crate::platform::Platform;
use crate::stats::{Stats, WorkerStats};
use crate::worker::Worker;

pub struct Reflector {
    config: ReflectorConfig,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    worker_stats: Vec<Arc<WorkerStats>>,
    started_ns: u64,
}

impl Reflector {
    /// Resolve the interface and build a reflector with default
    /// configuration.
    pub fn new(ifname: &str) -> Result<Reflector> {
        let mut config = ReflectorConfig::for_interface(ifname);
        config.ifindex = nic::interface_index(ifname)?;
        config.mac = nic::interface_mac(ifname)?;
        info!(
            interface = ifname,
            ifindex = config.ifindex,
            mac = %nic::format_mac(&config.mac),
            "reflector initialized"
        );
        if let Some(speed) = nic::link_speed_mbps(ifname) {
            info!(interface = ifname, speed_mbps = speed, "link speed detected");
        }
        Ok(Reflector {
            config,
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            worker_stats: Vec::new(),
            started_ns: 0,
        })
    }

    pub fn config(&self) -> &ReflectorConfig {
        &self.config
    }

    /// Replace the configuration. Rejected while workers are running.
    pub fn set_config(&mut self, config: ReflectorConfig) -> Result<()> {
        if self.is_running() {
            return Err(ReflectorError::AlreadyRunning);
        }
        if config.batch_size == 0 {
            return Err(ReflectorError::Config("batch size must be positive".into()));
        }
        if config.frame_size == 0 || !config.frame_size.is_power_of_two() {
            return Err(ReflectorError::Config("frame size must be a power of two".into()));
        }
        if config.num_frames == 0 || !config.num_frames.is_power_of_two() {
            return Err(ReflectorError::Config("frame count must be a power of two".into()));
        }
        self.config = config;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.handles.is_empty()
    }

    /// Spawn one pinned worker per RX queue (clamped to
    /// [`MAX_WORKERS`]) and start reflecting.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(ReflectorError::AlreadyRunning);
        }

        let num_workers = if self.config.num_workers > 0 {
            self.config.num_workers.min(MAX_WORKERS)
        } else {
            nic::rx_queue_count(&self.config.ifname).min(MAX_WORKERS)
        };

        let backends = build_backends(&self.config, num_workers)?;

        // Sockets and rings exist; root is no longer needed.
        nic::drop_privileges();

        self.worker_stats = (0..num_workers).map(|_| Arc::new(WorkerStats::new())).collect();
        self.running.store(true, Ordering::Release);
        self.started_ns = nic::monotonic_ns();

        let config = Arc::new(self.config.clone());
        let ncpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        for (i, backend) in backends.into_iter().enumerate() {
            let queue_id = i as u32;
            let cpu_id = if self.config.cpu >= 0 {
                (self.config.cpu as usize + i) as i32 % ncpus as i32
            } else {
                nic::queue_cpu_affinity(queue_id)
            };
            let worker = Worker {
                id: i,
                queue_id,
                cpu_id,
                backend,
                config: Arc::clone(&config),
                stats: Arc::clone(&self.worker_stats[i]),
                running: Arc::clone(&self.running),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("reflector-w{i}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    // Unwind the workers already started.
                    self.stop();
                    return Err(ReflectorError::Io(e));
                }
            }
        }

        info!(workers = num_workers, "reflector started");
        Ok(())
    }

    /// Signal every worker and join them. Stop propagates within one
    /// poll timeout per worker.
    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.running.store(false, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        info!("reflector stopped");
    }

    /// Aggregate worker counters without locking. The snapshot is
    /// consistent per counter, not across counters.
    pub fn get_stats(&self) -> Stats {
        let elapsed = if self.started_ns == 0 {
            0.0
        } else {
            (nic::monotonic_ns().saturating_sub(self.started_ns)) as f64 / 1e9
        };
        Stats::aggregate(&self.worker_stats, elapsed)
    }

    /// Zero all counters. Only valid while stopped.
    pub fn reset_stats(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(ReflectorError::StillRunning);
        }
        for stats in &self.worker_stats {
            stats.reset();
        }
        self.started_ns = 0;
        Ok(())
    }
}

impl Drop for Reflector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(target_os = "linux")]
fn build_backends(config: &ReflectorConfig, n: usize) -> Result<Vec<Box<dyn Platform>>> {
    match config.backend {
        BackendKind::Auto => match build_xdp(config, n) {
            Ok(backends) => Ok(backends),
            Err(err) => {
                warn!(%err, "kernel-bypass init failed, falling back to AF_PACKET ring");
                build_ring(config, n)
            }
        },
        BackendKind::XdpBypass => build_xdp(config, n),
        BackendKind::PacketRing => build_ring(config, n),
        BackendKind::BpfDevice => Err(ReflectorError::UnsupportedPlatform),
    }
    .map(|backends| {
        if let Some(b) = backends.first() {
            info!(backend = b.name(), "platform backend selected");
        }
        backends
    })
}

#[cfg(target_os = "linux")]
fn build_xdp(config: &ReflectorConfig, n: usize) -> Result<Vec<Box<dyn Platform>>> {
    use crate::platform::{filter::XdpFilter, xdp::XdpBackend};

    // Worker 0 owns the one-time program setup; the rest share the
    // handle and only register their sockets.
    let filter = XdpFilter::load(config)?;
    let mut backends: Vec<Box<dyn Platform>> = Vec::with_capacity(n);
    for queue in 0..n as u32 {
        backends.push(Box::new(XdpBackend::new(config, queue, Some(Arc::clone(&filter)))?));
    }
    Ok(backends)
}

#[cfg(target_os = "linux")]
fn build_ring(config: &ReflectorConfig, n: usize) -> Result<Vec<Box<dyn Platform>>> {
    use crate::platform::ring::RingBackend;

    let mut backends: Vec<Box<dyn Platform>> = Vec::with_capacity(n);
    for _ in 0..n {
        backends.push(Box::new(RingBackend::new(config, n)?));
    }
    Ok(backends)
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn build_backends(config: &ReflectorConfig, n: usize) -> Result<Vec<Box<dyn Platform>>> {
    use crate::platform::bpf::BpfBackend;

    match config.backend {
        BackendKind::Auto | BackendKind::BpfDevice => {
            let mut backends: Vec<Box<dyn Platform>> = Vec::with_capacity(n);
            for _ in 0..n {
                backends.push(Box::new(BpfBackend::new(config)?));
            }
            Ok(backends)
        }
        BackendKind::XdpBypass | BackendKind::PacketRing => {
            Err(ReflectorError::UnsupportedPlatform)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
fn build_backends(_config: &ReflectorConfig, _n: usize) -> Result<Vec<Box<dyn Platform>>> {
    Err(ReflectorError::UnsupportedPlatform)
}
