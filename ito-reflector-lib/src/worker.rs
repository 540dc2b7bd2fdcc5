//! Per-queue worker: the receive/classify/reflect/transmit loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ReflectorConfig, MAX_BATCH, STATS_FLUSH_BATCHES};
use crate::nic;
use crate::packet::classify::{classify, signature_type};
use crate::packet::reflect::{prefetch_read, reflect};
use crate::platform::{FrameDesc, Platform};
use crate::stats::{StatsBatch, WorkerStats};

/// One dataplane worker: owns a backend bound to one RX queue and a
/// private stats block. Constructed by the supervisor; public so the
/// loop can be driven against a mock backend in tests.
pub struct Worker {
    pub id: usize,
    pub queue_id: u32,
    pub cpu_id: i32,
    pub backend: Box<dyn Platform>,
    pub config: Arc<ReflectorConfig>,
    pub stats: Arc<WorkerStats>,
    pub running: Arc<AtomicBool>,
}

impl Worker {
    pub fn run(mut self) {
        if self.cpu_id >= 0 {
            if let Err(err) = nic::pin_current_thread(self.cpu_id) {
                debug!(worker = self.id, cpu = self.cpu_id, %err, "CPU pin failed");
            }
        }
        nic::raise_thread_priority();

        info!(
            worker = self.id,
            queue = self.queue_id,
            cpu = self.cpu_id,
            backend = self.backend.name(),
            "worker started"
        );

        self.stats.start_time_ns.store(nic::monotonic_ns(), Ordering::Relaxed);

        let batch_size = self.config.batch_size.clamp(1, MAX_BATCH);
        let mode = self.config.reflect_mode;
        let software_checksum = self.config.software_checksum;
        let measure_latency = self.config.measure_latency;

        let mut rx = [FrameDesc::default(); MAX_BATCH];
        let mut tx = [FrameDesc::default(); MAX_BATCH];
        let mut rejected = [FrameDesc::default(); MAX_BATCH];
        let mut batch = StatsBatch::new();
        let mut iterations: u32 = 0;

        while self.running.load(Ordering::Acquire) {
            let rcvd = self.backend.recv_batch(&mut rx[..batch_size]);
            if !self.running.load(Ordering::Acquire) {
                // Release anything received while stopping.
                for desc in &rx[..rcvd] {
                    self.backend.release_rejected(desc);
                }
                break;
            }
            if rcvd == 0 {
                if !self.config.busy_poll {
                    batch.poll_timeouts += 1;
                }
                continue;
            }

            let mut n_tx = 0;
            let mut n_rej = 0;
            for i in 0..rcvd {
                if i + 1 < rcvd {
                    prefetch_read(rx[i + 1].data_ptr());
                }
                let desc = rx[i];
                batch.rx_packets += 1;
                batch.rx_bytes += desc.len() as u64;
                match classify(desc.bytes(), &self.config) {
                    Ok(_) => {
                        tx[n_tx] = desc;
                        n_tx += 1;
                    }
                    Err(reason) => {
                        batch.count_reject(reason);
                        rejected[n_rej] = desc;
                        n_rej += 1;
                    }
                }
            }

            for desc in tx[..n_tx].iter_mut() {
                batch.count_signature(signature_type(desc.bytes()));
                reflect(desc.bytes_mut(), mode, software_checksum);
                if measure_latency && desc.timestamp_ns != 0 {
                    let now = nic::monotonic_ns();
                    batch.record_latency(now.saturating_sub(desc.timestamp_ns));
                }
            }

            if n_tx > 0 {
                let sent = self.backend.send_batch(&tx[..n_tx]);
                for desc in &tx[..sent] {
                    batch.tx_packets += 1;
                    batch.tx_bytes += desc.len() as u64;
                }
                // The unsent tail never reached the wire; its buffers
                // go straight back.
                for desc in &tx[sent..n_tx] {
                    batch.err_tx_failed += 1;
                    self.backend.release_rejected(desc);
                }
                if sent > 0 {
                    self.backend.release_sent(&tx[..sent]);
                }
            }

            for desc in &rejected[..n_rej] {
                self.backend.release_rejected(desc);
            }

            iterations = iterations.wrapping_add(1);
            if iterations % STATS_FLUSH_BATCHES == 0 {
                batch.flush(&self.stats, nic::monotonic_ns());
            }
        }

        batch.flush(&self.stats, nic::monotonic_ns());
        info!(worker = self.id, "worker stopped");
    }
}
