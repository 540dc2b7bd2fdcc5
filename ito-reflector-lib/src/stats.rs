//! Per-worker counters and supervisor-side aggregation.
//!
//! Each [`WorkerStats`] is written by exactly one worker. Workers
//! accumulate into a stack-local [`StatsBatch`] and flush every
//! [`crate::config::STATS_FLUSH_BATCHES`] receive iterations, keeping
//! the hot cache line in L1 and off the coherence bus. The supervisor
//! reads every counter as an independent relaxed load, so a snapshot is
//! consistent per counter but may be torn across counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::packet::classify::{RejectReason, SigType};

/// Counters owned by one worker. Monotonic except for the latency
/// min/max reservoir and the timestamps.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub packets_received: AtomicU64,
    pub packets_reflected: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_reflected: AtomicU64,

    pub sig_probeot: AtomicU64,
    pub sig_dataot: AtomicU64,
    pub sig_latency: AtomicU64,
    pub sig_rfc2544: AtomicU64,
    pub sig_y1564: AtomicU64,
    pub sig_unknown: AtomicU64,

    pub err_invalid_mac: AtomicU64,
    pub err_invalid_ethertype: AtomicU64,
    pub err_invalid_protocol: AtomicU64,
    pub err_invalid_signature: AtomicU64,
    pub err_too_short: AtomicU64,
    pub err_tx_failed: AtomicU64,
    pub err_nomem: AtomicU64,

    pub poll_timeouts: AtomicU64,

    pub lat_count: AtomicU64,
    pub lat_sum_ns: AtomicU64,
    /// u64::MAX while empty.
    pub lat_min_ns: AtomicU64,
    pub lat_max_ns: AtomicU64,

    pub start_time_ns: AtomicU64,
    pub last_update_ns: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        let s = Self::default();
        s.lat_min_ns.store(u64::MAX, Ordering::Relaxed);
        s
    }

    /// Zero every counter. Only meaningful while no worker is running.
    pub fn reset(&self) {
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_reflected.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_reflected.store(0, Ordering::Relaxed);
        self.sig_probeot.store(0, Ordering::Relaxed);
        self.sig_dataot.store(0, Ordering::Relaxed);
        self.sig_latency.store(0, Ordering::Relaxed);
        self.sig_rfc2544.store(0, Ordering::Relaxed);
        self.sig_y1564.store(0, Ordering::Relaxed);
        self.sig_unknown.store(0, Ordering::Relaxed);
        self.err_invalid_mac.store(0, Ordering::Relaxed);
        self.err_invalid_ethertype.store(0, Ordering::Relaxed);
        self.err_invalid_protocol.store(0, Ordering::Relaxed);
        self.err_invalid_signature.store(0, Ordering::Relaxed);
        self.err_too_short.store(0, Ordering::Relaxed);
        self.err_tx_failed.store(0, Ordering::Relaxed);
        self.err_nomem.store(0, Ordering::Relaxed);
        self.poll_timeouts.store(0, Ordering::Relaxed);
        self.lat_count.store(0, Ordering::Relaxed);
        self.lat_sum_ns.store(0, Ordering::Relaxed);
        self.lat_min_ns.store(u64::MAX, Ordering::Relaxed);
        self.lat_max_ns.store(0, Ordering::Relaxed);
        self.last_update_ns.store(0, Ordering::Relaxed);
    }
}

/// Stack-local accumulator for one worker. Plain integers; flushed into
/// the shared [`WorkerStats`] in one burst.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsBatch {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub dropped: u64,

    pub sig_probeot: u64,
    pub sig_dataot: u64,
    pub sig_latency: u64,
    pub sig_rfc2544: u64,
    pub sig_y1564: u64,
    pub sig_unknown: u64,

    pub err_invalid_mac: u64,
    pub err_invalid_ethertype: u64,
    pub err_invalid_protocol: u64,
    pub err_invalid_signature: u64,
    pub err_too_short: u64,
    pub err_tx_failed: u64,
    pub err_nomem: u64,
    pub poll_timeouts: u64,

    pub lat_count: u64,
    pub lat_sum_ns: u64,
    pub lat_min_ns: u64,
    pub lat_max_ns: u64,
}

impl StatsBatch {
    pub fn new() -> Self {
        Self { lat_min_ns: u64::MAX, ..Self::default() }
    }

    #[inline]
    pub fn count_reject(&mut self, reason: RejectReason) {
        self.dropped += 1;
        match reason {
            RejectReason::TooShort => self.err_too_short += 1,
            RejectReason::BadMac => self.err_invalid_mac += 1,
            RejectReason::BadEtherType => self.err_invalid_ethertype += 1,
            RejectReason::BadProtocol => self.err_invalid_protocol += 1,
            RejectReason::BadSignature => self.err_invalid_signature += 1,
        }
    }

    #[inline]
    pub fn count_signature(&mut self, sig: SigType) {
        match sig {
            SigType::Probeot => self.sig_probeot += 1,
            SigType::DataOt => self.sig_dataot += 1,
            SigType::Latency => self.sig_latency += 1,
            SigType::Rfc2544 => self.sig_rfc2544 += 1,
            SigType::Y1564 => self.sig_y1564 += 1,
            SigType::Unknown => self.sig_unknown += 1,
        }
    }

    #[inline]
    pub fn record_latency(&mut self, latency_ns: u64) {
        self.lat_count += 1;
        self.lat_sum_ns += latency_ns;
        self.lat_min_ns = self.lat_min_ns.min(latency_ns);
        self.lat_max_ns = self.lat_max_ns.max(latency_ns);
    }

    /// Merge this batch into the worker's shared stats and clear it.
    pub fn flush(&mut self, target: &WorkerStats, now_ns: u64) {
        let rel = Ordering::Relaxed;
        target.packets_received.fetch_add(self.rx_packets, rel);
        target.bytes_received.fetch_add(self.rx_bytes, rel);
        target.packets_reflected.fetch_add(self.tx_packets, rel);
        target.bytes_reflected.fetch_add(self.tx_bytes, rel);
        target.packets_dropped.fetch_add(self.dropped, rel);

        target.sig_probeot.fetch_add(self.sig_probeot, rel);
        target.sig_dataot.fetch_add(self.sig_dataot, rel);
        target.sig_latency.fetch_add(self.sig_latency, rel);
        target.sig_rfc2544.fetch_add(self.sig_rfc2544, rel);
        target.sig_y1564.fetch_add(self.sig_y1564, rel);
        target.sig_unknown.fetch_add(self.sig_unknown, rel);

        target.err_invalid_mac.fetch_add(self.err_invalid_mac, rel);
        target.err_invalid_ethertype.fetch_add(self.err_invalid_ethertype, rel);
        target.err_invalid_protocol.fetch_add(self.err_invalid_protocol, rel);
        target.err_invalid_signature.fetch_add(self.err_invalid_signature, rel);
        target.err_too_short.fetch_add(self.err_too_short, rel);
        target.err_tx_failed.fetch_add(self.err_tx_failed, rel);
        target.err_nomem.fetch_add(self.err_nomem, rel);
        target.poll_timeouts.fetch_add(self.poll_timeouts, rel);

        if self.lat_count > 0 {
            target.lat_count.fetch_add(self.lat_count, rel);
            target.lat_sum_ns.fetch_add(self.lat_sum_ns, rel);
            target.lat_min_ns.fetch_min(self.lat_min_ns, rel);
            target.lat_max_ns.fetch_max(self.lat_max_ns, rel);
        }
        target.last_update_ns.store(now_ns, rel);

        *self = Self::new();
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: f64,
}

/// Aggregated snapshot across all workers.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    pub packets_received: u64,
    pub packets_reflected: u64,
    pub packets_dropped: u64,
    pub bytes_received: u64,
    pub bytes_reflected: u64,

    pub sig_probeot_count: u64,
    pub sig_dataot_count: u64,
    pub sig_latency_count: u64,
    pub sig_rfc2544_count: u64,
    pub sig_y1564_count: u64,
    pub sig_unknown_count: u64,

    pub err_invalid_mac: u64,
    pub err_invalid_ethertype: u64,
    pub err_invalid_protocol: u64,
    pub err_invalid_signature: u64,
    pub err_too_short: u64,
    pub err_tx_failed: u64,
    pub err_nomem: u64,

    // Legacy rollups retained for external scrapers.
    pub rx_invalid: u64,
    pub rx_nomem: u64,
    pub tx_errors: u64,
    pub poll_timeout: u64,

    pub latency: LatencySummary,

    pub pps: f64,
    pub mbps: f64,
    pub elapsed_secs: f64,
}

impl Stats {
    /// Sum counters across workers. Torn reads across counters are
    /// acceptable: each value lies between the previous and current
    /// flush.
    pub fn aggregate(workers: &[Arc<WorkerStats>], elapsed_secs: f64) -> Stats {
        let rel = Ordering::Relaxed;
        let mut s = Stats { elapsed_secs, ..Stats::default() };
        let mut lat_min = u64::MAX;

        for w in workers {
            s.packets_received += w.packets_received.load(rel);
            s.packets_reflected += w.packets_reflected.load(rel);
            s.packets_dropped += w.packets_dropped.load(rel);
            s.bytes_received += w.bytes_received.load(rel);
            s.bytes_reflected += w.bytes_reflected.load(rel);

            s.sig_probeot_count += w.sig_probeot.load(rel);
            s.sig_dataot_count += w.sig_dataot.load(rel);
            s.sig_latency_count += w.sig_latency.load(rel);
            s.sig_rfc2544_count += w.sig_rfc2544.load(rel);
            s.sig_y1564_count += w.sig_y1564.load(rel);
            s.sig_unknown_count += w.sig_unknown.load(rel);

            s.err_invalid_mac += w.err_invalid_mac.load(rel);
            s.err_invalid_ethertype += w.err_invalid_ethertype.load(rel);
            s.err_invalid_protocol += w.err_invalid_protocol.load(rel);
            s.err_invalid_signature += w.err_invalid_signature.load(rel);
            s.err_too_short += w.err_too_short.load(rel);
            s.err_tx_failed += w.err_tx_failed.load(rel);
            s.err_nomem += w.err_nomem.load(rel);
            s.poll_timeout += w.poll_timeouts.load(rel);

            s.latency.count += w.lat_count.load(rel);
            s.latency.total_ns += w.lat_sum_ns.load(rel);
            lat_min = lat_min.min(w.lat_min_ns.load(rel));
            s.latency.max_ns = s.latency.max_ns.max(w.lat_max_ns.load(rel));
        }

        s.latency.min_ns = if lat_min == u64::MAX { 0 } else { lat_min };
        if s.latency.count > 0 {
            s.latency.avg_ns = s.latency.total_ns as f64 / s.latency.count as f64;
        }

        s.rx_invalid = s.err_invalid_mac
            + s.err_invalid_ethertype
            + s.err_invalid_protocol
            + s.err_invalid_signature
            + s.err_too_short;
        s.rx_nomem = s.err_nomem;
        s.tx_errors = s.err_tx_failed;

        if elapsed_secs > 0.0 {
            s.pps = s.packets_reflected as f64 / elapsed_secs;
            s.mbps = (s.bytes_reflected as f64 * 8.0) / (elapsed_secs * 1_000_000.0);
        }
        s
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "[{:.1}s] RX: {} pkts ({} bytes) | Reflected: {} pkts | {:.0} pps, {:.2} Mbps\n",
            self.elapsed_secs,
            self.packets_received,
            self.bytes_received,
            self.packets_reflected,
            self.pps,
            self.mbps,
        ));
        out.push_str(&format!(
            "  PROBEOT:{} DATA:OT:{} LATENCY:{} RFC2544:{} Y.1564:{} unknown:{}\n",
            self.sig_probeot_count,
            self.sig_dataot_count,
            self.sig_latency_count,
            self.sig_rfc2544_count,
            self.sig_y1564_count,
            self.sig_unknown_count,
        ));
        if self.latency.count > 0 {
            out.push_str(&format!(
                "  Latency: {:.1}/{:.1}/{:.1} us (min/avg/max, {} samples)\n",
                self.latency.min_ns as f64 / 1000.0,
                self.latency.avg_ns / 1000.0,
                self.latency.max_ns as f64 / 1000.0,
                self.latency.count,
            ));
        }
        if self.rx_invalid > 0 || self.tx_errors > 0 {
            out.push_str(&format!(
                "  Errors: mac:{} ethertype:{} proto:{} sig:{} short:{} tx:{}\n",
                self.err_invalid_mac,
                self.err_invalid_ethertype,
                self.err_invalid_protocol,
                self.err_invalid_signature,
                self.err_too_short,
                self.err_tx_failed,
            ));
        }
        out
    }

    pub fn render_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn csv_header() -> &'static str {
        "elapsed_secs,packets_received,bytes_received,packets_reflected,bytes_reflected,\
         packets_dropped,sig_probeot,sig_dataot,sig_latency,sig_rfc2544,sig_y1564,sig_unknown,\
         rx_invalid,rx_nomem,tx_errors,poll_timeout,lat_count,lat_min_ns,lat_avg_ns,lat_max_ns,\
         pps,mbps"
    }

    pub fn render_csv_row(&self) -> String {
        format!(
            "{:.1},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{:.0},{},{:.0},{:.2}",
            self.elapsed_secs,
            self.packets_received,
            self.bytes_received,
            self.packets_reflected,
            self.bytes_reflected,
            self.packets_dropped,
            self.sig_probeot_count,
            self.sig_dataot_count,
            self.sig_latency_count,
            self.sig_rfc2544_count,
            self.sig_y1564_count,
            self.sig_unknown_count,
            self.rx_invalid,
            self.rx_nomem,
            self.tx_errors,
            self.poll_timeout,
            self.latency.count,
            self.latency.min_ns,
            self.latency.avg_ns,
            self.latency.max_ns,
            self.pps,
            self.mbps,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_flush_accumulates() {
        let stats = WorkerStats::new();
        let mut batch = StatsBatch::new();
        batch.rx_packets = 512;
        batch.rx_bytes = 32768;
        batch.tx_packets = 500;
        batch.tx_bytes = 32000;
        batch.count_signature(SigType::Probeot);
        batch.count_reject(RejectReason::BadMac);
        batch.record_latency(1500);
        batch.record_latency(500);
        batch.flush(&stats, 42);

        assert_eq!(stats.packets_received.load(Ordering::Relaxed), 512);
        assert_eq!(stats.sig_probeot.load(Ordering::Relaxed), 1);
        assert_eq!(stats.err_invalid_mac.load(Ordering::Relaxed), 1);
        assert_eq!(stats.packets_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(stats.lat_count.load(Ordering::Relaxed), 2);
        assert_eq!(stats.lat_min_ns.load(Ordering::Relaxed), 500);
        assert_eq!(stats.lat_max_ns.load(Ordering::Relaxed), 1500);
        assert_eq!(stats.last_update_ns.load(Ordering::Relaxed), 42);

        // The batch is cleared and a second flush with no samples keeps
        // the reservoir intact.
        assert_eq!(batch.rx_packets, 0);
        assert_eq!(batch.lat_min_ns, u64::MAX);
        batch.flush(&stats, 43);
        assert_eq!(stats.lat_min_ns.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn aggregate_sums_per_worker_counters() {
        let a = Arc::new(WorkerStats::new());
        let b = Arc::new(WorkerStats::new());
        let mut batch = StatsBatch::new();
        batch.rx_packets = 10;
        batch.tx_packets = 7;
        batch.count_signature(SigType::Rfc2544);
        batch.record_latency(100);
        batch.flush(&a, 1);

        let mut batch = StatsBatch::new();
        batch.rx_packets = 5;
        batch.tx_packets = 5;
        batch.err_tx_failed = 2;
        batch.record_latency(900);
        batch.flush(&b, 1);

        let s = Stats::aggregate(&[a, b], 2.0);
        assert_eq!(s.packets_received, 15);
        assert_eq!(s.packets_reflected, 12);
        assert_eq!(s.sig_rfc2544_count, 1);
        assert_eq!(s.tx_errors, 2);
        assert_eq!(s.latency.count, 2);
        assert_eq!(s.latency.min_ns, 100);
        assert_eq!(s.latency.max_ns, 900);
        assert!((s.latency.avg_ns - 500.0).abs() < f64::EPSILON);
        assert!((s.pps - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_latency_reservoir_reports_zero_min() {
        let a = Arc::new(WorkerStats::new());
        let s = Stats::aggregate(&[a], 1.0);
        assert_eq!(s.latency.min_ns, 0);
        assert_eq!(s.latency.count, 0);
    }

    #[test]
    fn legacy_rollups_cover_structured_counters() {
        let a = Arc::new(WorkerStats::new());
        let mut batch = StatsBatch::new();
        batch.count_reject(RejectReason::TooShort);
        batch.count_reject(RejectReason::BadEtherType);
        batch.count_reject(RejectReason::BadSignature);
        batch.flush(&a, 1);
        let s = Stats::aggregate(&[a], 1.0);
        assert_eq!(s.rx_invalid, 3);
        assert_eq!(s.packets_dropped, 3);
    }

    #[test]
    fn csv_row_matches_header_arity() {
        let s = Stats::default();
        let cols = Stats::csv_header().split(',').count();
        assert_eq!(s.render_csv_row().split(',').count(), cols);
    }

    #[test]
    fn json_snapshot_has_legacy_fields() {
        let s = Stats::default();
        let json = s.render_json();
        for key in ["rx_invalid", "rx_nomem", "tx_errors", "poll_timeout", "latency"] {
            assert!(json.contains(key), "missing {key}");
        }
    }
}
