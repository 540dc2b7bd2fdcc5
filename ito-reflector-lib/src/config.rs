use std::path::PathBuf;

use serde::Serialize;

/// Upper bound on worker threads regardless of RX queue count.
pub const MAX_WORKERS: usize = 16;
/// Largest batch a worker passes through the backend per iteration.
pub const MAX_BATCH: usize = 64;
/// Flush the worker-local stats batch every this many receive iterations.
pub const STATS_FLUSH_BATCHES: u32 = 8;

pub const DEFAULT_FRAME_SIZE: u32 = 4096;
pub const DEFAULT_NUM_FRAMES: u32 = 4096;
/// Standard destination UDP port of ITO test traffic.
pub const DEFAULT_ITO_PORT: u16 = 3842;
/// Vendor OUI expected in the source MAC of test probes.
pub const DEFAULT_OUI: [u8; 3] = [0x00, 0xc0, 0x17];
pub const DEFAULT_POLL_TIMEOUT_MS: u32 = 100;
pub const DEFAULT_STATS_INTERVAL_SECS: u32 = 10;

/// Which header layers participate in the source/destination swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReflectMode {
    /// Swap MAC addresses only.
    Mac,
    /// Swap MAC and IP addresses.
    MacIp,
    /// Swap MAC, IP addresses and UDP ports.
    #[default]
    All,
}

/// Which signature families the classifier accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SigFilter {
    /// Any of the five known signatures.
    #[default]
    All,
    /// PROBEOT, DATA:OT, LATENCY.
    Ito,
    Rfc2544,
    Y1564,
    /// RFC2544 and Y.1564.
    Custom,
}

/// Platform backend selection. `Auto` prefers the kernel-bypass backend
/// and falls back to the mmap ring backend if its init fails; BSD
/// systems always use the bpf device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Auto,
    XdpBypass,
    PacketRing,
    BpfDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsFormat {
    #[default]
    Text,
    Json,
    Csv,
}

/// Reflector configuration. Built once before start and shared
/// read-only by every worker; [`crate::Reflector::set_config`] rejects
/// changes while workers are running.
#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Interface name, e.g. `eth0`.
    pub ifname: String,
    /// Interface index, resolved by the supervisor.
    pub ifindex: i32,
    /// Local MAC; frames must address it to be reflected.
    pub mac: [u8; 6],
    /// Worker thread count; 0 derives it from the RX queue count.
    pub num_workers: usize,
    pub batch_size: usize,
    /// UMEM frame size (kernel-bypass backend).
    pub frame_size: u32,
    /// UMEM frame count (kernel-bypass backend).
    pub num_frames: u32,
    /// Required UDP destination port; 0 accepts any port.
    pub ito_port: u16,
    /// Whether the source-MAC OUI check is enforced.
    pub filter_oui: bool,
    pub oui: [u8; 3],
    pub reflect_mode: ReflectMode,
    pub sig_filter: SigFilter,
    pub enable_ipv6: bool,
    pub enable_vlan: bool,
    /// Recompute IP/UDP checksums in software after the swap.
    pub software_checksum: bool,
    pub use_huge_pages: bool,
    /// Spin instead of sleeping when the RX path is empty.
    pub busy_poll: bool,
    /// Record receive timestamps and the latency reservoir.
    pub measure_latency: bool,
    pub promiscuous: bool,
    pub poll_timeout_ms: u32,
    /// Explicit CPU pin for worker 0 (workers i pin to cpu + i); -1
    /// selects the per-queue heuristic.
    pub cpu: i32,
    pub backend: BackendKind,
    /// Compiled XDP filter object for the kernel-bypass backend.
    pub xdp_object_path: PathBuf,
    pub stats_format: StatsFormat,
    pub stats_interval_secs: u32,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            ifname: String::new(),
            ifindex: -1,
            mac: [0; 6],
            num_workers: 0,
            batch_size: MAX_BATCH,
            frame_size: DEFAULT_FRAME_SIZE,
            num_frames: DEFAULT_NUM_FRAMES,
            ito_port: DEFAULT_ITO_PORT,
            filter_oui: true,
            oui: DEFAULT_OUI,
            reflect_mode: ReflectMode::default(),
            sig_filter: SigFilter::default(),
            enable_ipv6: true,
            enable_vlan: true,
            software_checksum: false,
            use_huge_pages: false,
            busy_poll: false,
            measure_latency: false,
            promiscuous: false,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            cpu: -1,
            backend: BackendKind::default(),
            xdp_object_path: PathBuf::from("ito-reflector-xdp.o"),
            stats_format: StatsFormat::default(),
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
        }
    }
}

impl ReflectorConfig {
    pub fn for_interface(ifname: &str) -> Self {
        Self { ifname: ifname.to_string(), ..Self::default() }
    }
}
