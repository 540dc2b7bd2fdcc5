//! Platform I/O backends: batched RX/TX over one NIC queue.
//!
//! Three implementations with different zero-copy and buffer-ownership
//! rules: the AF_XDP kernel-bypass backend, the AF_PACKET mmap ring
//! backend (both Linux), and the BSD bpf device backend.

pub mod cbpf;

#[cfg(target_os = "linux")]
pub mod filter;
#[cfg(target_os = "linux")]
pub mod ring;
#[cfg(target_os = "linux")]
pub mod xdp;

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub mod bpf;

/// Descriptor of one received frame.
///
/// The pointed-to bytes stay valid and exclusively owned by the worker
/// that received the descriptor until it is handed to
/// [`Platform::send_batch`], [`Platform::release_rejected`] or
/// [`Platform::release_sent`]; the descriptor must not be dereferenced
/// afterwards.
#[derive(Debug, Clone, Copy)]
pub struct FrameDesc {
    data: *mut u8,
    len: u32,
    /// Backend-private cookie: a UMEM frame address, a ring slot or
    /// block index, or nothing. Cross-backend code only passes it back.
    pub token: u64,
    /// Receive timestamp; 0 unless latency measurement is enabled.
    pub timestamp_ns: u64,
}

impl Default for FrameDesc {
    fn default() -> Self {
        Self { data: std::ptr::null_mut(), len: 0, token: 0, timestamp_ns: 0 }
    }
}

// The raw pointer tracks a buffer owned by exactly one worker at a
// time; descriptors move between threads only together with their
// backend.
unsafe impl Send for FrameDesc {}

impl FrameDesc {
    pub fn from_raw(data: *mut u8, len: u32, token: u64) -> Self {
        Self { data, len, token, timestamp_ns: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn data_ptr(&self) -> *const u8 {
        self.data
    }

    /// The frame bytes. Valid only while the descriptor is owned (see
    /// the type-level ownership rule).
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len as usize) }
    }

    /// Mutable frame bytes, for in-place reflection.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len as usize) }
    }
}

/// Batched RX/TX/release over one RX queue.
///
/// Contracts shared by every implementation:
///
/// - `recv_batch` has a bounded wait (the configured poll timeout); a
///   zero return is cheap and holds no resources. System errors are
///   logged and reported as 0.
/// - Every descriptor returned by `recv_batch` must subsequently be
///   passed to exactly one of `send_batch` (within the sent count),
///   `release_rejected`, or `release_sent`. Anything else leaks or
///   double-frees a buffer.
/// - `send_batch` returns how many descriptors were actually queued for
///   transmit; the unsent tail remains the caller's responsibility
///   (release each via `release_rejected`).
/// - `release_rejected` takes a single RX buffer that was never
///   transmitted; `release_sent` takes the successfully-sent prefix of
///   a TX batch, whose buffers are recycled once the kernel completes
///   them.
///
/// Cleanup happens on drop and is idempotent.
pub trait Platform: Send {
    fn recv_batch(&mut self, out: &mut [FrameDesc]) -> usize;
    fn send_batch(&mut self, pkts: &[FrameDesc]) -> usize;
    fn release_rejected(&mut self, pkt: &FrameDesc);
    fn release_sent(&mut self, pkts: &[FrameDesc]);
    fn name(&self) -> &'static str;
}
