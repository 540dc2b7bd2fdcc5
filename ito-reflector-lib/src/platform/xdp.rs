//! Kernel-bypass poll-mode backend over AF_XDP.
//!
//! A UMEM region of `num_frames * frame_size` bytes is registered with
//! the kernel and bound to one NIC queue through four rings: FILL
//! (available RX buffers), RX (populated frames), TX (frames to send)
//! and COMPLETION (transmitted frames ready to recycle). Buffer
//! ownership moves strictly through those rings: a rejected RX buffer
//! goes straight back to FILL, a transmitted buffer is in flight until
//! it shows up in COMPLETION.

use std::ffi::CString;
use std::num::NonZeroU32;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use xdpilone::{DeviceQueue, IfInfo, RingRx, RingTx, Socket, SocketConfig, Umem, UmemConfig, User};

use crate::config::{ReflectorConfig, MAX_BATCH};
use crate::error::{ReflectorError, Result};
use crate::nic;
use crate::platform::filter::XdpFilter;
use crate::platform::{FrameDesc, Platform};

/// Anonymous mapping backing the UMEM, huge-page backed when requested.
struct UmemArea {
    ptr: *mut u8,
    len: usize,
}

impl UmemArea {
    fn map(len: usize, use_huge_pages: bool) -> Result<UmemArea> {
        let base_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let mut ptr = libc::MAP_FAILED;
        if use_huge_pages {
            ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    base_flags | libc::MAP_HUGETLB,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                warn!("huge pages requested but unavailable, falling back to normal pages");
            }
        }
        if ptr == libc::MAP_FAILED {
            ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    base_flags,
                    -1,
                    0,
                )
            };
        }
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(UmemArea { ptr: ptr as *mut u8, len })
    }
}

impl Drop for UmemArea {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
    }
}

pub struct XdpBackend {
    rx: RingRx,
    tx: RingTx,
    device: DeviceQueue,
    user: User,
    _socket: Socket,
    umem: Umem,
    // Dropped last: the rings above reference this mapping.
    area: UmemArea,

    frame_size: u32,
    outstanding_tx: u32,
    measure_latency: bool,
    busy_poll: bool,
    poll_timeout_ms: i32,
    filter: Option<Arc<Mutex<XdpFilter>>>,
}

// Ring and UMEM handles are confined to the owning worker.
unsafe impl Send for XdpBackend {}

impl XdpBackend {
    /// Bind one AF_XDP socket to `queue_id`. The first worker passes
    /// the shared filter handle created by the supervisor; every worker
    /// registers its socket in the redirect map.
    pub fn new(
        config: &ReflectorConfig,
        queue_id: u32,
        filter: Option<Arc<Mutex<XdpFilter>>>,
    ) -> Result<XdpBackend> {
        let frame_size = config.frame_size;
        let num_frames = config.num_frames;
        let umem_len = frame_size as usize * num_frames as usize;

        let area = UmemArea::map(umem_len, config.use_huge_pages)?;
        let region = NonNull::new(std::ptr::slice_from_raw_parts_mut(area.ptr, area.len))
            .ok_or_else(|| init_err(config, "UMEM region is null"))?;

        let umem_config = UmemConfig {
            fill_size: num_frames / 2,
            complete_size: num_frames / 2,
            frame_size,
            headroom: 0,
            flags: 0,
        };
        // Safety: the mapping is page-aligned and lives in `area`,
        // which outlives every ring handle in this struct.
        let umem = unsafe { Umem::new(umem_config, region) }
            .map_err(|e| init_err(config, &format!("UMEM create: {e:?}")))?;

        let name = CString::new(config.ifname.as_str())
            .map_err(|_| ReflectorError::InterfaceNotFound(config.ifname.clone()))?;
        let mut info = IfInfo::invalid();
        info.from_name(&name)
            .map_err(|e| init_err(config, &format!("interface lookup: {e:?}")))?;
        info.set_queue(queue_id);

        let socket = Socket::with_shared(&info, &umem)
            .map_err(|e| init_err(config, &format!("socket create: {e:?}")))?;
        let device = umem
            .fq_cq(&socket)
            .map_err(|e| init_err(config, &format!("fill/completion rings: {e:?}")))?;

        let ring_size = NonZeroU32::new(num_frames / 2);
        let socket_config = SocketConfig {
            rx_size: ring_size,
            tx_size: ring_size,
            bind_flags: 0,
        };
        let user = umem
            .rx_tx(&socket, &socket_config)
            .map_err(|e| init_err(config, &format!("RX/TX rings: {e:?}")))?;

        umem.bind(&user)
            .map_err(|e| init_err(config, &format!("bind to queue {queue_id}: {e:?}")))?;

        let rx = user
            .map_rx()
            .map_err(|e| init_err(config, &format!("map RX ring: {e:?}")))?;
        let tx = user
            .map_tx()
            .map_err(|e| init_err(config, &format!("map TX ring: {e:?}")))?;

        if let Some(filter) = &filter {
            let mut guard = filter.lock().map_err(|_| init_err(config, "filter lock poisoned"))?;
            guard.register_socket(queue_id, user.as_raw_fd())?;
        }

        let mut backend = XdpBackend {
            rx,
            tx,
            device,
            user,
            _socket: socket,
            umem,
            area,
            frame_size,
            outstanding_tx: 0,
            measure_latency: config.measure_latency,
            busy_poll: config.busy_poll,
            poll_timeout_ms: config.poll_timeout_ms as i32,
            filter,
        };

        // Half of all frames start on the FILL ring; the rest are TX
        // headroom.
        backend.post_fill_frames(num_frames / 2);

        info!(
            queue = queue_id,
            umem_mb = umem_len / (1024 * 1024),
            frames = num_frames,
            frame_size,
            filtered = backend.filter.is_some(),
            "AF_XDP backend ready"
        );
        Ok(backend)
    }

    fn post_fill_frames(&mut self, count: u32) {
        let mut writer = self.device.fill(count);
        writer.insert((0..count).map(|i| u64::from(i) * u64::from(self.frame_size)));
        writer.commit();
    }

    /// Drain COMPLETION and recycle the finished frames into FILL.
    fn recycle_completed_tx(&mut self) -> u32 {
        let mut addrs = [0u64; MAX_BATCH];
        let mut drained = 0usize;
        {
            let mut reader = self.device.complete(MAX_BATCH as u32);
            while let Some(addr) = reader.read() {
                addrs[drained] = addr;
                drained += 1;
            }
            reader.release();
        }
        if drained > 0 {
            let mut writer = self.device.fill(drained as u32);
            writer.insert(addrs[..drained].iter().copied());
            writer.commit();
            self.outstanding_tx = self.outstanding_tx.saturating_sub(drained as u32);
        }
        drained as u32
    }

    fn wait_readable(&self) {
        let mut pfd = libc::pollfd {
            fd: self.user.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pfd, 1, self.poll_timeout_ms) };
    }
}

fn init_err(config: &ReflectorConfig, reason: &str) -> ReflectorError {
    ReflectorError::BackendInit {
        backend: "AF_XDP",
        interface: config.ifname.clone(),
        reason: reason.to_string(),
    }
}

impl Platform for XdpBackend {
    fn recv_batch(&mut self, out: &mut [FrameDesc]) -> usize {
        let mut n = 0;
        {
            let mut reader = self.rx.receive(out.len() as u32);
            while n < out.len() {
                let Some(desc) = reader.read() else {
                    break;
                };
                let data = unsafe { self.area.ptr.add(desc.addr as usize) };
                out[n] = FrameDesc::from_raw(data, desc.len, desc.addr);
                if self.measure_latency {
                    out[n].timestamp_ns = nic::monotonic_ns();
                }
                n += 1;
            }
            reader.release();
        }
        if n == 0 && !self.busy_poll {
            self.wait_readable();
        }
        n
    }

    fn send_batch(&mut self, pkts: &[FrameDesc]) -> usize {
        if pkts.is_empty() {
            return 0;
        }
        // Recycle eagerly so a full TX ring cannot exhaust the UMEM.
        self.recycle_completed_tx();

        let sent;
        {
            let mut writer = self.tx.transmit(pkts.len() as u32);
            sent = writer.insert(pkts.iter().map(|p| xdpilone::xdp::XdpDesc {
                addr: p.token,
                len: p.len() as u32,
                options: 0,
            }));
            writer.commit();
        }
        if sent > 0 {
            self.outstanding_tx += sent;
            // One kernel kick per non-empty batch.
            self.tx.wake();
        } else {
            debug!("TX ring full, batch dropped for recycling");
            self.recycle_completed_tx();
        }
        sent as usize
    }

    fn release_rejected(&mut self, pkt: &FrameDesc) {
        // Never transmitted: the frame address can return to FILL
        // immediately.
        let mut writer = self.device.fill(1);
        writer.insert_once(pkt.token);
        writer.commit();
    }

    fn release_sent(&mut self, _pkts: &[FrameDesc]) {
        // The buffers are in flight; COMPLETION polling is the only
        // legal way back to FILL.
        self.recycle_completed_tx();
    }

    fn name(&self) -> &'static str {
        "AF_XDP"
    }
}
