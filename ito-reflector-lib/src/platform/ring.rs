//! Memory-mapped AF_PACKET ring backend.
//!
//! The fallback for NICs without AF_XDP support. RX uses PACKET_MMAP
//! with TPACKET_V3 block-level batching where the kernel supports it,
//! TPACKET_V2 frame-level slots otherwise; the chosen variant drives
//! the iteration shape in `recv_batch`. TX prefers a mapped TX ring
//! with one kick per batch and degrades to copying `send()` calls.

use std::io;
use std::mem;
use std::ptr;

use tracing::{debug, info, warn};

use crate::config::ReflectorConfig;
use crate::error::{ReflectorError, Result};
use crate::nic;
use crate::platform::cbpf;
use crate::platform::{FrameDesc, Platform};

// Ring geometry, tuned for 2048-byte frames in 256 KiB blocks.
const RING_FRAME_SIZE: u32 = 2048;
const RING_FRAMES: u32 = 4096;
const FRAMES_PER_BLOCK: u32 = 128;
const RING_BLOCK_SIZE: u32 = RING_FRAME_SIZE * FRAMES_PER_BLOCK;
const RING_BLOCKS: u32 = RING_FRAMES / FRAMES_PER_BLOCK;
const TX_RING_FRAMES: u32 = RING_FRAMES / 2;
const TX_RING_BLOCKS: u32 = RING_BLOCKS / 2;
/// Kernel retires a partially filled block after this many ms.
const RETIRE_BLOCK_TOV_MS: u32 = 10;

const SOCKET_BUF_BYTES: libc::c_int = 4 * 1024 * 1024;
const BUSY_POLL_USECS: libc::c_int = 50;

// Kernel ABI constants not exported by libc.
const TPACKET_V2: libc::c_int = 1;
const TPACKET_V3: libc::c_int = 2;
const PACKET_RX_RING: libc::c_int = 5;
const PACKET_VERSION: libc::c_int = 10;
const PACKET_TX_RING: libc::c_int = 13;
const PACKET_FANOUT: libc::c_int = 18;
const PACKET_QDISC_BYPASS: libc::c_int = 20;
const PACKET_FANOUT_HASH: u32 = 0;

const TP_STATUS_KERNEL: u32 = 0;
const TP_STATUS_USER: u32 = 1;
const TP_STATUS_AVAILABLE: u32 = 0;
const TP_STATUS_SEND_REQUEST: u32 = 1;

const TPACKET_ALIGNMENT: usize = 16;

const fn tpacket_align(len: usize) -> usize {
    (len + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// Tracks the TPACKET_V3 block currently being consumed plus which
/// blocks were fully read (`consumed`) and already handed back
/// (`returned`). The bitmaps guard against double-release when both
/// the reject path and the post-TX path touch descriptors of the same
/// block.
struct BlockRing {
    block_size: u32,
    block_nr: u32,
    cur_block: u32,
    in_block: bool,
    next_pkt: *mut u8,
    pkts_left: u32,
    consumed: [u64; 4],
    returned: [u64; 4],
}

struct FrameRing {
    frame_size: u32,
    frame_nr: u32,
    cursor: u32,
}

enum RxVariant {
    Block(BlockRing),
    Frame(FrameRing),
}

enum TxMode {
    Ring {
        ring: *mut u8,
        frame_size: u32,
        frame_nr: u32,
        cursor: u32,
        data_off: usize,
        v3: bool,
    },
    CopySend,
}

pub struct RingBackend {
    fd: libc::c_int,
    map: *mut u8,
    map_len: usize,
    rx_ring: *mut u8,
    variant: RxVariant,
    tx: TxMode,
    measure_latency: bool,
    busy_poll: bool,
    poll_timeout_ms: i32,
}

unsafe impl Send for RingBackend {}

#[inline]
fn set_bit(bm: &mut [u64; 4], i: u32) {
    bm[(i / 64) as usize] |= 1 << (i % 64);
}

#[inline]
fn clear_bit(bm: &mut [u64; 4], i: u32) {
    bm[(i / 64) as usize] &= !(1 << (i % 64));
}

#[inline]
fn test_bit(bm: &[u64; 4], i: u32) -> bool {
    bm[(i / 64) as usize] & (1 << (i % 64)) != 0
}

fn setsockopt_int(fd: libc::c_int, level: libc::c_int, opt: libc::c_int, val: libc::c_int) -> bool {
    unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) == 0
    }
}

impl RingBackend {
    pub fn new(config: &ReflectorConfig, num_workers: usize) -> Result<RingBackend> {
        let err = |reason: String| ReflectorError::BackendInit {
            backend: "AF_PACKET ring",
            interface: config.ifname.clone(),
            reason,
        };
        let os_err = |what: &str| {
            let e = io::Error::last_os_error();
            err(format!("{what}: {e}"))
        };

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                i32::from((libc::ETH_P_ALL as u16).to_be()),
            )
        };
        if fd < 0 {
            return Err(os_err("socket"));
        }
        let guard = FdGuard(fd);

        // Block-level batching first, frame-level slots as fallback.
        let v3 = setsockopt_int(fd, libc::SOL_PACKET, PACKET_VERSION, TPACKET_V3);
        if !v3 {
            warn!("TPACKET_V3 unavailable, falling back to TPACKET_V2");
            if !setsockopt_int(fd, libc::SOL_PACKET, PACKET_VERSION, TPACKET_V2) {
                return Err(os_err("PACKET_VERSION"));
            }
        }

        let rx_len;
        if v3 {
            let req = libc::tpacket_req3 {
                tp_block_size: RING_BLOCK_SIZE,
                tp_block_nr: RING_BLOCKS,
                tp_frame_size: RING_FRAME_SIZE,
                tp_frame_nr: RING_FRAMES,
                tp_retire_blk_tov: RETIRE_BLOCK_TOV_MS,
                tp_sizeof_priv: 0,
                tp_feature_req_word: 0,
            };
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_PACKET,
                    PACKET_RX_RING,
                    &req as *const _ as *const libc::c_void,
                    mem::size_of::<libc::tpacket_req3>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(os_err("PACKET_RX_RING (v3)"));
            }
            rx_len = RING_BLOCK_SIZE as usize * RING_BLOCKS as usize;
        } else {
            let req = libc::tpacket_req {
                tp_block_size: RING_BLOCK_SIZE,
                tp_block_nr: RING_BLOCKS,
                tp_frame_size: RING_FRAME_SIZE,
                tp_frame_nr: RING_FRAMES,
            };
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_PACKET,
                    PACKET_RX_RING,
                    &req as *const _ as *const libc::c_void,
                    mem::size_of::<libc::tpacket_req>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(os_err("PACKET_RX_RING (v2)"));
            }
            rx_len = RING_BLOCK_SIZE as usize * RING_BLOCKS as usize;
        }

        // The TX ring is optional; send() remains as the slow path.
        let tx_req = libc::tpacket_req {
            tp_block_size: RING_BLOCK_SIZE,
            tp_block_nr: TX_RING_BLOCKS,
            tp_frame_size: RING_FRAME_SIZE,
            tp_frame_nr: TX_RING_FRAMES,
        };
        let tx_rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                PACKET_TX_RING,
                &tx_req as *const _ as *const libc::c_void,
                mem::size_of::<libc::tpacket_req>() as libc::socklen_t,
            )
        };
        let has_tx_ring = tx_rc == 0;
        if !has_tx_ring {
            warn!("PACKET_TX_RING unavailable, transmitting with send()");
        }

        let tx_len = if has_tx_ring {
            RING_BLOCK_SIZE as usize * TX_RING_BLOCKS as usize
        } else {
            0
        };
        let map_len = rx_len + tx_len;
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_LOCKED | libc::MAP_POPULATE,
                fd,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(os_err("mmap rings"));
        }
        let map = map as *mut u8;

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = config.ifindex;
        let rc = unsafe {
            libc::bind(
                fd,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            unsafe { libc::munmap(map as *mut libc::c_void, map_len) };
            return Err(os_err("bind"));
        }

        if !setsockopt_int(fd, libc::SOL_PACKET, PACKET_QDISC_BYPASS, 1) {
            debug!("PACKET_QDISC_BYPASS not supported");
        }

        if num_workers > 1 {
            let fanout =
                (unsafe { libc::getpid() } as u32 & 0xffff) | (PACKET_FANOUT_HASH << 16);
            if !setsockopt_int(fd, libc::SOL_PACKET, PACKET_FANOUT, fanout as libc::c_int) {
                warn!("PACKET_FANOUT failed; multi-worker RX will not scale");
            }
        }

        if config.busy_poll
            && !setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_BUSY_POLL, BUSY_POLL_USECS)
        {
            debug!("SO_BUSY_POLL not supported");
        }
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, SOCKET_BUF_BYTES);
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, SOCKET_BUF_BYTES);

        // Keep non-test traffic out of the ring: same MAC/EtherType/UDP
        // checks the classifier starts with.
        let insns = cbpf::udp_to_local_mac(&config.mac);
        let prog = libc::sock_fprog {
            len: insns.len() as libc::c_ushort,
            filter: insns.as_ptr() as *mut libc::sock_filter,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &prog as *const _ as *const libc::c_void,
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            debug!("SO_ATTACH_FILTER failed; filtering in userspace only");
        }

        let variant = if v3 {
            RxVariant::Block(BlockRing {
                block_size: RING_BLOCK_SIZE,
                block_nr: RING_BLOCKS,
                cur_block: 0,
                in_block: false,
                next_pkt: ptr::null_mut(),
                pkts_left: 0,
                consumed: [0; 4],
                returned: [0; 4],
            })
        } else {
            RxVariant::Frame(FrameRing {
                frame_size: RING_FRAME_SIZE,
                frame_nr: RING_FRAMES,
                cursor: 0,
            })
        };

        let tx = if has_tx_ring {
            let hdr_len = if v3 {
                mem::size_of::<libc::tpacket3_hdr>()
            } else {
                mem::size_of::<libc::tpacket2_hdr>()
            };
            TxMode::Ring {
                ring: unsafe { map.add(rx_len) },
                frame_size: RING_FRAME_SIZE,
                frame_nr: TX_RING_FRAMES,
                cursor: 0,
                data_off: tpacket_align(hdr_len),
                v3,
            }
        } else {
            TxMode::CopySend
        };

        info!(
            interface = %config.ifname,
            version = if v3 { "TPACKET_V3" } else { "TPACKET_V2" },
            rx_mb = rx_len / (1024 * 1024),
            tx_ring = has_tx_ring,
            "AF_PACKET ring backend ready"
        );

        mem::forget(guard);
        Ok(RingBackend {
            fd,
            map,
            map_len,
            rx_ring: map,
            variant,
            tx,
            measure_latency: config.measure_latency,
            busy_poll: config.busy_poll,
            poll_timeout_ms: config.poll_timeout_ms as i32,
        })
    }

    fn wait_readable(&self) {
        let mut pfd = libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 };
        unsafe { libc::poll(&mut pfd, 1, self.poll_timeout_ms) };
    }
}

struct FdGuard(libc::c_int);

impl Drop for FdGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Walk the current TPACKET_V3 block. A block is marked `consumed`
/// once its last packet has been handed out; it returns to the kernel
/// on the first release after that point.
fn recv_block(
    base: *mut u8,
    st: &mut BlockRing,
    measure_latency: bool,
    out: &mut [FrameDesc],
) -> usize {
    let mut n = 0;
    while n < out.len() {
        if !st.in_block {
            let bd = unsafe { base.add((st.cur_block * st.block_size) as usize) }
                as *mut libc::tpacket_block_desc;
            let status =
                unsafe { ptr::read_volatile(ptr::addr_of!((*bd).hdr.bh1.block_status)) };
            if status & TP_STATUS_USER == 0 {
                break;
            }
            clear_bit(&mut st.consumed, st.cur_block);
            clear_bit(&mut st.returned, st.cur_block);
            let num_pkts = unsafe { ptr::read_volatile(ptr::addr_of!((*bd).hdr.bh1.num_pkts)) };
            if num_pkts == 0 {
                // Timeout-retired empty block: hand it straight back.
                unsafe {
                    ptr::write_volatile(
                        ptr::addr_of_mut!((*bd).hdr.bh1.block_status),
                        TP_STATUS_KERNEL,
                    );
                }
                st.cur_block = (st.cur_block + 1) % st.block_nr;
                continue;
            }
            let first = unsafe { (*bd).hdr.bh1.offset_to_first_pkt };
            st.next_pkt = unsafe { (bd as *mut u8).add(first as usize) };
            st.pkts_left = num_pkts;
            st.in_block = true;
        }

        let hdr = st.next_pkt as *const libc::tpacket3_hdr;
        let (tp_mac, tp_snaplen, tp_next) = unsafe {
            ((*hdr).tp_mac, (*hdr).tp_snaplen, (*hdr).tp_next_offset)
        };
        out[n] = FrameDesc::from_raw(
            unsafe { st.next_pkt.add(tp_mac as usize) },
            tp_snaplen,
            u64::from(st.cur_block),
        );
        if measure_latency {
            out[n].timestamp_ns = nic::monotonic_ns();
        }
        n += 1;

        st.pkts_left -= 1;
        if st.pkts_left == 0 {
            set_bit(&mut st.consumed, st.cur_block);
            st.in_block = false;
            st.cur_block = (st.cur_block + 1) % st.block_nr;
        } else {
            st.next_pkt = unsafe { st.next_pkt.add(tp_next as usize) };
        }
    }
    n
}

fn release_block(base: *mut u8, st: &mut BlockRing, block: u32) {
    if !test_bit(&st.consumed, block) || test_bit(&st.returned, block) {
        return;
    }
    set_bit(&mut st.returned, block);
    let bd =
        unsafe { base.add((block * st.block_size) as usize) } as *mut libc::tpacket_block_desc;
    unsafe {
        ptr::write_volatile(ptr::addr_of_mut!((*bd).hdr.bh1.block_status), TP_STATUS_KERNEL);
    }
}

fn recv_frame(
    base: *mut u8,
    st: &mut FrameRing,
    measure_latency: bool,
    out: &mut [FrameDesc],
) -> usize {
    let mut n = 0;
    while n < out.len() {
        let slot = unsafe { base.add((st.cursor * st.frame_size) as usize) };
        let hdr = slot as *mut libc::tpacket2_hdr;
        let status = unsafe { ptr::read_volatile(ptr::addr_of!((*hdr).tp_status)) };
        if status & TP_STATUS_USER == 0 {
            break;
        }
        let (tp_mac, tp_snaplen) = unsafe { ((*hdr).tp_mac, (*hdr).tp_snaplen) };
        out[n] = FrameDesc::from_raw(
            unsafe { slot.add(tp_mac as usize) },
            tp_snaplen,
            u64::from(st.cursor),
        );
        if measure_latency {
            out[n].timestamp_ns = nic::monotonic_ns();
        }
        n += 1;
        // Wraps past the configured frame count by resetting to 0.
        st.cursor = (st.cursor + 1) % st.frame_nr;
    }
    n
}

fn release_frame(base: *mut u8, st: &FrameRing, frame: u32) {
    if frame >= st.frame_nr {
        return;
    }
    let hdr = unsafe { base.add((frame * st.frame_size) as usize) } as *mut libc::tpacket2_hdr;
    unsafe { ptr::write_volatile(ptr::addr_of_mut!((*hdr).tp_status), TP_STATUS_KERNEL) };
}

impl Platform for RingBackend {
    fn recv_batch(&mut self, out: &mut [FrameDesc]) -> usize {
        for attempt in 0..2 {
            let n = match &mut self.variant {
                RxVariant::Block(st) => recv_block(self.rx_ring, st, self.measure_latency, out),
                RxVariant::Frame(st) => recv_frame(self.rx_ring, st, self.measure_latency, out),
            };
            if n > 0 || attempt == 1 || self.busy_poll {
                return n;
            }
            self.wait_readable();
        }
        0
    }

    fn send_batch(&mut self, pkts: &[FrameDesc]) -> usize {
        if pkts.is_empty() {
            return 0;
        }
        let fd = self.fd;
        match &mut self.tx {
            TxMode::Ring { ring, frame_size, frame_nr, cursor, data_off, v3 } => {
                let mut sent = 0;
                for pkt in pkts {
                    if *data_off + pkt.len() > *frame_size as usize {
                        break;
                    }
                    let slot = unsafe { ring.add((*cursor * *frame_size) as usize) };
                    if *v3 {
                        let hdr = slot as *mut libc::tpacket3_hdr;
                        let status = unsafe { ptr::read_volatile(ptr::addr_of!((*hdr).tp_status)) };
                        if status != TP_STATUS_AVAILABLE {
                            break;
                        }
                        unsafe {
                            ptr::copy_nonoverlapping(
                                pkt.data_ptr(),
                                slot.add(*data_off),
                                pkt.len(),
                            );
                            (*hdr).tp_len = pkt.len() as u32;
                            (*hdr).tp_snaplen = pkt.len() as u32;
                            ptr::write_volatile(
                                ptr::addr_of_mut!((*hdr).tp_status),
                                TP_STATUS_SEND_REQUEST,
                            );
                        }
                    } else {
                        let hdr = slot as *mut libc::tpacket2_hdr;
                        let status = unsafe { ptr::read_volatile(ptr::addr_of!((*hdr).tp_status)) };
                        if status != TP_STATUS_AVAILABLE {
                            break;
                        }
                        unsafe {
                            ptr::copy_nonoverlapping(
                                pkt.data_ptr(),
                                slot.add(*data_off),
                                pkt.len(),
                            );
                            (*hdr).tp_len = pkt.len() as u32;
                            (*hdr).tp_snaplen = pkt.len() as u32;
                            ptr::write_volatile(
                                ptr::addr_of_mut!((*hdr).tp_status),
                                TP_STATUS_SEND_REQUEST,
                            );
                        }
                    }
                    sent += 1;
                    *cursor = (*cursor + 1) % *frame_nr;
                }
                if sent > 0 {
                    // One kernel kick per batch.
                    unsafe { libc::send(fd, ptr::null(), 0, libc::MSG_DONTWAIT) };
                }
                sent
            }
            TxMode::CopySend => {
                let mut sent = 0;
                for pkt in pkts {
                    let rc = unsafe {
                        libc::send(fd, pkt.data_ptr() as *const libc::c_void, pkt.len(), 0)
                    };
                    if rc < 0 {
                        break;
                    }
                    sent += 1;
                }
                sent
            }
        }
    }

    fn release_rejected(&mut self, pkt: &FrameDesc) {
        match &mut self.variant {
            RxVariant::Block(st) => release_block(self.rx_ring, st, pkt.token as u32),
            RxVariant::Frame(st) => release_frame(self.rx_ring, st, pkt.token as u32),
        }
    }

    fn release_sent(&mut self, pkts: &[FrameDesc]) {
        // TX copied the bytes out already; this only returns the RX
        // resources the descriptors still pin.
        for pkt in pkts {
            self.release_rejected(pkt);
        }
    }

    fn name(&self) -> &'static str {
        "AF_PACKET ring"
    }
}

impl Drop for RingBackend {
    fn drop(&mut self) {
        if !self.map.is_null() {
            unsafe { libc::munmap(self.map as *mut libc::c_void, self.map_len) };
            self.map = ptr::null_mut();
        }
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}
