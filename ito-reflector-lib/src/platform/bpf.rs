//! BSD packet-filter device backend (macOS, FreeBSD).
//!
//! Reads batches of variable-length records from `/dev/bpfN` with an
//! in-kernel filter so only ITO candidates cross into userspace, and
//! writes through a second device handle with a coalescing buffer.
//! Descriptors returned by `recv_batch` point into the read buffer and
//! must all be processed before the next `recv_batch` overwrites it;
//! the worker loop guarantees that by reflecting and sending within
//! the same iteration.

use std::io;
use std::mem;
use std::ptr;

use tracing::{debug, info, warn};

use crate::config::ReflectorConfig;
use crate::error::{ReflectorError, Result};
use crate::nic;
use crate::platform::cbpf;
use crate::platform::{FrameDesc, Platform};

const BPF_DEV_MAX: u32 = 256;
/// Device buffer sizes to try, largest first.
const BUFFER_SIZES: [u32; 3] = [1024 * 1024, 512 * 1024, 256 * 1024];
/// Accumulate up to this much before issuing one write syscall.
const WRITE_COALESCE_SIZE: usize = 64 * 1024;

const BPF_ALIGNMENT: usize = 4;

const fn bpf_wordalign(len: usize) -> usize {
    (len + BPF_ALIGNMENT - 1) & !(BPF_ALIGNMENT - 1)
}

// <net/bpf.h> layouts and ioctl numbers; libc's BSD coverage of the
// bpf device is incomplete.
#[repr(C)]
struct BpfHdr {
    bh_tstamp: [u32; 2],
    bh_caplen: u32,
    bh_datalen: u32,
    bh_hdrlen: u16,
}

#[repr(C)]
struct BpfProgram {
    bf_len: libc::c_uint,
    bf_insns: *mut cbpf::Insn,
}

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; 16],
    ifr_ifru: [u8; 16],
}

const IOCPARM_MASK: libc::c_ulong = 0x1fff;
const IOC_VOID: libc::c_ulong = 0x2000_0000;
const IOC_OUT: libc::c_ulong = 0x4000_0000;
const IOC_IN: libc::c_ulong = 0x8000_0000;

const fn ioc(inout: libc::c_ulong, group: u8, num: u8, len: usize) -> libc::c_ulong {
    inout | ((len as libc::c_ulong & IOCPARM_MASK) << 16) | ((group as libc::c_ulong) << 8) | num as libc::c_ulong
}

const BIOCSBLEN: libc::c_ulong = ioc(IOC_IN | IOC_OUT, b'B', 102, mem::size_of::<u32>());
const BIOCSETF: libc::c_ulong = ioc(IOC_IN, b'B', 103, mem::size_of::<BpfProgram>());
const BIOCPROMISC: libc::c_ulong = ioc(IOC_VOID, b'B', 105, 0);
const BIOCSETIF: libc::c_ulong = ioc(IOC_IN, b'B', 108, mem::size_of::<IfReq>());
const BIOCSRTIMEOUT: libc::c_ulong = ioc(IOC_IN, b'B', 109, mem::size_of::<libc::timeval>());
const BIOCIMMEDIATE: libc::c_ulong = ioc(IOC_IN, b'B', 112, mem::size_of::<u32>());
#[cfg(target_os = "macos")]
const BIOCSSEESENT: libc::c_ulong = ioc(IOC_IN, b'B', 119, mem::size_of::<u32>());
#[cfg(target_os = "freebsd")]
const BIOCSDIRECTION: libc::c_ulong = ioc(IOC_IN, b'B', 118, mem::size_of::<u32>());

pub struct BpfBackend {
    read_fd: libc::c_int,
    write_fd: libc::c_int,
    kq: libc::c_int,
    read_buf: Vec<u8>,
    read_len: usize,
    read_off: usize,
    write_buf: Vec<u8>,
    measure_latency: bool,
    poll_timeout_ms: i64,
}

unsafe impl Send for BpfBackend {}

fn open_bpf_device() -> io::Result<libc::c_int> {
    for i in 0..BPF_DEV_MAX {
        let Ok(path) = std::ffi::CString::new(format!("/dev/bpf{i}")) else {
            break;
        };
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if fd >= 0 {
            debug!(device = %format!("/dev/bpf{i}"), "opened bpf device");
            return Ok(fd);
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EBUSY) {
            break;
        }
    }
    Err(io::Error::last_os_error())
}

fn ioctl_u32(fd: libc::c_int, req: libc::c_ulong, mut val: u32) -> io::Result<u32> {
    if unsafe { libc::ioctl(fd, req, &mut val) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(val)
}

fn bind_to_interface(fd: libc::c_int, ifname: &str) -> io::Result<()> {
    let mut req = IfReq { ifr_name: [0; 16], ifr_ifru: [0; 16] };
    let bytes = ifname.as_bytes();
    if bytes.len() >= 16 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    if unsafe { libc::ioctl(fd, BIOCSETIF, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl BpfBackend {
    pub fn new(config: &ReflectorConfig) -> Result<BpfBackend> {
        let err = |what: &str| {
            let e = io::Error::last_os_error();
            ReflectorError::BackendInit {
                backend: "bpf device",
                interface: config.ifname.clone(),
                reason: format!("{what}: {e}"),
            }
        };

        let read_fd = open_bpf_device().map_err(|e| ReflectorError::BackendInit {
            backend: "bpf device",
            interface: config.ifname.clone(),
            reason: format!("open read device: {e}"),
        })?;

        // Negotiate the largest buffer the device accepts, before
        // binding.
        let mut buffer_size = BUFFER_SIZES[BUFFER_SIZES.len() - 1];
        for size in BUFFER_SIZES {
            if ioctl_u32(read_fd, BIOCSBLEN, size).is_ok() {
                buffer_size = size;
                break;
            }
        }

        if let Err(e) = bind_to_interface(read_fd, &config.ifname) {
            unsafe { libc::close(read_fd) };
            return Err(ReflectorError::BackendInit {
                backend: "bpf device",
                interface: config.ifname.clone(),
                reason: format!("bind read device: {e}"),
            });
        }

        let write_fd = match open_bpf_device().and_then(|fd| {
            bind_to_interface(fd, &config.ifname).map(|()| fd).map_err(|e| {
                unsafe { libc::close(fd) };
                e
            })
        }) {
            Ok(fd) => fd,
            Err(e) => {
                unsafe { libc::close(read_fd) };
                return Err(ReflectorError::BackendInit {
                    backend: "bpf device",
                    interface: config.ifname.clone(),
                    reason: format!("open write device: {e}"),
                });
            }
        };

        let cleanup = |msg: ReflectorError| {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            msg
        };

        // Immediate mode off: let the kernel batch records per read.
        if ioctl_u32(read_fd, BIOCIMMEDIATE, 0).is_err() {
            warn!("failed to disable immediate mode");
        }

        // Do not loop our own transmissions back in.
        #[cfg(target_os = "macos")]
        if ioctl_u32(read_fd, BIOCSSEESENT, 0).is_err() {
            warn!("failed to disable see-sent");
        }
        #[cfg(target_os = "freebsd")]
        if ioctl_u32(read_fd, BIOCSDIRECTION, 1).is_err() {
            // BPF_D_IN: incoming only.
            warn!("failed to restrict capture direction");
        }

        if config.promiscuous
            && unsafe { libc::ioctl(read_fd, BIOCPROMISC, ptr::null_mut::<u8>()) } < 0
        {
            warn!("failed to enable promiscuous mode");
        }

        let mut insns = cbpf::ito_signature_filter(&config.mac);
        let mut prog =
            BpfProgram { bf_len: insns.len() as libc::c_uint, bf_insns: insns.as_mut_ptr() };
        if unsafe { libc::ioctl(read_fd, BIOCSETF, &mut prog) } < 0 {
            return Err(cleanup(err("install filter")));
        }

        let mut tv = libc::timeval {
            tv_sec: (config.poll_timeout_ms / 1000) as libc::time_t,
            tv_usec: ((config.poll_timeout_ms % 1000) * 1000) as libc::suseconds_t,
        };
        if unsafe { libc::ioctl(read_fd, BIOCSRTIMEOUT, &mut tv) } < 0 {
            warn!("failed to set read timeout");
        }

        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(cleanup(err("kqueue")));
        }
        let change = libc::kevent {
            ident: read_fd as libc::uintptr_t,
            filter: libc::EVFILT_READ,
            flags: libc::EV_ADD | libc::EV_ENABLE,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        if unsafe { libc::kevent(kq, &change, 1, ptr::null_mut(), 0, ptr::null()) } < 0 {
            unsafe { libc::close(kq) };
            return Err(cleanup(err("kevent register")));
        }

        info!(
            interface = %config.ifname,
            buffer_kb = buffer_size / 1024,
            "bpf device backend ready"
        );

        Ok(BpfBackend {
            read_fd,
            write_fd,
            kq,
            read_buf: vec![0u8; buffer_size as usize],
            read_len: 0,
            read_off: 0,
            write_buf: Vec::with_capacity(WRITE_COALESCE_SIZE),
            measure_latency: config.measure_latency,
            poll_timeout_ms: i64::from(config.poll_timeout_ms),
        })
    }

    /// Block on the kernel event queue until the device is readable or
    /// the poll timeout expires.
    fn wait_readable(&self) -> bool {
        let timeout = libc::timespec {
            tv_sec: (self.poll_timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((self.poll_timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let mut event: libc::kevent = unsafe { mem::zeroed() };
        let n = unsafe { libc::kevent(self.kq, ptr::null(), 0, &mut event, 1, &timeout) };
        n > 0
    }

    fn refill(&mut self) -> usize {
        if !self.wait_readable() {
            return 0;
        }
        let n = unsafe {
            libc::read(
                self.read_fd,
                self.read_buf.as_mut_ptr() as *mut libc::c_void,
                self.read_buf.len(),
            )
        };
        if n <= 0 {
            let e = io::Error::last_os_error();
            if n < 0 && e.raw_os_error() != Some(libc::EAGAIN) && e.raw_os_error() != Some(libc::EINTR)
            {
                warn!(error = %e, "bpf read failed");
            }
            return 0;
        }
        self.read_len = n as usize;
        self.read_off = 0;
        self.read_len
    }

    fn flush_writes(&mut self) -> bool {
        if self.write_buf.is_empty() {
            return true;
        }
        let n = unsafe {
            libc::write(
                self.write_fd,
                self.write_buf.as_ptr() as *const libc::c_void,
                self.write_buf.len(),
            )
        };
        self.write_buf.clear();
        n >= 0
    }
}

impl Platform for BpfBackend {
    fn recv_batch(&mut self, out: &mut [FrameDesc]) -> usize {
        if self.read_off >= self.read_len && self.refill() == 0 {
            return 0;
        }

        let mut n = 0;
        while self.read_off < self.read_len && n < out.len() {
            let remaining = self.read_len - self.read_off;
            if remaining < mem::size_of::<BpfHdr>() {
                break;
            }
            let hdr = unsafe { &*(self.read_buf.as_ptr().add(self.read_off) as *const BpfHdr) };
            let hdrlen = hdr.bh_hdrlen as usize;
            let caplen = hdr.bh_caplen as usize;
            if self.read_off + hdrlen + caplen > self.read_len {
                break;
            }
            let data = unsafe { self.read_buf.as_mut_ptr().add(self.read_off + hdrlen) };
            out[n] = FrameDesc::from_raw(data, caplen as u32, 0);
            if self.measure_latency {
                out[n].timestamp_ns = nic::monotonic_ns();
            }
            n += 1;
            self.read_off += bpf_wordalign(hdrlen + caplen);
        }
        if n == 0 {
            // Unparseable remainder; drop it rather than spin.
            self.read_off = self.read_len;
        }
        n
    }

    fn send_batch(&mut self, pkts: &[FrameDesc]) -> usize {
        let mut sent = 0;
        for pkt in pkts {
            if self.write_buf.len() + pkt.len() > WRITE_COALESCE_SIZE && !self.flush_writes() {
                break;
            }
            self.write_buf.extend_from_slice(pkt.bytes());
            sent += 1;
        }
        self.flush_writes();
        sent
    }

    fn release_rejected(&mut self, _pkt: &FrameDesc) {
        // Records are copies inside the read buffer; nothing to return.
    }

    fn release_sent(&mut self, _pkts: &[FrameDesc]) {}

    fn name(&self) -> &'static str {
        "bpf device"
    }
}

impl Drop for BpfBackend {
    fn drop(&mut self) {
        for fd in [self.kq, self.read_fd, self.write_fd] {
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
        }
        self.kq = -1;
        self.read_fd = -1;
        self.write_fd = -1;
    }
}
