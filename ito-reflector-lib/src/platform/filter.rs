//! Loader for the in-kernel XDP classification program.
//!
//! The program (built separately from the `ito-reflector-xdp` crate)
//! publishes three maps: `xsks_map` (queue -> AF_XDP socket redirect),
//! `mac_map` (single entry, expected destination MAC) and `sig_map`
//! (accepted 7-byte signatures; values unused). Worker 0 loads and
//! attaches it once; later workers share the handle and only register
//! their sockets.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Arc, Mutex};

use aya::maps::{Array, HashMap, XskMap};
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use tracing::{info, warn};

use crate::config::ReflectorConfig;
use crate::error::{ReflectorError, Result};
use crate::packet::codec::SIG_LEN;

const PROGRAM_NAME: &str = "xdp_filter_ito";

pub struct XdpFilter {
    ebpf: Ebpf,
}

impl XdpFilter {
    /// Load the filter object, publish the MAC and accepted signatures,
    /// and attach to the interface (driver mode, falling back to SKB
    /// mode). Without an attached program no frame ever reaches the
    /// bypass sockets, so failure here fails kernel-bypass init.
    pub fn load(config: &ReflectorConfig) -> Result<Arc<Mutex<XdpFilter>>> {
        // BPF maps count against RLIMIT_MEMLOCK on older kernels.
        unsafe {
            let rlim = libc::rlimit {
                rlim_cur: libc::RLIM_INFINITY,
                rlim_max: libc::RLIM_INFINITY,
            };
            let _ = libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim);
        }

        let mut ebpf = Ebpf::load_file(&config.xdp_object_path)?;

        {
            let map = ebpf
                .map_mut("mac_map")
                .ok_or_else(|| missing_map("mac_map"))?;
            let mut mac_map: Array<_, [u8; 6]> = Array::try_from(map)?;
            mac_map.set(0, config.mac, 0)?;
        }

        {
            let map = ebpf
                .map_mut("sig_map")
                .ok_or_else(|| missing_map("sig_map"))?;
            let mut sig_map: HashMap<_, [u8; SIG_LEN], u32> = HashMap::try_from(map)?;
            for sig in config.sig_filter.accepted() {
                sig_map.insert(sig, 1u32, 0)?;
            }
        }

        let program: &mut Xdp = ebpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| ReflectorError::Config(format!("program {PROGRAM_NAME} not found")))?
            .try_into()
            .map_err(ReflectorError::FilterProgram)?;
        program.load().map_err(ReflectorError::FilterProgram)?;

        match program.attach(&config.ifname, XdpFlags::DRV_MODE) {
            Ok(_) => {
                info!(interface = %config.ifname, mode = "driver", "XDP filter attached");
            }
            Err(err) => {
                warn!(%err, "driver-mode attach failed, trying SKB mode");
                program
                    .attach(&config.ifname, XdpFlags::SKB_MODE)
                    .map_err(ReflectorError::FilterProgram)?;
                info!(interface = %config.ifname, mode = "skb", "XDP filter attached");
            }
        }

        Ok(Arc::new(Mutex::new(XdpFilter { ebpf })))
    }

    /// Register a worker's AF_XDP socket so matching frames on its
    /// queue are redirected to it.
    pub fn register_socket(&mut self, queue_id: u32, fd: RawFd) -> Result<()> {
        let map = self
            .ebpf
            .map_mut("xsks_map")
            .ok_or_else(|| missing_map("xsks_map"))?;
        let mut xsks: XskMap<_> = XskMap::try_from(map)?;
        xsks.set(queue_id, unsafe { BorrowedFd::borrow_raw(fd) }, 0)?;
        Ok(())
    }
}

fn missing_map(name: &str) -> ReflectorError {
    ReflectorError::Config(format!("XDP filter object does not publish map {name}"))
}
