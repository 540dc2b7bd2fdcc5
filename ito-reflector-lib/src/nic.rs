//! Interface discovery and small system helpers.

use std::ffi::CString;
use std::io;

use tracing::{debug, warn};

use crate::error::{ReflectorError, Result};

/// Resolve an interface name to its index.
pub fn interface_index(ifname: &str) -> Result<i32> {
    let name = CString::new(ifname)
        .map_err(|_| ReflectorError::InterfaceNotFound(ifname.to_string()))?;
    let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if idx == 0 {
        return Err(ReflectorError::InterfaceNotFound(ifname.to_string()));
    }
    Ok(idx as i32)
}

#[cfg(target_os = "linux")]
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    // Large enough for every ifr_ifru variant we touch.
    ifr_ifru: [u8; 24],
}

#[cfg(target_os = "linux")]
fn ifreq_for(ifname: &str) -> Result<IfReq> {
    let bytes = ifname.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
        return Err(ReflectorError::InterfaceNotFound(ifname.to_string()));
    }
    let mut req = IfReq { ifr_name: [0; libc::IFNAMSIZ], ifr_ifru: [0; 24] };
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(req)
}

/// Look up the interface MAC address.
#[cfg(target_os = "linux")]
pub fn interface_mac(ifname: &str) -> Result<[u8; 6]> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let mut req = ifreq_for(ifname)?;
    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if rc < 0 {
        return Err(err.into());
    }
    // ifr_hwaddr.sa_data starts 2 bytes into the union (after sa_family).
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&req.ifr_ifru[2..8]);
    debug!(interface = ifname, mac = %format_mac(&mac), "resolved interface MAC");
    Ok(mac)
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub fn interface_mac(ifname: &str) -> Result<[u8; 6]> {
    use std::ptr;

    let mut ifap: *mut libc::ifaddrs = ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let mut cur = ifap;
    let mut found = None;
    while !cur.is_null() {
        let entry = unsafe { &*cur };
        let name = unsafe { std::ffi::CStr::from_ptr(entry.ifa_name) };
        if name.to_bytes() == ifname.as_bytes() && !entry.ifa_addr.is_null() {
            let addr = unsafe { &*entry.ifa_addr };
            if i32::from(addr.sa_family) == libc::AF_LINK {
                let dl = entry.ifa_addr as *const libc::sockaddr_dl;
                let dl = unsafe { &*dl };
                if dl.sdl_alen as usize >= 6 {
                    let data = dl.sdl_data.as_ptr() as *const u8;
                    let lladdr = unsafe {
                        std::slice::from_raw_parts(data.add(dl.sdl_nlen as usize), 6)
                    };
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(lladdr);
                    found = Some(mac);
                    break;
                }
            }
        }
        cur = entry.ifa_next;
    }
    unsafe { libc::freeifaddrs(ifap) };
    found.ok_or_else(|| ReflectorError::InterfaceNotFound(ifname.to_string()))
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parse `aa:bb:cc` into an OUI triple.
pub fn parse_oui(s: &str) -> Option<[u8; 3]> {
    let mut out = [0u8; 3];
    let mut parts = s.split(':');
    for slot in out.iter_mut() {
        *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

#[cfg(target_os = "linux")]
const SIOCETHTOOL: libc::c_ulong = 0x8946;
#[cfg(target_os = "linux")]
const ETHTOOL_GCHANNELS: u32 = 0x3c;

#[cfg(target_os = "linux")]
#[repr(C)]
struct EthtoolChannels {
    cmd: u32,
    max_rx: u32,
    max_tx: u32,
    max_other: u32,
    max_combined: u32,
    rx_count: u32,
    tx_count: u32,
    other_count: u32,
    combined_count: u32,
}

/// Number of RX queues of the interface; 1 when the query fails.
#[cfg(target_os = "linux")]
pub fn rx_queue_count(ifname: &str) -> usize {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        warn!(interface = ifname, "socket for queue query failed, assuming 1 queue");
        return 1;
    }
    let mut channels = EthtoolChannels {
        cmd: ETHTOOL_GCHANNELS,
        max_rx: 0,
        max_tx: 0,
        max_other: 0,
        max_combined: 0,
        rx_count: 0,
        tx_count: 0,
        other_count: 0,
        combined_count: 0,
    };
    let Ok(mut req) = ifreq_for(ifname) else {
        unsafe { libc::close(fd) };
        return 1;
    };
    let ptr = (&mut channels as *mut EthtoolChannels as usize).to_ne_bytes();
    req.ifr_ifru[..ptr.len()].copy_from_slice(&ptr);
    let rc = unsafe { libc::ioctl(fd, SIOCETHTOOL, &mut req) };
    unsafe { libc::close(fd) };
    if rc < 0 {
        debug!(interface = ifname, "ethtool channel query failed, assuming 1 queue");
        return 1;
    }
    let queues = if channels.combined_count != 0 {
        channels.combined_count
    } else {
        channels.rx_count
    };
    queues.max(1) as usize
}

#[cfg(not(target_os = "linux"))]
pub fn rx_queue_count(_ifname: &str) -> usize {
    1
}

#[cfg(target_os = "linux")]
const ETHTOOL_GSET: u32 = 0x01;

#[cfg(target_os = "linux")]
#[repr(C)]
struct EthtoolCmd {
    cmd: u32,
    supported: u32,
    advertising: u32,
    speed: u16,
    duplex: u8,
    port: u8,
    phy_address: u8,
    transceiver: u8,
    autoneg: u8,
    mdio_support: u8,
    maxtxpkt: u32,
    maxrxpkt: u32,
    speed_hi: u16,
    eth_tp_mdix: u8,
    eth_tp_mdix_ctrl: u8,
    lp_advertising: u32,
    reserved: [u32; 2],
}

/// Link speed in Mbit/s, when the driver reports one.
#[cfg(target_os = "linux")]
pub fn link_speed_mbps(ifname: &str) -> Option<u32> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return None;
    }
    let mut cmd: EthtoolCmd = unsafe { std::mem::zeroed() };
    cmd.cmd = ETHTOOL_GSET;
    let Ok(mut req) = ifreq_for(ifname) else {
        unsafe { libc::close(fd) };
        return None;
    };
    let ptr = (&mut cmd as *mut EthtoolCmd as usize).to_ne_bytes();
    req.ifr_ifru[..ptr.len()].copy_from_slice(&ptr);
    let rc = unsafe { libc::ioctl(fd, SIOCETHTOOL, &mut req) };
    unsafe { libc::close(fd) };
    if rc < 0 {
        return None;
    }
    let speed = u32::from(cmd.speed) | u32::from(cmd.speed_hi) << 16;
    // Drivers report 0 or all-ones when the link speed is unknown.
    if speed == 0 || speed == 0xFFFF || speed == 0xFFFF_FFFF {
        return None;
    }
    Some(speed)
}

#[cfg(not(target_os = "linux"))]
pub fn link_speed_mbps(_ifname: &str) -> Option<u32> {
    None
}

/// Best-effort queue-to-CPU mapping: round-robin over online CPUs.
pub fn queue_cpu_affinity(queue_id: u32) -> i32 {
    let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if cpus <= 0 {
        return -1;
    }
    (queue_id as i64 % cpus) as i32
}

/// Pin the calling thread to one CPU.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: i32) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: i32) -> io::Result<()> {
    Ok(())
}

/// Best-effort scheduling priority bump for a worker thread.
pub fn raise_thread_priority() {
    #[cfg(target_os = "linux")]
    unsafe {
        let param = libc::sched_param { sched_priority: 10 };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            debug!("SCHED_FIFO unavailable, keeping default priority");
        }
    }
}

/// Monotonic nanosecond clock.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Drop to the `nobody` user once the privileged backend setup is done.
/// Failure is a warning, not fatal.
pub fn drop_privileges() {
    unsafe {
        if libc::geteuid() != 0 {
            return;
        }
        let name = match CString::new("nobody") {
            Ok(n) => n,
            Err(_) => return,
        };
        let pw = libc::getpwnam(name.as_ptr());
        if pw.is_null() {
            warn!("user 'nobody' not found, keeping root privileges");
            return;
        }
        let (uid, gid) = ((*pw).pw_uid, (*pw).pw_gid);
        if libc::setgid(gid) != 0 || libc::setuid(uid) != 0 {
            warn!(error = %io::Error::last_os_error(), "failed to drop privileges");
            return;
        }
        debug!(uid, gid, "dropped privileges to nobody");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_oui_strings() {
        assert_eq!(parse_oui("00:c0:17"), Some([0x00, 0xc0, 0x17]));
        assert_eq!(parse_oui("AB:cd:0F"), Some([0xAB, 0xCD, 0x0F]));
        assert_eq!(parse_oui("00:c0"), None);
        assert_eq!(parse_oui("00:c0:17:aa"), None);
        assert_eq!(parse_oui("zz:c0:17"), None);
    }

    #[test]
    fn formats_mac() {
        assert_eq!(format_mac(&[0, 0xc0, 0x17, 0x54, 5, 0x98]), "00:c0:17:54:05:98");
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn queue_affinity_is_a_valid_cpu() {
        let cpu = queue_cpu_affinity(0);
        assert!(cpu >= -1);
    }
}
