//! XDP program classifying ITO test frames in the kernel.
//!
//! Publishes three maps consumed by the userspace dataplane:
//! `xsks_map` (queue index -> AF_XDP socket), `mac_map` (one entry,
//! the expected destination MAC) and `sig_map` (accepted 7-byte
//! signatures keyed by their bytes; values unused). A frame is
//! redirected to its queue's bypass socket iff the destination MAC
//! matches, the EtherType is IPv4, the protocol is UDP and the 7 bytes
//! at UDP-payload offset 5 are present in `sig_map`. Everything else
//! continues to the OS network stack.
#![no_std]
#![no_main]

use core::mem;

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{Array, HashMap, XskMap},
    programs::XdpContext,
};

const ETH_HDR_LEN: usize = 14;
const ETH_P_IP: u16 = 0x0800_u16.swap_bytes();
const IPPROTO_UDP: u8 = 17;
const UDP_HDR_LEN: usize = 8;
/// 5-byte vendor header before the signature in the UDP payload.
const SIG_OFFSET: usize = 5;
const SIG_LEN: usize = 7;

/// Minimal Ethernet header; aya-ebpf-bindings carries no UAPI network
/// headers.
#[repr(C)]
struct EthHdr {
    h_dest: [u8; 6],
    h_source: [u8; 6],
    h_proto: u16, // network byte order
}

/// Minimal IPv4 header. The first byte packs `version` (high nibble)
/// and `ihl` (low nibble).
#[repr(C)]
struct IpHdr {
    version_ihl: u8,
    tos: u8,
    tot_len: u16,
    id: u16,
    frag_off: u16,
    ttl: u8,
    protocol: u8,
    check: u16,
    saddr: u32,
    daddr: u32,
}

impl IpHdr {
    #[inline(always)]
    fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    #[inline(always)]
    fn ihl(&self) -> u8 {
        self.version_ihl & 0x0F
    }
}

#[map]
#[allow(non_upper_case_globals)]
static xsks_map: XskMap = XskMap::with_max_entries(64, 0);

#[map]
#[allow(non_upper_case_globals)]
static mac_map: Array<[u8; 6]> = Array::with_max_entries(1, 0);

#[map]
#[allow(non_upper_case_globals)]
static sig_map: HashMap<[u8; SIG_LEN], u32> = HashMap::with_max_entries(16, 0);

#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    if start + offset + mem::size_of::<T>() > end {
        return Err(());
    }
    Ok((start + offset) as *const T)
}

#[xdp]
pub fn xdp_filter_ito(ctx: XdpContext) -> u32 {
    match try_filter_ito(&ctx) {
        Ok(action) => action,
        Err(()) => xdp_action::XDP_PASS,
    }
}

fn try_filter_ito(ctx: &XdpContext) -> Result<u32, ()> {
    let eth = unsafe { &*ptr_at::<EthHdr>(ctx, 0)? };

    if eth.h_proto != ETH_P_IP {
        return Ok(xdp_action::XDP_PASS);
    }

    if let Some(expected) = mac_map.get(0) {
        if eth.h_dest != *expected {
            return Ok(xdp_action::XDP_PASS);
        }
    }

    let iph = unsafe { &*ptr_at::<IpHdr>(ctx, ETH_HDR_LEN)? };
    if iph.version() != 4 || iph.ihl() < 5 {
        return Ok(xdp_action::XDP_PASS);
    }
    if iph.protocol != IPPROTO_UDP {
        return Ok(xdp_action::XDP_PASS);
    }

    let ip_hdr_len = iph.ihl() as usize * 4;
    let sig_offset = ETH_HDR_LEN + ip_hdr_len + UDP_HDR_LEN + SIG_OFFSET;
    let sig = unsafe { &*ptr_at::<[u8; SIG_LEN]>(ctx, sig_offset)? };

    if unsafe { sig_map.get(sig) }.is_none() {
        return Ok(xdp_action::XDP_PASS);
    }

    let queue = unsafe { (*ctx.ctx).rx_queue_index };
    Ok(xsks_map.redirect(queue, 0).unwrap_or(xdp_action::XDP_PASS))
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
