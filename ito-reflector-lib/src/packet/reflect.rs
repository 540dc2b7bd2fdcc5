//! In-place header reflection.
//!
//! The swap kernel is selected once per process: SSE2 on x86_64
//! (detected via CPUID), NEON on aarch64, scalar unaligned copies
//! elsewhere. All variants produce identical bytes and never assume
//! alignment. A frame too short for the requested mode is left
//! untouched; partial swaps are forbidden.

use crate::config::ReflectMode;
use crate::packet::codec::{
    self, ParsedFrame, IPV4_CSUM_OFFSET, IPV6_ADDR_LEN, IPV6_DST_OFFSET, IPV6_SRC_OFFSET,
    MIN_CHECKSUM_FRAME, UDP_CSUM_OFFSET, UDP_HDR_LEN,
};

/// Hint the cache that `addr` is about to be read. No-op where the
/// target has no portable prefetch.
#[inline(always)]
pub fn prefetch_read(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch(addr as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
    }
}

#[cfg(target_arch = "x86_64")]
fn have_sse2() -> bool {
    use std::sync::OnceLock;
    static DETECTED: OnceLock<bool> = OnceLock::new();
    *DETECTED.get_or_init(|| std::is_x86_feature_detected!("sse2"))
}

/// Swap the destination and source MAC fields, dispatching to the best
/// available kernel.
#[inline]
pub fn swap_mac(data: &mut [u8]) {
    // The vector variants load and store 16 bytes; bytes 12..16 pass
    // through unchanged.
    #[cfg(target_arch = "x86_64")]
    if data.len() >= 16 && have_sse2() {
        unsafe { sse2::swap_eth_header(data.as_mut_ptr()) };
        return;
    }
    #[cfg(target_arch = "aarch64")]
    if data.len() >= 16 {
        unsafe { neon::swap_eth_header(data.as_mut_ptr()) };
        return;
    }
    codec::swap_mac(data);
}

/// Swap the IPv4 source and destination addresses.
#[inline]
pub fn swap_ipv4_addrs(data: &mut [u8], ip_offset: usize) {
    let end = ip_offset + codec::IPV4_DST_OFFSET + 4;
    #[cfg(target_arch = "x86_64")]
    if data.len() >= end && have_sse2() {
        unsafe { sse2::swap_ipv4_addrs(data.as_mut_ptr().add(ip_offset + codec::IPV4_SRC_OFFSET)) };
        return;
    }
    #[cfg(target_arch = "aarch64")]
    if data.len() >= end {
        // The 8-byte src+dst block is two 32-bit lanes; a 64-bit rotate
        // by 32 exchanges them.
        unsafe {
            let p = data.as_mut_ptr().add(ip_offset + codec::IPV4_SRC_OFFSET) as *mut u64;
            p.write_unaligned(p.read_unaligned().rotate_left(32));
        }
        return;
    }
    let _ = end;
    codec::swap_ipv4_addrs(data, ip_offset);
}

/// Swap the IPv6 source and destination addresses.
#[inline]
pub fn swap_ipv6_addrs(data: &mut [u8], ip_offset: usize) {
    let end = ip_offset + IPV6_DST_OFFSET + IPV6_ADDR_LEN;
    #[cfg(target_arch = "x86_64")]
    if data.len() >= end && have_sse2() {
        unsafe { sse2::swap_ipv6_addrs(data.as_mut_ptr().add(ip_offset + IPV6_SRC_OFFSET)) };
        return;
    }
    let _ = end;
    codec::swap_ipv6_addrs(data, ip_offset);
}

/// Swap the UDP ports: a single 32-bit rotate by 16 exchanges the two
/// 16-bit fields regardless of host endianness.
#[inline]
pub fn swap_udp_ports(data: &mut [u8], udp_offset: usize) {
    if data.len() >= udp_offset + 4 {
        unsafe {
            let p = data.as_mut_ptr().add(udp_offset) as *mut u32;
            p.write_unaligned(p.read_unaligned().rotate_left(16));
        }
    } else {
        codec::swap_udp_ports(data, udp_offset);
    }
}

/// Reflect a frame in place: swap MAC addresses, and depending on
/// `mode` also the IP addresses and UDP ports, then optionally
/// recompute checksums in software.
///
/// The frame is validated up front; if it is too short for the chosen
/// mode nothing is written.
pub fn reflect(data: &mut [u8], mode: ReflectMode, software_checksum: bool) {
    let Some(parsed) = codec::parse(data) else {
        return;
    };

    let required = match mode {
        ReflectMode::Mac => parsed.ip_offset,
        ReflectMode::MacIp => parsed.udp_offset,
        ReflectMode::All => parsed.udp_offset + UDP_HDR_LEN,
    };
    if data.len() < required {
        return;
    }

    swap_mac(data);

    if mode == ReflectMode::MacIp || mode == ReflectMode::All {
        if parsed.ip_version == 4 {
            swap_ipv4_addrs(data, parsed.ip_offset);
        } else {
            swap_ipv6_addrs(data, parsed.ip_offset);
        }
    }

    if mode == ReflectMode::All {
        swap_udp_ports(data, parsed.udp_offset);
    }

    if software_checksum && data.len() >= MIN_CHECKSUM_FRAME {
        recompute_checksums(data, &parsed, mode);
    }
}

fn recompute_checksums(data: &mut [u8], parsed: &ParsedFrame, mode: ReflectMode) {
    if data.len() < parsed.udp_offset + UDP_HDR_LEN {
        // Header-only frame: for IPv4 the header checksum can still be
        // fixed, UDP cannot.
        if parsed.ip_version == 4 {
            rewrite_ipv4_checksum(data, parsed);
        }
        return;
    }

    if parsed.ip_version == 4 {
        rewrite_ipv4_checksum(data, parsed);
        // Port changes only happen in All mode; the NIC or the test
        // tool tolerates the old value otherwise.
        if mode == ReflectMode::All {
            let src: [u8; 4] =
                data[parsed.ip_offset + codec::IPV4_SRC_OFFSET..][..4].try_into().unwrap_or([0; 4]);
            let dst: [u8; 4] =
                data[parsed.ip_offset + codec::IPV4_DST_OFFSET..][..4].try_into().unwrap_or([0; 4]);
            let udp_offset = parsed.udp_offset;
            codec::write_u16(data, udp_offset + UDP_CSUM_OFFSET, 0);
            let csum = codec::udp_checksum(&src, &dst, &data[udp_offset..]);
            codec::write_u16(data, udp_offset + UDP_CSUM_OFFSET, csum);
        }
    } else {
        // UDPv6 checksums are mandatory; recompute in every mode.
        let src: [u8; 16] = data[parsed.ip_offset + IPV6_SRC_OFFSET..][..IPV6_ADDR_LEN]
            .try_into()
            .unwrap_or([0; 16]);
        let dst: [u8; 16] = data[parsed.ip_offset + IPV6_DST_OFFSET..][..IPV6_ADDR_LEN]
            .try_into()
            .unwrap_or([0; 16]);
        let udp_offset = parsed.udp_offset;
        codec::write_u16(data, udp_offset + UDP_CSUM_OFFSET, 0);
        let csum = codec::udp6_checksum(&src, &dst, &data[udp_offset..]);
        codec::write_u16(data, udp_offset + UDP_CSUM_OFFSET, csum);
    }
}

fn rewrite_ipv4_checksum(data: &mut [u8], parsed: &ParsedFrame) {
    let ip_offset = parsed.ip_offset;
    codec::write_u16(data, ip_offset + IPV4_CSUM_OFFSET, 0);
    let csum = codec::ipv4_checksum(&data[ip_offset..ip_offset + parsed.ip_header_len]);
    codec::write_u16(data, ip_offset + IPV4_CSUM_OFFSET, csum);
}

#[cfg(target_arch = "x86_64")]
mod sse2 {
    use core::arch::x86_64::*;

    /// Rewrite the 14-byte Ethernet header in one 128-bit load/store:
    /// bytes 0..6 and 6..12 exchange, 12..16 pass through. Byte-granular
    /// shifts plus masks keep this within the SSE2 set.
    ///
    /// # Safety
    /// `p` must be valid for reads and writes of 16 bytes.
    #[target_feature(enable = "sse2")]
    pub unsafe fn swap_eth_header(p: *mut u8) {
        let x = _mm_loadu_si128(p as *const __m128i);
        let src_down = _mm_srli_si128::<6>(x); // src MAC now at bytes 0..6
        let dst_up = _mm_slli_si128::<6>(x); // dst MAC now at bytes 6..12
        let low6 = _mm_set_epi8(0, 0, 0, 0, 0, 0, 0, 0, 0, 0, -1, -1, -1, -1, -1, -1);
        let mid6 = _mm_set_epi8(0, 0, 0, 0, -1, -1, -1, -1, -1, -1, 0, 0, 0, 0, 0, 0);
        let tail4 = _mm_set_epi8(-1, -1, -1, -1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0);
        let y = _mm_or_si128(
            _mm_or_si128(_mm_and_si128(src_down, low6), _mm_and_si128(dst_up, mid6)),
            _mm_and_si128(x, tail4),
        );
        _mm_storeu_si128(p as *mut __m128i, y);
    }

    /// Exchange the adjacent 4-byte source and destination addresses at
    /// `p` with a single 32-bit lane shuffle.
    ///
    /// # Safety
    /// `p` must be valid for reads and writes of 8 bytes.
    #[target_feature(enable = "sse2")]
    pub unsafe fn swap_ipv4_addrs(p: *mut u8) {
        let v = _mm_loadl_epi64(p as *const __m128i);
        let swapped = _mm_shuffle_epi32::<0b1110_0001>(v);
        _mm_storel_epi64(p as *mut __m128i, swapped);
    }

    /// Exchange the two 16-byte IPv6 addresses; `p` points at the source
    /// address and the destination follows at `p + 16`.
    ///
    /// # Safety
    /// `p` must be valid for reads and writes of 32 bytes.
    #[target_feature(enable = "sse2")]
    pub unsafe fn swap_ipv6_addrs(p: *mut u8) {
        let src = _mm_loadu_si128(p as *const __m128i);
        let dst = _mm_loadu_si128(p.add(16) as *const __m128i);
        _mm_storeu_si128(p as *mut __m128i, dst);
        _mm_storeu_si128(p.add(16) as *mut __m128i, src);
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use core::arch::aarch64::*;

    /// NEON table-lookup shuffle of the Ethernet header; the index
    /// vector exchanges bytes 0..6 with 6..12 and keeps 12..16.
    ///
    /// # Safety
    /// `p` must be valid for reads and writes of 16 bytes.
    pub unsafe fn swap_eth_header(p: *mut u8) {
        const IDX: [u8; 16] = [6, 7, 8, 9, 10, 11, 0, 1, 2, 3, 4, 5, 12, 13, 14, 15];
        let x = vld1q_u8(p);
        let idx = vld1q_u8(IDX.as_ptr());
        vst1q_u8(p, vqtbl1q_u8(x, idx));
    }
}
