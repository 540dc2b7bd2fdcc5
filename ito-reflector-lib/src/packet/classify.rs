//! Hot-path classification of received frames.
//!
//! `classify` decides whether a frame is reflectable test traffic under
//! the configured filter. It allocates nothing, never panics, and keeps
//! the accept path free of cold work: every reject funnels through a
//! `#[cold]` helper so the branch predictor treats the full validation
//! chain as straight-line code.

use tracing::trace;

use crate::config::{ReflectorConfig, SigFilter};
use crate::packet::codec::{
    self, ParsedFrame, ETHERTYPE_IPV4, ETHERTYPE_IPV6, ETHERTYPE_QINQ, ETHERTYPE_VLAN,
    ETH_HDR_LEN, IPPROTO_UDP, IPV4_PROTO_OFFSET, IPV6_HDR_LEN, IPV6_NEXT_HDR_OFFSET,
    MIN_FRAME_IPV4, MIN_FRAME_IPV4_VLAN, MIN_FRAME_IPV6, SIG_DATAOT, SIG_LATENCY, SIG_LEN,
    SIG_OFFSET, SIG_PROBEOT, SIG_RFC2544, SIG_Y1564, UDP_DST_PORT_OFFSET, UDP_HDR_LEN,
    VLAN_HDR_LEN, VLAN_INNER_TYPE_OFFSET,
};

/// Why a frame was not reflected. Counter events, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooShort,
    BadMac,
    BadEtherType,
    BadProtocol,
    BadSignature,
}

/// Which of the five signatures a frame carries. Used only for counter
/// bucketing, never as an accept decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigType {
    Probeot,
    DataOt,
    Latency,
    Rfc2544,
    Y1564,
    Unknown,
}

#[cold]
#[inline(never)]
fn reject(reason: RejectReason) -> Result<ParsedFrame, RejectReason> {
    trace!(?reason, "frame rejected");
    Err(reason)
}

impl SigFilter {
    /// Signatures this filter accepts, in match order.
    pub fn accepted(&self) -> &'static [[u8; SIG_LEN]] {
        match self {
            SigFilter::All => &[SIG_PROBEOT, SIG_DATAOT, SIG_LATENCY, SIG_RFC2544, SIG_Y1564],
            SigFilter::Ito => &[SIG_PROBEOT, SIG_DATAOT, SIG_LATENCY],
            SigFilter::Rfc2544 => &[SIG_RFC2544],
            SigFilter::Y1564 => &[SIG_Y1564],
            SigFilter::Custom => &[SIG_RFC2544, SIG_Y1564],
        }
    }
}

/// Validate a frame against the configured filter.
///
/// Checks run in order of increasing cost and short-circuit on the
/// first failure: length, destination MAC, source OUI, EtherType (one
/// VLAN tag tolerated when enabled), IP sanity, UDP, destination port,
/// signature bytes present, signature accepted. Each failure maps to a
/// distinct [`RejectReason`] for metrics. The frame is never modified.
pub fn classify(data: &[u8], config: &ReflectorConfig) -> Result<ParsedFrame, RejectReason> {
    if data.len() < MIN_FRAME_IPV4 {
        return reject(RejectReason::TooShort);
    }

    if data[..6] != config.mac {
        return reject(RejectReason::BadMac);
    }

    if config.filter_oui && data[6..9] != config.oui {
        return reject(RejectReason::BadMac);
    }

    let mut ethertype = codec::read_u16(data, codec::ETH_TYPE_OFFSET);
    let mut ip_offset = ETH_HDR_LEN;
    let mut has_vlan = false;

    if ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        if !config.enable_vlan {
            return reject(RejectReason::BadEtherType);
        }
        if data.len() < MIN_FRAME_IPV4_VLAN {
            return reject(RejectReason::TooShort);
        }
        ethertype = codec::read_u16(data, VLAN_INNER_TYPE_OFFSET);
        ip_offset = ETH_HDR_LEN + VLAN_HDR_LEN;
        has_vlan = true;
    }

    let parsed = if ethertype == ETHERTYPE_IPV4 {
        let ver_ihl = data[ip_offset];
        if ver_ihl >> 4 != 4 || ver_ihl & 0x0F < 5 {
            return reject(RejectReason::BadProtocol);
        }
        let ip_header_len = usize::from(ver_ihl & 0x0F) * 4;
        if data.len() < ip_offset + ip_header_len + UDP_HDR_LEN {
            return reject(RejectReason::TooShort);
        }
        ParsedFrame {
            has_vlan,
            ip_offset,
            ip_version: 4,
            ip_header_len,
            protocol: data[ip_offset + IPV4_PROTO_OFFSET],
            udp_offset: ip_offset + ip_header_len,
        }
    } else if ethertype == ETHERTYPE_IPV6 {
        if !config.enable_ipv6 {
            return reject(RejectReason::BadEtherType);
        }
        if data.len() < MIN_FRAME_IPV6 + if has_vlan { VLAN_HDR_LEN } else { 0 } {
            return reject(RejectReason::TooShort);
        }
        ParsedFrame {
            has_vlan,
            ip_offset,
            ip_version: 6,
            ip_header_len: IPV6_HDR_LEN,
            protocol: data[ip_offset + IPV6_NEXT_HDR_OFFSET],
            udp_offset: ip_offset + IPV6_HDR_LEN,
        }
    } else {
        return reject(RejectReason::BadEtherType);
    };

    if parsed.protocol != IPPROTO_UDP {
        return reject(RejectReason::BadProtocol);
    }

    if config.ito_port != 0 {
        let dst_port = codec::read_u16(data, parsed.udp_offset + UDP_DST_PORT_OFFSET);
        if dst_port != config.ito_port {
            // Structurally valid UDP that is not test traffic.
            return reject(RejectReason::BadSignature);
        }
    }

    let sig_start = parsed.udp_offset + UDP_HDR_LEN + SIG_OFFSET;
    if data.len() < sig_start + SIG_LEN {
        return reject(RejectReason::TooShort);
    }

    let sig = &data[sig_start..sig_start + SIG_LEN];
    for accepted in config.sig_filter.accepted() {
        if sig == accepted {
            return Ok(parsed);
        }
    }

    reject(RejectReason::BadSignature)
}

/// Look up which signature a frame carries, for counter bucketing.
pub fn signature_type(data: &[u8]) -> SigType {
    let Some(parsed) = codec::parse(data) else {
        return SigType::Unknown;
    };
    let sig_start = parsed.udp_offset + UDP_HDR_LEN + SIG_OFFSET;
    if data.len() < sig_start + SIG_LEN {
        return SigType::Unknown;
    }
    let sig = &data[sig_start..sig_start + SIG_LEN];
    match () {
        _ if sig == SIG_PROBEOT => SigType::Probeot,
        _ if sig == SIG_DATAOT => SigType::DataOt,
        _ if sig == SIG_LATENCY => SigType::Latency,
        _ if sig == SIG_RFC2544 => SigType::Rfc2544,
        _ if sig == SIG_Y1564 => SigType::Y1564,
        _ => SigType::Unknown,
    }
}
