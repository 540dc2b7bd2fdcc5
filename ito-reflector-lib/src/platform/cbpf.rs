//! Classic BPF filter programs shared by the kernel ring and BSD
//! device backends.
//!
//! Opcode constants follow `<linux/bpf_common.h>`; the instruction
//! layout is identical for Linux socket filters (`sock_filter`) and BSD
//! `bpf_insn`, so one builder serves both.

use crate::packet::codec::{ETHERTYPE_IPV4, ETH_TYPE_OFFSET, IPPROTO_UDP};

pub const BPF_LD: u16 = 0x00;
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_K: u16 = 0x00;
pub const BPF_RET: u16 = 0x06;

/// One classic BPF instruction; layout-compatible with both
/// `libc::sock_filter` and BSD `struct bpf_insn`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

pub const fn stmt(code: u16, k: u32) -> Insn {
    Insn { code, jt: 0, jf: 0, k }
}

pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Insn {
    Insn { code, jt, jf, k }
}

/// IP protocol byte of an untagged IPv4 frame.
const IP_PROTO_ABS: u32 = 23;
/// Signature bytes of an untagged minimal IPv4/UDP frame:
/// Eth(14) + IP(20) + UDP(8) + vendor(5).
const SIG_ABS: u32 = 47;

/// Emit the six load/compare pairs for the destination MAC. Each
/// mismatch jumps forward to the reject instruction.
fn push_mac_checks(prog: &mut Vec<Insn>, mac: &[u8; 6], reject_idx: usize) {
    for (i, byte) in mac.iter().enumerate() {
        prog.push(stmt(BPF_LD | BPF_B | BPF_ABS, i as u32));
        let here = prog.len();
        prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, u32::from(*byte), 0, (reject_idx - here - 1) as u8));
    }
}

/// Socket filter for the mmap ring backend: destination MAC, EtherType
/// IPv4, protocol UDP. Signature matching stays in userspace there
/// because the ring sees VLAN and IPv6 traffic too.
pub fn udp_to_local_mac(mac: &[u8; 6]) -> Vec<Insn> {
    // 12 MAC insns + 4 ethertype/protocol insns + accept + reject.
    let reject = 17;
    let mut prog = Vec::with_capacity(18);
    push_mac_checks(&mut prog, mac, reject);
    prog.push(stmt(BPF_LD | BPF_H | BPF_ABS, ETH_TYPE_OFFSET as u32));
    prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, u32::from(ETHERTYPE_IPV4), 0, 3));
    prog.push(stmt(BPF_LD | BPF_B | BPF_ABS, IP_PROTO_ABS));
    prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, u32::from(IPPROTO_UDP), 0, 1));
    prog.push(stmt(BPF_RET | BPF_K, u32::MAX));
    prog.push(stmt(BPF_RET | BPF_K, 0));
    prog
}

/// Device filter for the BSD backend: as above plus the four-byte
/// prefix of one of the ITO signatures at UDP-payload offset 5.
pub fn ito_signature_filter(mac: &[u8; 6]) -> Vec<Insn> {
    // "PROB", "DATA", "LATE" as big-endian words.
    const PREFIXES: [u32; 3] = [0x5052_4F42, 0x4441_5441, 0x4C41_5445];

    // 12 MAC insns + 4 ethertype/protocol + 6 signature + accept + reject.
    let accept = 22u8;
    let reject = 23usize;
    let mut prog = Vec::with_capacity(24);
    push_mac_checks(&mut prog, mac, reject);
    prog.push(stmt(BPF_LD | BPF_H | BPF_ABS, ETH_TYPE_OFFSET as u32));
    prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, u32::from(ETHERTYPE_IPV4), 0, 9));
    prog.push(stmt(BPF_LD | BPF_B | BPF_ABS, IP_PROTO_ABS));
    prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, u32::from(IPPROTO_UDP), 0, 7));
    for prefix in PREFIXES {
        prog.push(stmt(BPF_LD | BPF_W | BPF_ABS, SIG_ABS));
        let here = prog.len();
        if here + 1 == usize::from(accept) {
            // Last prefix: fall through to accept, jump to reject.
            prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, prefix, 0, 1));
        } else {
            prog.push(jump(BPF_JMP | BPF_JEQ | BPF_K, prefix, accept - here as u8 - 1, 0));
        }
    }
    prog.push(stmt(BPF_RET | BPF_K, u32::MAX));
    prog.push(stmt(BPF_RET | BPF_K, 0));
    prog
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];

    /// Minimal classic-BPF interpreter covering the opcodes the
    /// programs use, so the jump offsets can be validated against real
    /// frames.
    fn run(prog: &[Insn], frame: &[u8]) -> u32 {
        let load = |abs: usize, width: usize| -> Option<u32> {
            if abs + width > frame.len() {
                return None;
            }
            let mut v = 0u32;
            for b in &frame[abs..abs + width] {
                v = v << 8 | u32::from(*b);
            }
            Some(v)
        };

        let mut acc = 0u32;
        let mut pc = 0usize;
        loop {
            let insn = prog[pc];
            match insn.code {
                c if c == BPF_LD | BPF_B | BPF_ABS => match load(insn.k as usize, 1) {
                    Some(v) => acc = v,
                    None => return 0,
                },
                c if c == BPF_LD | BPF_H | BPF_ABS => match load(insn.k as usize, 2) {
                    Some(v) => acc = v,
                    None => return 0,
                },
                c if c == BPF_LD | BPF_W | BPF_ABS => match load(insn.k as usize, 4) {
                    Some(v) => acc = v,
                    None => return 0,
                },
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    pc += usize::from(if acc == insn.k { insn.jt } else { insn.jf });
                }
                c if c == BPF_RET | BPF_K => return insn.k,
                other => panic!("unhandled opcode {other:#x}"),
            }
            pc += 1;
        }
    }

    fn probe_frame(sig: &[u8; 7]) -> Vec<u8> {
        let mut f = vec![0u8; 64];
        f[0..6].copy_from_slice(&MAC);
        f[12] = 0x08;
        f[14] = 0x45;
        f[23] = IPPROTO_UDP;
        f[47..54].copy_from_slice(sig);
        f
    }

    #[test]
    fn socket_filter_accepts_local_udp() {
        let prog = udp_to_local_mac(&MAC);
        assert_eq!(prog.len(), 18);
        assert_ne!(run(&prog, &probe_frame(b"PROBEOT")), 0);
    }

    #[test]
    fn socket_filter_rejects_foreign_mac_and_non_udp() {
        let prog = udp_to_local_mac(&MAC);
        let mut f = probe_frame(b"PROBEOT");
        f[3] = 0xEE;
        assert_eq!(run(&prog, &f), 0);

        let mut f = probe_frame(b"PROBEOT");
        f[23] = 6;
        assert_eq!(run(&prog, &f), 0);

        let mut f = probe_frame(b"PROBEOT");
        f[12] = 0x86;
        f[13] = 0xDD;
        assert_eq!(run(&prog, &f), 0);
    }

    #[test]
    fn device_filter_accepts_each_ito_signature() {
        let prog = ito_signature_filter(&MAC);
        assert_eq!(prog.len(), 24);
        for sig in [b"PROBEOT", b"DATA:OT", b"LATENCY"] {
            assert_ne!(run(&prog, &probe_frame(sig)), 0, "{sig:?}");
        }
    }

    #[test]
    fn device_filter_rejects_custom_signatures() {
        let prog = ito_signature_filter(&MAC);
        for sig in [b"RFC2544", b"Y.1564 "] {
            assert_eq!(run(&prog, &probe_frame(sig)), 0, "{sig:?}");
        }
    }
}
