//! End-to-end frame scenarios: classify + reflect against literal
//! wire-format inputs.

use ito_reflector_lib::config::{ReflectMode, ReflectorConfig};
use ito_reflector_lib::packet::codec::{self, read_u16};
use ito_reflector_lib::{classify, reflect, signature_type, RejectReason, SigType};

const LOCAL_MAC: [u8; 6] = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];

/// The 64-byte PROBEOT frame: probe at 192.168.0.10:0x0f02 sending to
/// the reflector at 192.168.0.1:0x0f03.
#[rustfmt::skip]
fn probeot_frame() -> Vec<u8> {
    let mut f = vec![
        0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b,
        0x00, 0xc0, 0x17, 0x54, 0x05, 0x98,
        0x08, 0x00,
        0x45, 0x00, 0x00, 0x27,
        0x00, 0x00, 0x40, 0x00,
        0x40, 0x11, 0x00, 0x00,
        0xc0, 0xa8, 0x00, 0x0a,
        0xc0, 0xa8, 0x00, 0x01,
        0x0f, 0x02, 0x0f, 0x03,
        0x00, 0x13, 0x00, 0x00,
        0x09, 0x10, 0xea, 0x1d, 0x00,
        b'P', b'R', b'O', b'B', b'E', b'O', b'T',
    ];
    f.resize(64, 0);
    f
}

fn reflector_config() -> ReflectorConfig {
    let mut cfg = ReflectorConfig::for_interface("test0");
    cfg.mac = LOCAL_MAC;
    cfg.ito_port = 0x0f03;
    cfg
}

#[test]
fn s1_probeot_reflection_all_mode() {
    let cfg = reflector_config();
    let mut frame = probeot_frame();

    classify(&frame, &cfg).expect("PROBEOT frame accepted");
    assert_eq!(signature_type(&frame), SigType::Probeot);

    reflect(&mut frame, ReflectMode::All, false);

    assert_eq!(&frame[0..6], &[0x00, 0xc0, 0x17, 0x54, 0x05, 0x98]);
    assert_eq!(&frame[6..12], &LOCAL_MAC);
    assert_eq!(&frame[26..30], &[192, 168, 0, 1]);
    assert_eq!(&frame[30..34], &[192, 168, 0, 10]);
    assert_eq!(read_u16(&frame, 34), 0x0f03);
    assert_eq!(read_u16(&frame, 36), 0x0f02);
    assert_eq!(&frame[47..54], b"PROBEOT");
}

#[test]
fn s2_wrong_destination_mac_left_unmodified() {
    let cfg = reflector_config();
    let mut frame = probeot_frame();
    frame[0..6].copy_from_slice(&[0xff; 6]);
    let before = frame.clone();

    assert_eq!(classify(&frame, &cfg), Err(RejectReason::BadMac));
    assert_eq!(frame, before);
}

#[rustfmt::skip]
fn ipv6_probeot_frame() -> Vec<u8> {
    let mut f = vec![
        0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b,
        0x00, 0xc0, 0x17, 0x54, 0x05, 0x98,
        0x86, 0xdd,
        // IPv6: version/tc/flow, payload len 20, next header UDP, hops 64
        0x60, 0x00, 0x00, 0x00,
        0x00, 0x14, 0x11, 0x40,
        // src 2001:db8::10
        0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x10,
        // dst 2001:db8::1
        0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01,
        // UDP
        0x0f, 0x02, 0x0f, 0x03,
        0x00, 0x14, 0x00, 0x00,
        0x09, 0x10, 0xea, 0x1d, 0x00,
        b'P', b'R', b'O', b'B', b'E', b'O', b'T',
    ];
    f.resize(74, 0);
    f
}

#[test]
fn s3_ipv6_gated_and_reflected() {
    let mut cfg = reflector_config();
    let frame = ipv6_probeot_frame();

    cfg.enable_ipv6 = false;
    assert_eq!(classify(&frame, &cfg), Err(RejectReason::BadEtherType));

    cfg.enable_ipv6 = true;
    classify(&frame, &cfg).expect("IPv6 PROBEOT accepted");

    let mut reflected = frame.clone();
    reflect(&mut reflected, ReflectMode::All, true);

    // Addresses swapped.
    assert_eq!(&reflected[22..38], &frame[38..54]);
    assert_eq!(&reflected[38..54], &frame[22..38]);
    // Ports swapped.
    assert_eq!(read_u16(&reflected, 54), 0x0f03);
    assert_eq!(read_u16(&reflected, 56), 0x0f02);

    // UDPv6 checksum valid and nonzero.
    let csum = read_u16(&reflected, 54 + 6);
    assert_ne!(csum, 0);
    let src: [u8; 16] = reflected[22..38].try_into().unwrap();
    let dst: [u8; 16] = reflected[38..54].try_into().unwrap();
    let mut cleared = reflected.clone();
    codec::write_u16(&mut cleared, 54 + 6, 0);
    assert_eq!(codec::udp6_checksum(&src, &dst, &cleared[54..]), csum);
}

#[test]
fn s4_round_trip_under_software_checksum() {
    let cfg = reflector_config();
    let mut frame = probeot_frame();
    // Give the input a valid IPv4 header checksum first, as on the wire.
    let csum = codec::ipv4_checksum(&frame[14..34]);
    codec::write_u16(&mut frame, 24, csum);
    classify(&frame, &cfg).expect("accepted");

    let original = frame.clone();
    reflect(&mut frame, ReflectMode::All, true);
    assert_ne!(frame, original);
    reflect(&mut frame, ReflectMode::All, true);
    // The UDP checksum field changed from 0 to the computed value; all
    // other bytes round-trip.
    let mut expected = original.clone();
    let src: [u8; 4] = expected[26..30].try_into().unwrap();
    let dst: [u8; 4] = expected[30..34].try_into().unwrap();
    let udp_csum = codec::udp_checksum(&src, &dst, &expected[34..]);
    codec::write_u16(&mut expected, 40, udp_csum);
    assert_eq!(frame, expected);

    // And from a fully normalized frame, reflection is a strict
    // involution.
    let normalized = frame.clone();
    reflect(&mut frame, ReflectMode::All, true);
    reflect(&mut frame, ReflectMode::All, true);
    assert_eq!(frame, normalized);
}

#[test]
fn reflected_frame_keeps_local_mac_as_source() {
    let cfg = reflector_config();
    let mut frame = probeot_frame();
    classify(&frame, &cfg).expect("accepted");
    let probe_mac = frame[6..12].to_vec();

    reflect(&mut frame, ReflectMode::All, false);
    assert_eq!(&frame[6..12], &LOCAL_MAC, "local MAC moves to source");
    assert_eq!(&frame[0..6], &probe_mac[..], "probe MAC becomes destination");
}

#[test]
fn vlan_frame_reflects_behind_the_tag() {
    let cfg = reflector_config();
    let mut frame = probeot_frame();
    frame.splice(12..12, [0x81, 0x00, 0x00, 0x64]);
    classify(&frame, &cfg).expect("tagged frame accepted");

    reflect(&mut frame, ReflectMode::All, false);
    assert_eq!(&frame[12..16], &[0x81, 0x00, 0x00, 0x64], "tag untouched");
    assert_eq!(&frame[30..34], &[192, 168, 0, 1]);
    assert_eq!(read_u16(&frame, 38), 0x0f03);
}

#[test]
fn all_signatures_round_trip_each_mode() {
    for sig in [b"PROBEOT", b"DATA:OT", b"LATENCY", b"RFC2544", b"Y.1564 "] {
        let mut frame = probeot_frame();
        frame[47..54].copy_from_slice(sig);
        let original = frame.clone();
        for mode in [ReflectMode::Mac, ReflectMode::MacIp, ReflectMode::All] {
            reflect(&mut frame, mode, false);
            reflect(&mut frame, mode, false);
            assert_eq!(frame, original, "{sig:?} {mode:?}");
        }
    }
}

#[test]
fn signature_types_bucket_correctly() {
    let table: [(&[u8; 7], SigType); 6] = [
        (b"PROBEOT", SigType::Probeot),
        (b"DATA:OT", SigType::DataOt),
        (b"LATENCY", SigType::Latency),
        (b"RFC2544", SigType::Rfc2544),
        (b"Y.1564 ", SigType::Y1564),
        (b"WHATNOW", SigType::Unknown),
    ];
    for (sig, expected) in table {
        let mut frame = probeot_frame();
        frame[47..54].copy_from_slice(sig);
        assert_eq!(signature_type(&frame), expected);
    }
}
