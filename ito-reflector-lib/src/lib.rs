//! Userspace Layer-2 reflector for ITO and RFC2544/Y.1564 test traffic.
//!
//! Frames arrive on one NIC interface, are classified against a small
//! signature set, reflected in place (MAC, optionally IP and UDP ports
//! swapped) and transmitted back out the same interface. One worker
//! thread per RX queue drives a synchronous recv/classify/reflect/send
//! loop over a platform backend (AF_XDP, AF_PACKET mmap, or a BSD bpf
//! device).

pub mod config;
pub mod error;
pub mod nic;
pub mod packet;
pub mod platform;
pub mod reflector;
pub mod signal;
pub mod stats;
pub mod worker;

pub use config::{BackendKind, ReflectMode, ReflectorConfig, SigFilter, StatsFormat};
pub use error::{ReflectorError, Result};
pub use packet::classify::{classify, signature_type, RejectReason, SigType};
pub use packet::codec::ParsedFrame;
pub use packet::reflect::reflect;
pub use platform::{FrameDesc, Platform};
pub use reflector::Reflector;
pub use stats::{Stats, WorkerStats};
