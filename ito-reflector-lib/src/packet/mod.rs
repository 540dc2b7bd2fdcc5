//! Frame parsing, classification and in-place reflection.

pub mod classify;
pub mod codec;
pub mod reflect;

pub use classify::{classify, signature_type, RejectReason, SigType};
pub use codec::ParsedFrame;
pub use reflect::reflect;
