use thiserror::Error;

/// Errors surfaced during initialization and control operations.
///
/// The hot path never constructs these; classification rejects and TX
/// failures are counter events (see [`crate::stats`]).
#[derive(Error, Debug)]
pub enum ReflectorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("reflector is already running")]
    AlreadyRunning,

    #[error("operation requires a stopped reflector")]
    StillRunning,

    #[error("{backend} init failed on {interface}: {reason}")]
    BackendInit {
        backend: &'static str,
        interface: String,
        reason: String,
    },

    #[cfg(target_os = "linux")]
    #[error("failed to load XDP filter object: {0}")]
    FilterLoad(#[from] aya::EbpfError),

    #[cfg(target_os = "linux")]
    #[error("XDP filter program error: {0}")]
    FilterProgram(#[source] aya::programs::ProgramError),

    #[cfg(target_os = "linux")]
    #[error("XDP filter map error: {0}")]
    FilterMap(#[from] aya::maps::MapError),

    #[error("no platform backend available for this OS")]
    UnsupportedPlatform,
}

pub type Result<T> = std::result::Result<T, ReflectorError>;
