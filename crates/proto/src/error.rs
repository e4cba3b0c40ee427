/// Domain-level error kinds. Low-level syscall failures are wrapped at the
/// point they occur rather than passed through as raw integer codes.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bad arguments: {0}")]
    BadArgs(String),

    #[error("cannot connect to X11 display {0:?}")]
    NoDisplay(Option<String>),

    #[error("required X11 extension missing: {0}")]
    MissingExtension(&'static str),

    #[error("shared memory failure: {0}")]
    ShmFailure(String),

    #[error("damage read failed: {0}")]
    ReadFailure(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("remote protocol init failed: {0}")]
    SpiceInitFailed(String),

    #[error("no free port in listen range")]
    AutoListenFailed,

    #[error("audit requested but unavailable: {0}")]
    NoAudit(String),
}
