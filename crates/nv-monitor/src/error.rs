use thiserror::Error;

/// Fatal or caller-visible errors (§7 "fatal", "kernel-unsupported").
/// Per-target and per-event failures are *not* represented here — they
/// are swallowed with a `tracing::warn!` record (§7 "Propagation
/// policy") and never reach the caller.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Neither notification channel could be opened at construction
    /// time (§7 "fatal").
    #[error("failed to initialize monitor: {0}")]
    Init(String),

    /// This build/OS does not support kernel-coupled monitoring at all.
    #[error("container file monitor is not supported on this OS")]
    NotSupported,

    #[error("container {0} is not an active monitoring group")]
    UnknownGroup(u32),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("filter error: {0}")]
    Filter(#[from] nv_policy::FilterError),

    #[error("walker error: {0}")]
    Walker(#[from] WalkerError),
}

/// Errors from the two kernel-coupled drivers (C3/C4). Construction
/// failures are fatal; everything else is a per-target condition the
/// driver logs and continues past (§7).
#[derive(Debug, Error)]
pub enum DriverError {
    #[cfg(target_os = "linux")]
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(target_os = "linux")]
    #[error("errno: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("watch/mark table already contains '{0}'")]
    AlreadyArmed(String),

    #[error("watch/mark table has no entry for '{0}'")]
    NotArmed(String),

    #[error("permission-capable channel (fanotify) unavailable on this kernel")]
    PermEventsUnsupported,
}

/// §4.1: walker call failed, timed out, or returned a malformed
/// response. The caller proceeds with an empty enumeration on any of
/// these (§7 "Walker timeout yields an empty enumeration").
#[derive(Debug, Error)]
pub enum WalkerError {
    #[error("walker call timed out")]
    Timeout,
    #[error("walker task failed: {0}")]
    TaskFailed(String),
    #[error("walker returned a malformed response: {0}")]
    MalformedResponse(String),
}
