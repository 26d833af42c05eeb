//! Shared, serde-serializable types exchanged across the monitor's
//! callback boundary (§6 of the specification): process identity,
//! the event taxonomy, outbound alert messages, learned rules, and
//! probe-data snapshots.
//!
//! Unlike the teacher's `assay-common`, this crate does not split a
//! `no_std` core from a `std`-gated `exports` module: every consumer
//! (`nv-policy`, `nv-monitor`) already depends on `std` collections,
//! so the split would add a feature flag with no payoff.

mod message;
mod probe;
mod proc_info;
mod rule;

pub use message::{Action, EventKind, MonitorMessage};
pub use probe::{FanotifyProbeData, InotifyProbeData, ProbeData};
pub use proc_info::ProcInfo;
pub use rule::Rule;

/// Canonical paths written by container runtimes at container start
/// (§4.6 "special-case suppression"). Events against these paths are
/// suppressed while a group is younger than [`RUNTIME_FILE_GRACE_SECS`].
pub const RUNTIME_ADDED_FILES: [&str; 3] = ["/etc/hosts", "/etc/hostname", "/etc/resolv.conf"];

/// Grace period (seconds) during which `RUNTIME_ADDED_FILES` writes by
/// the container runtime are not reported (§4.6, §8 boundary property 8).
pub const RUNTIME_FILE_GRACE_SECS: u64 = 60;
