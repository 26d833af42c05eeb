//! Linux-only kernel plumbing: the two drivers (C3/C4) and the
//! orchestrator (`LinuxCore`) that wires them to the OS-agnostic
//! aggregator/classifier/learning/registry modules.

mod core;
mod fanotify_driver;
mod inotify_driver;

pub use core::LinuxCore;
pub use fanotify_driver::{DenyDelivery, FanotifyDelivery, FanotifyDriver, FanotifyEvent, PermissionVerdict};
pub use inotify_driver::{InotifyDelivery, InotifyDriver};
