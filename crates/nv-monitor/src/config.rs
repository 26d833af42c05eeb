use std::time::Duration;

/// Tunables for the monitor core. Defaults reproduce the literal
/// constants named throughout the specification (§4.1, §4.5, §4.7, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// §4.5: aggregator flush period.
    pub aggregate_flush_interval: Duration,
    /// §4.7: learning-engine flush period.
    pub learn_flush_interval: Duration,
    /// §4.1 / §5: walker request timeout.
    pub walker_timeout: Duration,
    /// §4.1 / §5: max concurrent walker requests.
    pub walker_concurrency: usize,
    /// §4.6: grace period during which writes to `RUNTIME_ADDED_FILES`
    /// are suppressed for a young group.
    pub runtime_file_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            aggregate_flush_interval: Duration::from_secs(4),
            learn_flush_interval: Duration::from_secs(10),
            walker_timeout: Duration::from_secs(16),
            walker_concurrency: 2,
            runtime_file_grace: Duration::from_secs(nv_common::RUNTIME_FILE_GRACE_SECS),
        }
    }
}

/// Per-container configuration handed to `StartWatch` (§6).
#[derive(Debug, Clone)]
pub struct StartWatchConfig {
    pub profile: nv_policy::Profile,
    pub mode: Option<nv_policy::PolicyMode>,
    /// §4.4: whether this group is permitted to issue `FAN_DENY`.
    pub cap_block: bool,
    /// §3: whether this is the agent's own container.
    pub is_nv_service: bool,
    /// §4.8, §9 "AUFS quirk": whether the container's storage driver is
    /// AUFS. Detected by the out-of-scope `Walker`/discovery
    /// collaborator and passed in, since filesystem-type detection is a
    /// host-walking concern outside this core's scope (§1).
    pub is_aufs: bool,
}
