//! Inbound callback contracts the core consumes (§6). Implementations
//! are injected at construction time and are treated as potentially
//! blocking (§5): the core never calls them while holding its shared
//! mutex.

use nv_common::{MonitorMessage, ProcInfo, Rule};

/// Resolves a kernel-reported PID to a process identity.
pub trait PidLookup: Send + Sync {
    fn lookup(&self, pid: u32) -> Option<ProcInfo>;
}

/// Transports one alert. Returns whether delivery succeeded; the core
/// never retries on `false` (§7).
pub trait ReportSink: Send + Sync {
    fn send_report(&self, message: MonitorMessage) -> bool;
}

/// Uploads a batch of learned rules (§4.7). Failure is logged; learned
/// entries are not re-queued (§4.7 "by design").
pub trait RuleSink: Send + Sync {
    fn send_access_rules(&self, rules: Vec<Rule>) -> Result<(), String>;
}

/// Used to tag a report with its originating group when the core
/// cannot determine it locally (§6).
pub trait RuleSourceEstimator: Send + Sync {
    fn estimate_rule_src(&self, container_id: &str, path: &str, is_deny: bool) -> String;
}
