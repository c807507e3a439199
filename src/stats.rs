use std::io::Write;

use anyhow::Result;
use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;

/// Run counters reported at shutdown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub processes_created: u64,
    pub processes_terminated: u64,
    /// Fresh requests received from workers.
    pub requests: u64,
    pub grants: u64,
    /// Grants made off the blocked queue. Included in `grants`.
    pub grants_after_block: u64,
    /// Requests denied and parked on the blocked queue.
    pub denials: u64,
    pub retries: u64,
    pub safety_checks: u64,
    pub releases: u64,
    pub rejections: u64,
    pub transport_faults: u64,
    pub events_handled: u64,
}

impl AllocStats {
    /// Percentage of fresh requests that were eventually granted.
    pub fn approval_pct(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.grants as f64 * 100.0 / self.requests as f64
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "processes: created={} terminated={}",
            self.processes_created, self.processes_terminated
        )?;
        writeln!(
            w,
            "requests={} grants={} ({:.2}%) after_block={} denials={} retries={}",
            self.requests,
            self.grants,
            self.approval_pct(),
            self.grants_after_block,
            self.denials,
            self.retries
        )?;
        writeln!(
            w,
            "safety_checks={} releases={} rejections={} transport_faults={} events={}",
            self.safety_checks,
            self.releases,
            self.rejections,
            self.transport_faults,
            self.events_handled
        )?;
        Ok(())
    }
}

/// Exported metric handles. No-ops unless a recorder is installed.
pub struct Metrics {
    pub requests: Counter,
    pub grants: Counter,
    pub denials: Counter,
    pub retries: Counter,
    pub rejections: Counter,
    pub releases: Counter,
    pub safety_checks: Counter,
    pub transport_faults: Counter,
    pub created: Counter,
    pub terminated: Counter,
    pub blocked_depth: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests: counter!("requests_total"),
            grants: counter!("grants_total"),
            denials: counter!("denials_total"),
            retries: counter!("blocked_retries_total"),
            rejections: counter!("rejections_total"),
            releases: counter!("releases_total"),
            safety_checks: counter!("safety_checks_total"),
            transport_faults: counter!("transport_faults_total"),
            created: counter!("processes_total", "type" => "created"),
            terminated: counter!("processes_total", "type" => "terminated"),
            blocked_depth: gauge!("blocked_queue_depth"),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
