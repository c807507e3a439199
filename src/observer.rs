//! Observer sink for allocator decisions.
//!
//! The allocator reports every decision to an [`Observer`] together with the
//! logical time it was made at. [`LogObserver`] renders them through the
//! `log` facade; [`Trace`] records them for post-run assertions.

use std::fmt::Write;

use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::clock::ClockValue;
use crate::types::ResourceId;
use crate::types::SlotId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocEvent {
    ProcessCreated {
        slot: SlotId,
        max_claim: Vec<u32>,
    },
    RequestReceived {
        slot: SlotId,
        resource: ResourceId,
        sent_at: ClockValue,
    },
    /// `retry` is set when the grant came off the blocked queue.
    RequestGranted {
        slot: SlotId,
        resource: ResourceId,
        retry: bool,
    },
    /// The request would leave the system unsafe, or nothing is available.
    RequestBlocked {
        slot: SlotId,
        resource: ResourceId,
        retry: bool,
    },
    /// Contract violation by the worker; the event was dropped.
    EventRejected {
        slot: SlotId,
        reason: String,
    },
    ReleaseReceived {
        slot: SlotId,
        resource: ResourceId,
    },
    TerminateReceived {
        slot: SlotId,
        reclaimed: Vec<u32>,
    },
    TransportFault {
        detail: String,
    },
    /// Allocation matrix of the live slots.
    Snapshot {
        allocated: Vec<(SlotId, Vec<u32>)>,
    },
}

pub trait Observer {
    fn observe(&mut self, now: ClockValue, event: &AllocEvent);
}

impl<A: Observer, B: Observer> Observer for (A, B) {
    fn observe(&mut self, now: ClockValue, event: &AllocEvent) {
        self.0.observe(now, event);
        self.1.observe(now, event);
    }
}

/// Render an allocation matrix with one row per slot.
pub fn format_matrix(rows: &[(SlotId, Vec<u32>)]) -> String {
    let mut out = String::new();
    let width = rows.first().map(|(_, r)| r.len()).unwrap_or(0);
    out.push_str("     ");
    for r in 0..width {
        let _ = write!(out, "{:>4}", format!("R{r}"));
    }
    for (slot, row) in rows {
        let _ = write!(out, "\n{:<5}", slot.to_string());
        for n in row {
            let _ = write!(out, "{n:>4}");
        }
    }
    out
}

/// Logs every event, prefixed with the allocator's clock.
#[derive(Debug, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn observe(&mut self, now: ClockValue, event: &AllocEvent) {
        match event {
            AllocEvent::ProcessCreated { slot, max_claim } => {
                info!("[{now}] created {slot} max_claim={max_claim:?}")
            }
            AllocEvent::RequestReceived {
                slot,
                resource,
                sent_at,
            } => debug!("[{now}] {slot} requests {resource} (sent at {sent_at})"),
            AllocEvent::RequestGranted {
                slot,
                resource,
                retry: false,
            } => debug!("[{now}] granted {resource} to {slot}"),
            AllocEvent::RequestGranted {
                slot,
                resource,
                retry: true,
            } => debug!("[{now}] granted {resource} to {slot} off the blocked queue"),
            AllocEvent::RequestBlocked {
                slot,
                resource,
                retry: false,
            } => debug!("[{now}] {slot} blocked on {resource}"),
            AllocEvent::RequestBlocked {
                slot,
                resource,
                retry: true,
            } => trace!("[{now}] {slot} still blocked on {resource}"),
            AllocEvent::EventRejected { slot, reason } => {
                warn!("[{now}] rejected event from {slot}: {reason}")
            }
            AllocEvent::ReleaseReceived { slot, resource } => {
                debug!("[{now}] {slot} released {resource}")
            }
            AllocEvent::TerminateReceived { slot, reclaimed } => {
                debug!("[{now}] {slot} terminated, reclaimed {reclaimed:?}")
            }
            AllocEvent::TransportFault { detail } => warn!("[{now}] transport fault: {detail}"),
            AllocEvent::Snapshot { allocated } => {
                trace!("[{now}] allocated:\n{}", format_matrix(allocated))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub time: ClockValue,
    pub event: AllocEvent,
}

/// Records every event in order.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Observer for Trace {
    fn observe(&mut self, now: ClockValue, event: &AllocEvent) {
        self.events.push(TraceEvent {
            time: now,
            event: event.clone(),
        });
    }
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Slots in the order their grants were made, with the granted resource.
    pub fn grants(&self) -> Vec<(SlotId, ResourceId)> {
        self.events
            .iter()
            .filter_map(|e| match e.event {
                AllocEvent::RequestGranted { slot, resource, .. } => Some((slot, resource)),
                _ => None,
            })
            .collect()
    }

    pub fn blocked_count(&self, slot: SlotId) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.event, AllocEvent::RequestBlocked { slot: s, .. } if s == slot))
            .count()
    }

    pub fn rejections(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.event, AllocEvent::EventRejected { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_matrix() {
        let rows = vec![(SlotId(0), vec![1, 0]), (SlotId(12), vec![0, 3])];
        let out = format_matrix(&rows);
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "       R0  R1");
        assert_eq!(lines[1], "P0      1   0");
        assert_eq!(lines[2], "P12     0   3");
    }

    #[test]
    fn test_pair_fans_out() {
        let mut pair = (Trace::new(), Trace::new());
        let ev = AllocEvent::ReleaseReceived {
            slot: SlotId(1),
            resource: ResourceId(0),
        };
        pair.observe(ClockValue::ZERO, &ev);
        assert_eq!(pair.0.events().len(), 1);
        assert_eq!(pair.1.events().len(), 1);
    }
}
