//! Message transport between the allocator and its workers.
//!
//! All workers share one inbound channel to the allocator. Each slot gets its
//! own grant channel so a grant reaches exactly the worker it is addressed
//! to. The allocator also publishes one read-only blocked flag per slot;
//! workers poll their own flag instead of issuing a second request while
//! one is still outstanding.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use crossbeam::channel::TryRecvError;

use crate::clock::ClockReader;
use crate::clock::ClockValue;
use crate::types::ResourceId;
use crate::types::SlotId;

/// Wire format shared by worker events and allocator grants.
///
/// A worker message carries exactly one of `request`, `release` or
/// `terminate`. A grant carries only `granted` and the allocator's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: SlotId,
    pub request: Option<ResourceId>,
    pub release: Option<ResourceId>,
    pub terminate: bool,
    pub granted: bool,
    pub timestamp: ClockValue,
}

impl Message {
    fn empty(sender: SlotId, timestamp: ClockValue) -> Self {
        Message {
            sender,
            request: None,
            release: None,
            terminate: false,
            granted: false,
            timestamp,
        }
    }

    pub fn request(sender: SlotId, resource: ResourceId, timestamp: ClockValue) -> Self {
        Message {
            request: Some(resource),
            ..Self::empty(sender, timestamp)
        }
    }

    pub fn release(sender: SlotId, resource: ResourceId, timestamp: ClockValue) -> Self {
        Message {
            release: Some(resource),
            ..Self::empty(sender, timestamp)
        }
    }

    pub fn terminate(sender: SlotId, timestamp: ClockValue) -> Self {
        Message {
            terminate: true,
            ..Self::empty(sender, timestamp)
        }
    }

    pub fn grant(target: SlotId, timestamp: ClockValue) -> Self {
        Message {
            granted: true,
            ..Self::empty(target, timestamp)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Request { slot: SlotId, resource: ResourceId },
    Release { slot: SlotId, resource: ResourceId },
    Terminate { slot: SlotId },
}

impl EventKind {
    pub fn slot(&self) -> SlotId {
        match *self {
            EventKind::Request { slot, .. }
            | EventKind::Release { slot, .. }
            | EventKind::Terminate { slot } => slot,
        }
    }
}

/// A validated worker message and the sender's clock at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub sent_at: ClockValue,
}

impl TryFrom<Message> for Event {
    type Error = ChannelError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        let malformed = |reason| ChannelError::Malformed {
            sender: msg.sender,
            reason,
        };
        if msg.granted {
            return Err(malformed("grant flag set on a worker message"));
        }
        let kind = match (msg.request, msg.release, msg.terminate) {
            (Some(resource), None, false) => EventKind::Request {
                slot: msg.sender,
                resource,
            },
            (None, Some(resource), false) => EventKind::Release {
                slot: msg.sender,
                resource,
            },
            (None, None, true) => EventKind::Terminate { slot: msg.sender },
            (None, None, false) => return Err(malformed("no action")),
            _ => return Err(malformed("more than one action")),
        };
        Ok(Event {
            kind,
            sent_at: msg.timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// A message failed validation and was dropped.
    Malformed { sender: SlotId, reason: &'static str },
    /// The peer side of the channel is gone.
    Disconnected,
    /// The target worker no longer listens for grants.
    GrantUndeliverable(SlotId),
    /// No grant channel is registered for the slot.
    UnknownTarget(SlotId),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Malformed { sender, reason } => {
                write!(f, "malformed message from {sender}: {reason}")
            }
            ChannelError::Disconnected => write!(f, "channel disconnected"),
            ChannelError::GrantUndeliverable(s) => write!(f, "grant to {s} undeliverable"),
            ChannelError::UnknownTarget(s) => write!(f, "no grant channel for {s}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Per-slot blocked flags written by the allocator and read by workers.
#[derive(Debug, Clone)]
pub struct BlockedFlags {
    flags: Arc<Vec<AtomicBool>>,
}

impl BlockedFlags {
    pub fn new(nr_slots: usize) -> Self {
        Self {
            flags: Arc::new((0..nr_slots).map(|_| AtomicBool::new(false)).collect()),
        }
    }

    pub fn get(&self, slot: SlotId) -> bool {
        self.flags
            .get(slot.index())
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn set(&self, slot: SlotId, blocked: bool) {
        if let Some(f) = self.flags.get(slot.index()) {
            f.store(blocked, Ordering::Release);
        }
    }
}

/// Allocator side of the transport.
#[derive(Debug)]
pub struct RequestChannel {
    inbound_tx: Sender<Message>,
    inbound_rx: Receiver<Message>,
    grants: Vec<Option<Sender<Message>>>,
    blocked: BlockedFlags,
    clock: ClockReader,
}

impl RequestChannel {
    pub fn new(nr_slots: usize, clock: ClockReader) -> Self {
        let (inbound_tx, inbound_rx) = channel::unbounded();
        Self {
            inbound_tx,
            inbound_rx,
            grants: (0..nr_slots).map(|_| None).collect(),
            blocked: BlockedFlags::new(nr_slots),
            clock,
        }
    }

    /// Open a grant channel for `slot` and return the worker's endpoint.
    /// Any previous connection for the slot is replaced.
    pub fn connect(&mut self, slot: SlotId) -> Result<WorkerEndpoint, ChannelError> {
        let grant_slot = self
            .grants
            .get_mut(slot.index())
            .ok_or(ChannelError::UnknownTarget(slot))?;
        let (grant_tx, grant_rx) = channel::unbounded();
        *grant_slot = Some(grant_tx);
        self.blocked.set(slot, false);
        Ok(WorkerEndpoint {
            slot,
            tx: self.inbound_tx.clone(),
            grants: grant_rx,
            blocked: self.blocked.clone(),
            clock: self.clock.clone(),
        })
    }

    /// Drop the grant channel of a terminated slot.
    pub fn disconnect(&mut self, slot: SlotId) {
        if let Some(g) = self.grants.get_mut(slot.index()) {
            *g = None;
        }
        self.blocked.set(slot, false);
    }

    /// Drop every grant channel. Workers observe the disconnect and exit.
    pub fn close(&mut self) {
        for g in self.grants.iter_mut() {
            *g = None;
        }
    }

    /// Take at most one pending message without waiting. `Ok(None)` means
    /// nothing is queued.
    pub fn try_next(&self) -> Result<Option<Event>, ChannelError> {
        match self.inbound_rx.try_recv() {
            Ok(msg) => Event::try_from(msg).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }

    pub fn send_grant(&self, slot: SlotId, now: ClockValue) -> Result<(), ChannelError> {
        let tx = self
            .grants
            .get(slot.index())
            .and_then(|g| g.as_ref())
            .ok_or(ChannelError::UnknownTarget(slot))?;
        tx.send(Message::grant(slot, now))
            .map_err(|_| ChannelError::GrantUndeliverable(slot))
    }

    pub fn set_blocked(&self, slot: SlotId, blocked: bool) {
        self.blocked.set(slot, blocked);
    }

    /// Sender for injecting raw messages, as a worker would.
    pub fn sender(&self) -> Sender<Message> {
        self.inbound_tx.clone()
    }
}

/// Worker side of the transport, bound to one slot.
#[derive(Debug)]
pub struct WorkerEndpoint {
    slot: SlotId,
    tx: Sender<Message>,
    grants: Receiver<Message>,
    blocked: BlockedFlags,
    clock: ClockReader,
}

impl WorkerEndpoint {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn now(&self) -> ClockValue {
        self.clock.now()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.get(self.slot)
    }

    fn send(&self, msg: Message) -> Result<(), ChannelError> {
        self.tx.send(msg).map_err(|_| ChannelError::Disconnected)
    }

    pub fn request(&self, resource: ResourceId) -> Result<(), ChannelError> {
        self.send(Message::request(self.slot, resource, self.now()))
    }

    pub fn release(&self, resource: ResourceId) -> Result<(), ChannelError> {
        self.send(Message::release(self.slot, resource, self.now()))
    }

    pub fn terminate(&self) -> Result<(), ChannelError> {
        self.send(Message::terminate(self.slot, self.now()))
    }

    /// Wait up to `timeout` for a grant. `Ok(None)` on timeout.
    pub fn recv_grant(&self, timeout: Duration) -> Result<Option<Message>, ChannelError> {
        match self.grants.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;

    fn channel(nr_slots: usize) -> (SimClock, RequestChannel) {
        let clock = SimClock::new(1000);
        let ch = RequestChannel::new(nr_slots, clock.reader());
        (clock, ch)
    }

    #[test]
    fn test_validation() {
        let ts = ClockValue::ZERO;
        let ok = Event::try_from(Message::request(SlotId(1), ResourceId(2), ts)).unwrap();
        assert_eq!(
            ok.kind,
            EventKind::Request {
                slot: SlotId(1),
                resource: ResourceId(2)
            }
        );

        let mut both = Message::request(SlotId(1), ResourceId(2), ts);
        both.terminate = true;
        assert!(matches!(
            Event::try_from(both),
            Err(ChannelError::Malformed { .. })
        ));
        assert!(Event::try_from(Message::grant(SlotId(0), ts)).is_err());

        let mut none = Message::terminate(SlotId(0), ts);
        none.terminate = false;
        assert!(Event::try_from(none).is_err());
    }

    #[test]
    fn test_empty_is_not_an_error() {
        let (_clock, ch) = channel(2);
        assert_eq!(ch.try_next(), Ok(None));
    }

    #[test]
    fn test_grant_is_targeted() {
        let (mut clock, mut ch) = channel(2);
        let w0 = ch.connect(SlotId(0)).unwrap();
        let w1 = ch.connect(SlotId(1)).unwrap();
        clock.tick();

        w1.request(ResourceId(0)).unwrap();
        let ev = ch.try_next().unwrap().unwrap();
        assert_eq!(ev.kind.slot(), SlotId(1));
        assert_eq!(ev.sent_at, ClockValue::new(0, 1000));

        ch.send_grant(SlotId(1), clock.now()).unwrap();
        let timeout = Duration::from_millis(10);
        assert_eq!(w0.recv_grant(timeout), Ok(None));
        let grant = w1.recv_grant(timeout).unwrap().unwrap();
        assert!(grant.granted);
        assert_eq!(grant.sender, SlotId(1));
    }

    #[test]
    fn test_grant_to_gone_worker() {
        let (clock, mut ch) = channel(1);
        let w = ch.connect(SlotId(0)).unwrap();
        drop(w);
        assert_eq!(
            ch.send_grant(SlotId(0), clock.now()),
            Err(ChannelError::GrantUndeliverable(SlotId(0)))
        );
        ch.disconnect(SlotId(0));
        assert_eq!(
            ch.send_grant(SlotId(0), clock.now()),
            Err(ChannelError::UnknownTarget(SlotId(0)))
        );
    }

    #[test]
    fn test_blocked_flag_visible_to_worker() {
        let (_clock, mut ch) = channel(1);
        let w = ch.connect(SlotId(0)).unwrap();
        assert!(!w.is_blocked());
        ch.set_blocked(SlotId(0), true);
        assert!(w.is_blocked());
    }

    #[test]
    fn test_close_disconnects_workers() {
        let (_clock, mut ch) = channel(1);
        let w = ch.connect(SlotId(0)).unwrap();
        ch.close();
        assert_eq!(
            w.recv_grant(Duration::from_millis(1)),
            Err(ChannelError::Disconnected)
        );
    }
}
