//! Interconnects between bus masters (CPU-side cache ports) and slaves (memory banks).
//!
//! Every in-flight request moves through the same states:
//!     Sent -> Queued (request queue) -> Granted (delivery queue) -> Delivered
//! Both queues are kept ordered by time, oldest first, so requests between the same pair of
//! interfaces arrive in the order they were sent.

pub mod ideal;
pub mod ports;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{ConfigResult, TopologyError};
use crate::mem::request::MemReq;
use crate::timeq::Cycle;

pub use ideal::{IdealInterconnect, InterconnectConfig};
pub use ports::{Completion, CpuPort, MemorySlave};

pub type InterfaceId = usize;

/// One endpoint attached to an interconnect.
pub trait InterconnectInterface {
    fn name(&self) -> &str;

    fn is_master(&self) -> bool;

    /// Backpressure: a blocked interface is skipped by arbitration and delivery.
    fn is_blocked(&self, _now: Cycle) -> bool {
        false
    }

    /// Whether this slave supplies `paddr`.
    fn contains(&self, _paddr: u64) -> bool {
        false
    }

    /// Slave entry point.  Returns the cycle at which a response should be sent back to the
    /// requesting master, if the access produces one.
    fn access(&mut self, req: Rc<MemReq>, now: Cycle) -> Option<Cycle> {
        panic!(
            "{}: access of request {} at {} on an interface that is not a slave",
            self.name(),
            req.id,
            now
        );
    }

    /// Master entry point for responses and cache-to-cache transfers.
    fn deliver(&mut self, req: Rc<MemReq>, now: Cycle) {
        panic!(
            "{}: delivery of request {} at {} on an interface that is not a master",
            self.name(),
            req.id,
            now
        );
    }
}

pub type InterfaceHandle = Rc<RefCell<dyn InterconnectInterface>>;

/// A request waiting for an arbitration grant.
#[derive(Debug, Clone)]
pub struct InterconnectRequest {
    pub req: Rc<MemReq>,
    pub time: Cycle,
    pub from: InterfaceId,
    pub to: InterfaceId,
}

/// A granted request waiting out its transfer delay.
#[derive(Debug, Clone)]
pub struct InterconnectDelivery {
    pub req: Rc<MemReq>,
    /// Grant cycle.
    pub time: Cycle,
    /// Cycle the request was sent.
    pub sent_at: Cycle,
    pub from: InterfaceId,
    pub to: InterfaceId,
}

/// The interconnect contract.  There is deliberately no shared default behaviour: a concrete
/// interconnect supplies its own routing, arbitration and delivery.
pub trait Interconnect {
    fn name(&self) -> &str;

    fn attach(&mut self, iface: InterfaceHandle) -> ConfigResult<InterfaceId>;

    /// Queue `req` from interface `from` at `time`.  Routing failures mean the topology is
    /// inconsistent.
    fn send(&mut self, req: Rc<MemReq>, time: Cycle, from: InterfaceId)
        -> Result<(), TopologyError>;

    /// Grant every eligible request at `cycle`.
    fn arbitrate(&mut self, cycle: Cycle);

    /// Hand every granted request whose transfer finished by `cycle` to its destination.
    fn deliver(&mut self, cycle: Cycle) -> Result<(), TopologyError>;

    /// Earliest cycle with scheduled work.
    fn next_event_at(&self) -> Option<Cycle>;

    /// Run all scheduled work due at or before `now`.
    fn service(&mut self, now: Cycle) -> Result<(), TopologyError>;

    /// Requests queued or granted but not yet delivered.
    fn outstanding(&self) -> usize;
}

/// Insert keeping `queue` ordered by `time_of`; equal times keep arrival order.
pub(crate) fn insert_by_time<T>(queue: &mut VecDeque<T>, item: T, time_of: impl Fn(&T) -> Cycle) {
    let time = time_of(&item);
    let idx = queue.partition_point(|queued| time_of(queued) <= time);
    queue.insert(idx, item);
}
