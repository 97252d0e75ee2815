use std::cmp::max;
use std::collections::VecDeque;
use std::rc::Rc;

use log::{debug, trace};
use serde::Deserialize;
use smallvec::SmallVec;

use crate::error::{require_at_least, ConfigResult, TopologyError};
use crate::interconnect::{
    insert_by_time, InterconnectDelivery, InterconnectRequest, InterfaceHandle, InterfaceId,
    Interconnect,
};
use crate::mem::request::MemReq;
use crate::sim::config::Config;
use crate::stats::{Counter, CounterVec, StatsSink};
use crate::timeq::{ceil_div_u64, Cycle, EventQueue};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct InterconnectConfig {
    /// Bytes moved per beat.
    pub width: u64,
    /// Simulator cycles per interconnect cycle.
    pub clock: u64,
    pub transfer_delay: u64,
    pub arbitration_delay: u64,
    pub cpu_count: usize,
}

impl Config for InterconnectConfig {}

impl Default for InterconnectConfig {
    fn default() -> Self {
        Self {
            width: 64,
            clock: 1,
            transfer_delay: 1,
            arbitration_delay: 1,
            cpu_count: 1,
        }
    }
}

impl InterconnectConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        require_at_least("interconnect width", self.width, 1)?;
        require_at_least("interconnect clock", self.clock, 1)?;
        require_at_least("interconnect cpu_count", self.cpu_count as u64, 1)?;
        Ok(())
    }

    pub fn arbitration_cycles(&self) -> Cycle {
        self.arbitration_delay * self.clock
    }

    pub fn transfer_cycles(&self) -> Cycle {
        self.transfer_delay * self.clock
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum IcnEvent {
    Arbitrate,
    Deliver,
}

struct Attached {
    handle: InterfaceHandle,
    is_master: bool,
    src_latency: Counter,
    dst_latency: Counter,
    delivered: Counter,
}

struct IcnCounters {
    requests: Counter,
    grants: Counter,
    deliveries: Counter,
    queue_cycles: Counter,
    arbitration_cycles: Counter,
    blocked_skips: Counter,
    bytes: Counter,
    beats: Counter,
    /// Deepest the request queue has been.
    max_queued: Counter,
    cpu_requests: CounterVec,
}

/// Interconnect with unbounded bandwidth: every eligible request is granted in the cycle it is
/// arbitrated, so only the fixed arbitration and transfer delays and destination backpressure
/// shape the timing.
pub struct IdealInterconnect {
    name: String,
    config: InterconnectConfig,
    stats: StatsSink,
    interfaces: Vec<Attached>,
    request_queue: VecDeque<InterconnectRequest>,
    delivery_queue: VecDeque<InterconnectDelivery>,
    events: EventQueue<IcnEvent>,
    counters: IcnCounters,
}

impl IdealInterconnect {
    pub fn new(
        name: impl Into<String>,
        config: InterconnectConfig,
        stats: &StatsSink,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let name = name.into();
        let cpu_labels: Vec<String> = (0..config.cpu_count).map(|i| format!("cpu{}", i)).collect();
        let counters = IcnCounters {
            requests: stats.counter(format!("{}.requests", name))?,
            grants: stats.counter(format!("{}.grants", name))?,
            deliveries: stats.counter(format!("{}.deliveries", name))?,
            queue_cycles: stats.counter(format!("{}.queue_cycles", name))?,
            arbitration_cycles: stats.counter(format!("{}.arbitration_cycles", name))?,
            blocked_skips: stats.counter(format!("{}.blocked_skips", name))?,
            bytes: stats.counter(format!("{}.bytes", name))?,
            beats: stats.counter(format!("{}.beats", name))?,
            max_queued: stats.counter(format!("{}.max_queued", name))?,
            cpu_requests: stats
                .counter_vec(&format!("{}.cpu_requests", name), cpu_labels.as_slice())?,
        };
        Ok(Self {
            name,
            config,
            stats: stats.clone(),
            interfaces: Vec::new(),
            request_queue: VecDeque::new(),
            delivery_queue: VecDeque::new(),
            events: EventQueue::new(),
            counters,
        })
    }

    pub fn config(&self) -> &InterconnectConfig {
        &self.config
    }

    pub fn interface(&self, id: InterfaceId) -> Option<&InterfaceHandle> {
        self.interfaces.get(id).map(|iface| &iface.handle)
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// The single slave supplying `paddr`.
    pub fn route(&self, paddr: u64) -> Result<InterfaceId, TopologyError> {
        let matches: SmallVec<[InterfaceId; 2]> = self
            .interfaces
            .iter()
            .enumerate()
            .filter(|(_, iface)| !iface.is_master && iface.handle.borrow().contains(paddr))
            .map(|(id, _)| id)
            .collect();
        match matches.len() {
            1 => Ok(matches[0]),
            0 => Err(TopologyError::NoSupplier {
                interconnect: self.name.clone(),
                paddr,
            }),
            count => Err(TopologyError::AmbiguousSupplier {
                interconnect: self.name.clone(),
                paddr,
                count,
            }),
        }
    }

    fn check_id(&self, id: InterfaceId) -> Result<(), TopologyError> {
        if id < self.interfaces.len() {
            Ok(())
        } else {
            Err(TopologyError::UnknownInterface {
                interconnect: self.name.clone(),
                id,
            })
        }
    }

    /// Responses travel back to the stamped origin.  Everything else goes to its explicit target,
    /// or for a master, to the slave that owns the address.
    fn destination(&self, req: &MemReq, from: InterfaceId) -> Result<InterfaceId, TopologyError> {
        if let Some(origin) = req.origin() {
            if origin != from {
                return Ok(origin);
            }
        }
        if let Some(target) = req.target {
            self.check_id(target)?;
            return Ok(target);
        }
        if self.interfaces[from].is_master {
            self.route(req.paddr)
        } else {
            Err(TopologyError::NoOrigin {
                interconnect: self.name.clone(),
                req_id: req.id,
            })
        }
    }

    fn is_blocked(&self, id: InterfaceId, now: Cycle) -> bool {
        self.interfaces[id].handle.borrow().is_blocked(now)
    }
}

impl Interconnect for IdealInterconnect {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, iface: InterfaceHandle) -> ConfigResult<InterfaceId> {
        let (iface_name, is_master) = {
            let i = iface.borrow();
            (i.name().to_string(), i.is_master())
        };
        let prefix = format!("{}.{}", self.name, iface_name);
        let attached = Attached {
            src_latency: self.stats.counter(format!("{}.src_latency", prefix))?,
            dst_latency: self.stats.counter(format!("{}.dst_latency", prefix))?,
            delivered: self.stats.counter(format!("{}.delivered", prefix))?,
            handle: iface,
            is_master,
        };
        let id = self.interfaces.len();
        self.interfaces.push(attached);
        debug!("{}: attached {} as interface {}", self.name, iface_name, id);
        Ok(id)
    }

    fn send(
        &mut self,
        req: Rc<MemReq>,
        time: Cycle,
        from: InterfaceId,
    ) -> Result<(), TopologyError> {
        self.check_id(from)?;
        let to = self.destination(&req, from)?;
        let from_master = self.interfaces[from].is_master;
        if from_master && req.origin().is_none() {
            req.set_origin(from);
        }

        self.counters.requests.inc();
        self.counters.bytes.add(req.size as u64);
        self.counters
            .beats
            .add(ceil_div_u64(req.size as u64, self.config.width));
        if from_master {
            if let Some(cpu) = req.cpu_id().filter(|&cpu| cpu < self.counters.cpu_requests.len()) {
                self.counters.cpu_requests.get(cpu).inc();
            }
        }
        trace!(
            "{}: send req {} ({:#x}) {} -> {} at {}",
            self.name,
            req.id,
            req.paddr,
            from,
            to,
            time
        );

        insert_by_time(
            &mut self.request_queue,
            InterconnectRequest { req, time, from, to },
            |r| r.time,
        );
        self.counters
            .max_queued
            .record_max(self.request_queue.len() as u64);
        self.events
            .schedule(time + self.config.arbitration_cycles(), IcnEvent::Arbitrate);
        Ok(())
    }

    fn arbitrate(&mut self, cycle: Cycle) {
        let arb = self.config.arbitration_cycles();
        self.counters.arbitration_cycles.inc();

        let mut deferred = VecDeque::new();
        let mut granted = false;
        while let Some(head) = self.request_queue.front() {
            if head.time + arb > cycle {
                break;
            }
            let Some(r) = self.request_queue.pop_front() else {
                break;
            };
            if self.is_blocked(r.to, cycle) {
                self.counters.blocked_skips.inc();
                deferred.push_back(r);
                continue;
            }
            self.counters.grants.inc();
            self.counters.queue_cycles.add(cycle - r.time);
            insert_by_time(
                &mut self.delivery_queue,
                InterconnectDelivery {
                    req: r.req,
                    time: cycle,
                    sent_at: r.time,
                    from: r.from,
                    to: r.to,
                },
                |d| d.time,
            );
            granted = true;
        }
        while let Some(r) = deferred.pop_back() {
            self.request_queue.push_front(r);
        }

        if granted {
            self.events
                .schedule(cycle + self.config.transfer_cycles(), IcnEvent::Deliver);
        }
        if let Some(head) = self.request_queue.front() {
            self.events
                .schedule(max(cycle + 1, head.time + arb), IcnEvent::Arbitrate);
        }
    }

    fn deliver(&mut self, cycle: Cycle) -> Result<(), TopologyError> {
        let xfer = self.config.transfer_cycles();

        let mut deferred = VecDeque::new();
        let mut responses: Vec<(Rc<MemReq>, Cycle, InterfaceId)> = Vec::new();
        while let Some(head) = self.delivery_queue.front() {
            if head.time + xfer > cycle {
                break;
            }
            let Some(d) = self.delivery_queue.pop_front() else {
                break;
            };
            if self.is_blocked(d.to, cycle) {
                self.counters.blocked_skips.inc();
                deferred.push_back(d);
                continue;
            }

            let latency = cycle - d.sent_at;
            self.interfaces[d.from].src_latency.add(latency);
            self.interfaces[d.to].dst_latency.add(latency);
            self.interfaces[d.to].delivered.inc();
            self.counters.deliveries.inc();
            trace!(
                "{}: deliver req {} {} -> {} at {} (sent {})",
                self.name,
                d.req.id,
                d.from,
                d.to,
                cycle,
                d.sent_at
            );

            let dest = Rc::clone(&self.interfaces[d.to].handle);
            if self.interfaces[d.to].is_master {
                dest.borrow_mut().deliver(d.req, cycle);
            } else {
                let respond_at = dest.borrow_mut().access(Rc::clone(&d.req), cycle);
                if let Some(at) = respond_at {
                    responses.push((d.req, max(at, cycle), d.to));
                }
            }
        }
        while let Some(d) = deferred.pop_back() {
            self.delivery_queue.push_front(d);
        }

        if let Some(head) = self.delivery_queue.front() {
            self.events
                .schedule(max(cycle + 1, head.time + xfer), IcnEvent::Deliver);
        }

        for (req, at, from) in responses {
            self.send(req, at, from)?;
        }
        Ok(())
    }

    fn next_event_at(&self) -> Option<Cycle> {
        self.events.next_at()
    }

    fn service(&mut self, now: Cycle) -> Result<(), TopologyError> {
        while let Some((when, event)) = self.events.pop_due(now) {
            match event {
                IcnEvent::Arbitrate => self.arbitrate(when),
                IcnEvent::Deliver => self.deliver(when)?,
            }
        }
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.request_queue.len() + self.delivery_queue.len()
    }
}
