use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;

use crate::base::mem::{check_access_shape, MemoryDevice};
use crate::cache::falru::FalruCache;
use crate::error::ConfigResult;
use crate::interconnect::InterconnectInterface;
use crate::mem::controller::MemoryController;
use crate::mem::range::{AddrRange, PhysAddrLayout};
use crate::mem::request::{MemCmd, MemReq, ReqFlags};
use crate::stats::{Counter, StatsSink};
use crate::timeq::Cycle;

/// Slave side of the memory bus.  Performs the functional access through the controller as soon
/// as a request is delivered and asks for the response `latency` cycles later.
pub struct MemorySlave {
    name: String,
    controller: Rc<RefCell<MemoryController>>,
    layout: PhysAddrLayout,
    /// Canonical range this port answers for; everything the controller decodes when unset.
    claims: Option<AddrRange>,
    latency: Cycle,
    /// 0 means unlimited.
    max_outstanding: usize,
    pending: VecDeque<Cycle>,
    accesses: Counter,
    faults: Counter,
}

impl MemorySlave {
    pub fn new(
        name: impl Into<String>,
        controller: Rc<RefCell<MemoryController>>,
        latency: Cycle,
        max_outstanding: usize,
        stats: &StatsSink,
    ) -> ConfigResult<Self> {
        let name = name.into();
        let layout = controller.borrow().table().layout();
        Ok(Self {
            accesses: stats.counter(format!("{}.accesses", name))?,
            faults: stats.counter(format!("{}.faults", name))?,
            name,
            controller,
            layout,
            claims: None,
            latency,
            max_outstanding,
            pending: VecDeque::new(),
        })
    }

    /// Answer only for `range` (and its uncached alias), e.g. one port per bank.
    pub fn with_range(mut self, range: AddrRange) -> Self {
        self.claims = Some(self.layout.canonical_range(range));
        self
    }

    /// Responses not yet due at `now`.
    pub fn pending_at(&self, now: Cycle) -> usize {
        self.pending.iter().filter(|&&at| at > now).count()
    }

    fn functional_access(&self, req: &MemReq) {
        let size = req.size as usize;
        let page_bytes = self.controller.borrow().page_bytes();
        let result = if let Err(fault) = check_access_shape(req.paddr, req.size, page_bytes) {
            Err(fault)
        } else if req.cmd.is_read() {
            let mut buf = vec![0u8; size];
            let result = self.controller.borrow_mut().read(req, &mut buf);
            if result.is_ok() {
                *req.data_mut() = buf;
            }
            result
        } else {
            let mut data = req.data().clone();
            data.resize(size, 0);
            self.controller.borrow_mut().write(req, &data)
        };
        if let Err(fault) = result {
            self.faults.inc();
            debug!("{}: {:?} at {:#x}", self.name, fault, req.paddr);
        }
        // NO_FAULT accesses complete silently; a read comes back without data.
        if req.flags.contains(ReqFlags::NO_FAULT) {
            req.set_fault(None);
        } else {
            req.set_fault(result.err());
        }
    }
}

impl InterconnectInterface for MemorySlave {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_master(&self) -> bool {
        false
    }

    fn is_blocked(&self, now: Cycle) -> bool {
        self.max_outstanding > 0 && self.pending_at(now) >= self.max_outstanding
    }

    fn contains(&self, paddr: u64) -> bool {
        let claimed = self
            .claims
            .map_or(true, |range| range.contains(self.layout.canonical(paddr)));
        claimed && self.controller.borrow().decodes(paddr)
    }

    fn access(&mut self, req: Rc<MemReq>, now: Cycle) -> Option<Cycle> {
        self.accesses.inc();
        self.functional_access(&req);
        if req.cmd == MemCmd::Writeback {
            return None;
        }
        let at = now + self.latency;
        self.pending.retain(|&due| due > now);
        self.pending.push_back(at);
        Some(at)
    }
}

/// A request handed back to the issuing master.
#[derive(Debug, Clone)]
pub struct Completion {
    pub req: Rc<MemReq>,
    pub issued: Cycle,
    pub completed: Cycle,
}

impl Completion {
    pub fn latency(&self) -> Cycle {
        self.completed - self.issued
    }
}

/// Master side: a CPU cache port.  Completions queue up until the driver drains them.
pub struct CpuPort {
    name: String,
    cpu_id: usize,
    blocked: bool,
    completions: VecDeque<Completion>,
    /// Tag-only cache model fed with every cacheable issued address, for size-sweep statistics.
    tags: Option<FalruCache>,
    layout: PhysAddrLayout,
    issued: Counter,
    uncached: Counter,
    completed: Counter,
    latency: Counter,
}

impl CpuPort {
    pub fn new(name: impl Into<String>, cpu_id: usize, stats: &StatsSink) -> ConfigResult<Self> {
        let name = name.into();
        Ok(Self {
            issued: stats.counter(format!("{}.issued", name))?,
            completed: stats.counter(format!("{}.completed", name))?,
            latency: stats.counter(format!("{}.latency", name))?,
            uncached: stats.counter(format!("{}.uncached", name))?,
            name,
            cpu_id,
            layout: PhysAddrLayout::default(),
            blocked: false,
            completions: VecDeque::new(),
            tags: None,
        })
    }

    pub fn with_tags(mut self, cache: FalruCache) -> Self {
        self.tags = Some(cache);
        self
    }

    /// Address layout used to recognise the uncached alias.
    pub fn with_layout(mut self, layout: PhysAddrLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn tags(&self) -> Option<&FalruCache> {
        self.tags.as_ref()
    }

    pub fn tags_mut(&mut self) -> Option<&mut FalruCache> {
        self.tags.as_mut()
    }

    /// Account for a request about to be sent and run it past the tag model.  Uncacheable
    /// accesses, flagged or through the uncached alias, bypass the tags.
    pub fn observe_issue(&mut self, req: &MemReq) {
        self.issued.inc();
        if req.flags.contains(ReqFlags::UNCACHEABLE) || self.layout.is_uncached(req.paddr) {
            self.uncached.inc();
            return;
        }
        if let Some(tags) = self.tags.as_mut() {
            let (blk, _) = tags.lookup(req.paddr);
            if blk.is_none() {
                tags.insert_after_miss(req.paddr);
            }
        }
    }

    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    pub fn pop_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    pub fn completions(&self) -> impl Iterator<Item = &Completion> {
        self.completions.iter()
    }

    pub fn outstanding(&self) -> u64 {
        self.issued.value() - self.completed.value()
    }
}

impl InterconnectInterface for CpuPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_master(&self) -> bool {
        true
    }

    fn is_blocked(&self, _now: Cycle) -> bool {
        self.blocked
    }

    fn deliver(&mut self, req: Rc<MemReq>, now: Cycle) {
        let completion = Completion {
            issued: req.time,
            completed: now,
            req,
        };
        self.completed.inc();
        self.latency.add(completion.latency());
        self.completions.push_back(completion);
    }
}
