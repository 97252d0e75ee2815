use std::cell::RefCell;
use std::cmp::max;
use std::rc::Rc;

use log::{debug, info, warn};
use serde::Serialize;
use toml::Table;

use crate::base::mem::MemoryDevice;
use crate::cache::falru::{FalruCache, FalruConfig};
use crate::checkpoint::{Checkpoint, CheckpointOut, Serializable};
use crate::error::{CheckpointError, ConfigError, ConfigResult, TopologyError};
use crate::interconnect::{
    CpuPort, IdealInterconnect, Interconnect, InterconnectConfig, InterconnectInterface,
    InterfaceId, MemorySlave,
};
use crate::mem::controller::MemoryController;
use crate::mem::physical::PhysicalMemory;
use crate::mem::request::{ExecContext, MemReq};
use crate::sim::config::{Config, MemConfig, SimConfig};
use crate::sim::traffic::{TrafficConfig, TrafficGen};
use crate::stats::StatsSink;
use crate::timeq::Cycle;

/// Every section of a machine description.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    pub sim: SimConfig,
    pub mem: MemConfig,
    pub cache: FalruConfig,
    pub interconnect: InterconnectConfig,
    pub traffic: TrafficConfig,
}

impl SystemConfig {
    pub fn from_table(table: &Table) -> Self {
        Self {
            sim: SimConfig::from_section(table.get("sim")),
            mem: MemConfig::from_section(table.get("mem")),
            cache: FalruConfig::from_section(table.get("cache")),
            interconnect: InterconnectConfig::from_section(table.get("interconnect")),
            traffic: TrafficConfig::from_section(table.get("traffic")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub cycles: Cycle,
    pub issued: u64,
    pub completed: u64,
    pub timed_out: bool,
}

struct Cpu {
    port: Rc<RefCell<CpuPort>>,
    port_id: InterfaceId,
    context: Rc<ExecContext>,
    traffic: TrafficGen,
    next_issue: Cycle,
    inflight: usize,
}

/// Synthetic CPUs driving a memory bus in front of a memory controller.
pub struct System {
    config: SystemConfig,
    stats: StatsSink,
    cycle: Cycle,
    next_req_id: u64,
    draining: bool,
    membus: IdealInterconnect,
    controller: Rc<RefCell<MemoryController>>,
    banks: Vec<Rc<RefCell<PhysicalMemory>>>,
    cpus: Vec<Cpu>,
}

impl System {
    pub fn new(config: SystemConfig) -> ConfigResult<Self> {
        let stats = StatsSink::new();
        config.mem.validate()?;
        let num_cpus = config.traffic.num_cpus;
        if num_cpus == 0 {
            return Err(ConfigError::TooSmall {
                what: "traffic num_cpus",
                value: 0,
                min: 1,
            });
        }

        let layout = config.mem.layout;
        let mut controller =
            MemoryController::new("memctrl", config.mem.map_slots, layout, &stats)?;
        let mut banks = Vec::with_capacity(config.mem.banks.len());
        for (i, bank) in config.mem.banks.iter().enumerate() {
            let mem = Rc::new(RefCell::new(PhysicalMemory::new(
                format!("mem{}", i),
                bank.range(),
                layout,
                &stats,
            )?));
            controller.map(mem.clone(), bank.range())?;
            banks.push(mem);
        }
        let controller = Rc::new(RefCell::new(controller));

        let mut icn_config = config.interconnect;
        icn_config.cpu_count = max(icn_config.cpu_count, num_cpus);
        let mut membus = IdealInterconnect::new("membus", icn_config, &stats)?;
        // One bus slave per bank, all decoding through the shared controller.
        for (i, bank) in config.mem.banks.iter().enumerate() {
            let slave = MemorySlave::new(
                format!("mem{}_port", i),
                Rc::clone(&controller),
                config.mem.latency,
                config.mem.max_outstanding,
                &stats,
            )?
            .with_range(bank.range());
            membus.attach(Rc::new(RefCell::new(slave)))?;
        }

        let mut pattern = config.traffic.pattern.clone();
        pattern.seed ^= config.sim.seed;
        let mut cpus = Vec::with_capacity(num_cpus);
        for i in 0..num_cpus {
            let name = format!("cpu{}", i);
            let mut port = CpuPort::new(name.as_str(), i, &stats)?.with_layout(layout);
            if config.sim.model_tags {
                let tags = FalruCache::new(format!("{}.tags", name), &config.cache, &stats)?;
                port = port.with_tags(tags);
            }
            let port = Rc::new(RefCell::new(port));
            let port_id = membus.attach(port.clone())?;
            cpus.push(Cpu {
                port,
                port_id,
                context: ExecContext::new(i, i),
                traffic: TrafficGen::new(&pattern, i)?,
                next_issue: 0,
                inflight: 0,
            });
        }
        info!(
            "system: {} cpus, {} banks, {} membus interfaces, arbitration {} transfer {}",
            num_cpus,
            banks.len(),
            membus.interface_count(),
            icn_config.arbitration_cycles(),
            icn_config.transfer_cycles()
        );

        Ok(Self {
            config,
            stats,
            cycle: 0,
            next_req_id: 0,
            draining: false,
            membus,
            controller,
            banks,
            cpus,
        })
    }

    pub fn stats(&self) -> &StatsSink {
        &self.stats
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn membus(&self) -> &IdealInterconnect {
        &self.membus
    }

    pub fn controller(&self) -> &Rc<RefCell<MemoryController>> {
        &self.controller
    }

    pub fn bank(&self, idx: usize) -> Option<&Rc<RefCell<PhysicalMemory>>> {
        self.banks.get(idx)
    }

    pub fn cpu_port(&self, cpu: usize) -> Option<&Rc<RefCell<CpuPort>>> {
        self.cpus.get(cpu).map(|c| &c.port)
    }

    pub fn context(&self, cpu: usize) -> Option<&Rc<ExecContext>> {
        self.cpus.get(cpu).map(|c| &c.context)
    }

    pub fn in_flight(&self) -> usize {
        self.cpus.iter().map(|c| c.inflight).sum()
    }

    fn total_issued(&self) -> u64 {
        self.cpus.iter().map(|c| c.traffic.issued()).sum()
    }

    fn can_issue(&self, cpu: &Cpu) -> bool {
        let limit = self.config.traffic.max_inflight;
        !self.draining
            && cpu.traffic.issued() < self.config.traffic.requests_per_cpu
            && (limit == 0 || cpu.inflight < limit)
    }

    fn issue_due(&mut self) -> Result<(), TopologyError> {
        let now = self.cycle;
        for idx in 0..self.cpus.len() {
            if !self.can_issue(&self.cpus[idx]) || self.cpus[idx].next_issue > now {
                continue;
            }
            let id = self.next_req_id;
            self.next_req_id += 1;

            let cpu = &mut self.cpus[idx];
            let op = cpu.traffic.next_op();
            let mut req = MemReq::new(op.cmd, op.paddr, op.size)
                .with_id(id)
                .with_flags(op.flags)
                .with_context(&cpu.context)
                .with_time(now);
            if op.cmd.is_write() {
                req = req.with_data(vec![idx as u8; op.size as usize]);
            }
            {
                let mut port = cpu.port.borrow_mut();
                port.observe_issue(&req);
                if self.config.sim.check_tags {
                    if let Some(tags) = port.tags() {
                        assert!(tags.check(), "{}: tag store inconsistent", tags.name());
                    }
                }
            }
            cpu.inflight += 1;
            cpu.next_issue = now + self.config.traffic.issue_interval.max(1);
            let port_id = cpu.port_id;
            self.membus.send(Rc::new(req), now, port_id)?;
        }
        Ok(())
    }

    fn collect_completions(&mut self) {
        for cpu in self.cpus.iter_mut() {
            let mut port = cpu.port.borrow_mut();
            while let Some(done) = port.pop_completion() {
                cpu.inflight -= 1;
                if let Some(fault) = done.req.fault() {
                    debug!(
                        "{}: request {} to {:#x} faulted: {}",
                        port.name(),
                        done.req.id,
                        done.req.paddr,
                        fault
                    );
                }
            }
        }
    }

    fn next_wakeup(&self) -> Option<Cycle> {
        let issue = self
            .cpus
            .iter()
            .filter(|c| self.can_issue(c))
            .map(|c| c.next_issue)
            .min();
        match (issue, self.membus.next_event_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight() == 0 && self.membus.outstanding() == 0
    }

    /// Advance until the traffic is exhausted and everything has drained, or until `limit`.
    pub fn run_until(&mut self, limit: Cycle) -> Result<RunSummary, TopologyError> {
        let mut timed_out = false;
        loop {
            self.issue_due()?;
            self.membus.service(self.cycle)?;
            self.collect_completions();

            let Some(next) = self.next_wakeup() else {
                if !self.is_idle() {
                    warn!(
                        "system: nothing scheduled at cycle {} with {} requests in flight",
                        self.cycle,
                        self.in_flight()
                    );
                }
                break;
            };
            let next = max(next, self.cycle + 1);
            if next > limit {
                timed_out = true;
                self.cycle = limit;
                break;
            }
            self.cycle = next;
        }
        if timed_out {
            warn!(
                "system: stopped at cycle {} with {} requests in flight",
                self.cycle,
                self.in_flight()
            );
        }
        let completed = self
            .cpus
            .iter()
            .map(|c| c.traffic.issued() - c.inflight as u64)
            .sum();
        Ok(RunSummary {
            cycles: self.cycle,
            issued: self.total_issued(),
            completed,
            timed_out,
        })
    }

    pub fn run(&mut self) -> Result<RunSummary, TopologyError> {
        let limit = self.config.sim.timeout;
        self.run_until(limit)
    }

    /// Stop issuing and let every request in flight complete.
    pub fn drain(&mut self) -> Result<RunSummary, TopologyError> {
        self.draining = true;
        let limit = self.cycle.saturating_add(self.config.sim.timeout);
        let result = self.run_until(limit);
        self.draining = false;
        result
    }

    pub fn checkpoint(&self) -> Result<CheckpointOut, CheckpointError> {
        let in_flight = self.in_flight() + self.membus.outstanding();
        if in_flight > 0 {
            return Err(CheckpointError::NotDrained(in_flight));
        }
        let mut out = CheckpointOut::new();
        out.serialize_section("system", self);
        for bank in self.banks.iter() {
            let bank = bank.borrow();
            out.serialize_section(&section_name(bank.name()), &*bank);
        }
        for cpu in self.cpus.iter() {
            let port = cpu.port.borrow();
            if let Some(tags) = port.tags() {
                out.serialize_section(&section_name(tags.name()), tags);
            }
        }
        Ok(out)
    }

    pub fn restore(&mut self, cp: &Checkpoint) -> Result<(), CheckpointError> {
        self.unserialize(cp, "system")?;
        for bank in self.banks.iter() {
            let mut bank = bank.borrow_mut();
            let section = section_name(bank.name());
            bank.unserialize(cp, &section)?;
        }
        for cpu in self.cpus.iter() {
            let mut port = cpu.port.borrow_mut();
            if let Some(tags) = port.tags_mut() {
                let section = section_name(tags.name());
                if !cp.has_section(&section) {
                    warn!("system: no {} in checkpoint, tags start cold", section);
                    continue;
                }
                tags.unserialize(cp, &section)?;
            }
        }
        info!("system: restored checkpoint at cycle {}", self.cycle);
        Ok(())
    }
}

fn section_name(object: &str) -> String {
    format!("system.{}", object)
}

impl Serializable for System {
    fn serialize(&self, out: &mut CheckpointOut) {
        out.param_u64("cycle", self.cycle);
        out.param_u64("next_req_id", self.next_req_id);
        let issued: Vec<u64> = self.cpus.iter().map(|c| c.traffic.issued()).collect();
        out.array_u64("issued", &issued);
        let next_issue: Vec<u64> = self.cpus.iter().map(|c| c.next_issue).collect();
        out.array_u64("next_issue", &next_issue);
    }

    fn unserialize(&mut self, cp: &Checkpoint, section: &str) -> Result<(), CheckpointError> {
        let issued = cp.array_u64(section, "issued")?;
        let next_issue = cp.array_u64(section, "next_issue")?;
        if issued.len() != self.cpus.len() || next_issue.len() != self.cpus.len() {
            return Err(CheckpointError::Mismatch {
                section: section.to_string(),
                reason: format!(
                    "checkpoint has {} cpus, system has {}",
                    issued.len(),
                    self.cpus.len()
                ),
            });
        }
        if self.total_issued() > 0 || !self.is_idle() {
            return Err(CheckpointError::Mismatch {
                section: section.to_string(),
                reason: "restore needs a freshly built system".to_string(),
            });
        }
        self.cycle = cp.u64(section, "cycle")?;
        self.next_req_id = cp.u64(section, "next_req_id")?;
        // Generators are deterministic, so replaying their draws restores their position.
        for (cpu, (&n, &at)) in self.cpus.iter_mut().zip(issued.iter().zip(next_issue.iter())) {
            for _ in 0..n {
                cpu.traffic.next_op();
            }
            cpu.next_issue = at;
        }
        Ok(())
    }
}
