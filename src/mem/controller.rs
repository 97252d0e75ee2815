use log::debug;

use crate::base::mem::{AccessResult, DeviceHandle, Fault, MemoryDevice};
use crate::error::ConfigResult;
use crate::mem::range::{AddrRange, AddressRangeTable, PhysAddrLayout};
use crate::mem::request::MemReq;
use crate::stats::{Counter, StatsSink};

/// Routes every access to the device that owns its address.  The controller never touches the
/// data; whatever the device returns is handed back unchanged.
pub struct MemoryController {
    name: String,
    table: AddressRangeTable,
    reads: Counter,
    writes: Counter,
    unmapped: Counter,
}

impl MemoryController {
    pub fn new(
        name: impl Into<String>,
        map_slots: usize,
        layout: PhysAddrLayout,
        stats: &StatsSink,
    ) -> ConfigResult<Self> {
        let name = name.into();
        Ok(Self {
            table: AddressRangeTable::new(map_slots, layout)?,
            reads: stats.counter(format!("{}.reads", name))?,
            writes: stats.counter(format!("{}.writes", name))?,
            unmapped: stats.counter(format!("{}.unmapped_faults", name))?,
            name,
        })
    }

    pub fn map(&mut self, device: DeviceHandle, range: AddrRange) -> ConfigResult<()> {
        self.table.add(device, range)
    }

    pub fn remap(
        &mut self,
        device: &DeviceHandle,
        old: AddrRange,
        new: AddrRange,
    ) -> ConfigResult<()> {
        self.table.update(device, old, new)
    }

    pub fn unmap(&mut self, device: &DeviceHandle, range: AddrRange) -> ConfigResult<()> {
        self.table.remove(device, range)
    }

    pub fn table(&self) -> &AddressRangeTable {
        &self.table
    }

    /// Whether any device claims `addr`.
    pub fn decodes(&self, addr: u64) -> bool {
        self.table.find_range(addr).is_some()
    }

    fn route(&mut self, req: &MemReq) -> Result<DeviceHandle, Fault> {
        match self.table.find(req.paddr) {
            Some(device) => Ok(device),
            None => {
                self.unmapped.inc();
                debug!("{}: no device at {:#x}", self.name, req.paddr);
                Err(Fault::MachineCheck)
            }
        }
    }
}

impl MemoryDevice for MemoryController {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_impl(&mut self, req: &MemReq, buf: &mut [u8]) -> AccessResult {
        self.reads.inc();
        let device = self.route(req)?;
        let result = device.borrow_mut().read(req, buf);
        result
    }

    fn write_impl(&mut self, req: &MemReq, data: &[u8]) -> AccessResult {
        self.writes.inc();
        let device = self.route(req)?;
        let result = device.borrow_mut().write(req, data);
        result
    }
}
