use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::mem::request::MemReq;

/// Default page-sized unit for access shape checks.
pub const PAGE_BYTES: u64 = 8 << 10;

/// Faults reported by a memory access.  Returned to the caller, never raised.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("alignment fault")]
    Alignment,
    #[error("machine check fault")]
    MachineCheck,
}

pub type AccessResult = Result<(), Fault>;

/// Power-of-two accesses up to a page must be naturally aligned.  Anything else (block copies of
/// odd sizes) must stay within one page-aligned region.
pub fn check_access_shape(paddr: u64, size: u32, page_bytes: u64) -> AccessResult {
    let size = size as u64;
    if size == 0 {
        return Err(Fault::Alignment);
    }
    if size.is_power_of_two() && size <= page_bytes {
        if paddr & (size - 1) != 0 {
            return Err(Fault::Alignment);
        }
        return Ok(());
    }
    if (paddr % page_bytes) + size > page_bytes {
        return Err(Fault::MachineCheck);
    }
    Ok(())
}

/// Trait for simulated memory-mapped devices.  Devices are polymorphic only over their name and
/// the two access entry points.
pub trait MemoryDevice {
    fn name(&self) -> &str;

    fn page_bytes(&self) -> u64 {
        PAGE_BYTES
    }

    fn read_impl(&mut self, req: &MemReq, buf: &mut [u8]) -> AccessResult;
    fn read(&mut self, req: &MemReq, buf: &mut [u8]) -> AccessResult {
        // the requester must size the buffer to the request
        assert_eq!(buf.len(), req.size as usize, "buffer does not match request size");
        check_access_shape(req.paddr, req.size, self.page_bytes())?;
        self.read_impl(req, buf)
    }

    fn write_impl(&mut self, req: &MemReq, data: &[u8]) -> AccessResult;
    fn write(&mut self, req: &MemReq, data: &[u8]) -> AccessResult {
        assert_eq!(data.len(), req.size as usize, "buffer does not match request size");
        check_access_shape(req.paddr, req.size, self.page_bytes())?;
        self.write_impl(req, data)
    }
}

pub type DeviceHandle = Rc<RefCell<dyn MemoryDevice>>;
