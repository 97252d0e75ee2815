use std::cell::{Cell, Ref, RefCell, RefMut};
use std::ops::BitOr;
use std::rc::Rc;

use crate::base::mem::Fault;
use crate::interconnect::InterfaceId;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemCmd {
    Read,
    Write,
    Writeback,
}

impl MemCmd {
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Writeback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ReqFlags(u32);

impl ReqFlags {
    pub const NONE: ReqFlags = ReqFlags(0);
    /// Load-locked on a read, store-conditional on a write.
    pub const LOCKED: ReqFlags = ReqFlags(1 << 0);
    pub const UNCACHEABLE: ReqFlags = ReqFlags(1 << 1);
    pub const NO_FAULT: ReqFlags = ReqFlags(1 << 2);

    pub fn contains(self, other: ReqFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ReqFlags {
    type Output = ReqFlags;

    fn bitor(self, rhs: ReqFlags) -> ReqFlags {
        ReqFlags(self.0 | rhs.0)
    }
}

/// The slice of execution-context state the memory system needs: identity plus the LL/SC lock
/// flag, which the CPU side may clear at any time (interrupts, context switches).
#[derive(Debug)]
pub struct ExecContext {
    id: usize,
    cpu_id: usize,
    lock_flag: Cell<bool>,
    st_cond_failures: Cell<u64>,
}

impl ExecContext {
    pub fn new(id: usize, cpu_id: usize) -> Rc<Self> {
        Rc::new(Self {
            id,
            cpu_id,
            lock_flag: Cell::new(false),
            st_cond_failures: Cell::new(0),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn lock_flag(&self) -> bool {
        self.lock_flag.get()
    }

    pub fn set_lock_flag(&self, value: bool) {
        self.lock_flag.set(value);
    }

    /// Asynchronous lock loss; a later store-conditional from this context fails.
    pub fn clear_lock(&self) {
        self.lock_flag.set(false);
    }

    pub fn st_cond_failures(&self) -> u64 {
        self.st_cond_failures.get()
    }

    pub(crate) fn record_st_cond(&self, success: bool) -> u64 {
        let failures = if success {
            0
        } else {
            self.st_cond_failures.get().saturating_add(1)
        };
        self.st_cond_failures.set(failures);
        failures
    }
}

/// One memory access.  Built by the requester, then shared as `Rc<MemReq>` by every stage that
/// holds it in flight.  After dispatch only the interconnect origin stamp and the completion state
/// (data, fault, store-conditional outcome) change.
#[derive(Debug)]
pub struct MemReq {
    pub id: u64,
    pub paddr: u64,
    pub size: u32,
    pub cmd: MemCmd,
    pub flags: ReqFlags,
    pub context: Option<Rc<ExecContext>>,
    pub time: Cycle,
    /// Explicit destination, used for cache-to-cache transfers.
    pub target: Option<InterfaceId>,
    origin: Cell<Option<InterfaceId>>,
    sc_result: Cell<Option<bool>>,
    data: RefCell<Vec<u8>>,
    fault: Cell<Option<Fault>>,
}

impl MemReq {
    pub fn new(cmd: MemCmd, paddr: u64, size: u32) -> Self {
        Self {
            id: 0,
            paddr,
            size,
            cmd,
            flags: ReqFlags::NONE,
            context: None,
            time: 0,
            target: None,
            origin: Cell::new(None),
            sc_result: Cell::new(None),
            data: RefCell::new(Vec::new()),
            fault: Cell::new(None),
        }
    }

    pub fn read(paddr: u64, size: u32) -> Self {
        Self::new(MemCmd::Read, paddr, size)
    }

    pub fn write(paddr: u64, size: u32) -> Self {
        Self::new(MemCmd::Write, paddr, size)
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_flags(mut self, flags: ReqFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub fn with_context(mut self, context: &Rc<ExecContext>) -> Self {
        self.context = Some(Rc::clone(context));
        self
    }

    pub fn with_time(mut self, time: Cycle) -> Self {
        self.time = time;
        self
    }

    pub fn with_target(mut self, target: InterfaceId) -> Self {
        self.target = Some(target);
        self
    }

    /// Payload carried by a timing-path write.
    pub fn with_data(self, data: Vec<u8>) -> Self {
        *self.data.borrow_mut() = data;
        self
    }

    pub fn data(&self) -> Ref<'_, Vec<u8>> {
        self.data.borrow()
    }

    pub(crate) fn data_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.data.borrow_mut()
    }

    /// Fault raised when the access completed, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.fault.get()
    }

    pub(crate) fn set_fault(&self, fault: Option<Fault>) {
        self.fault.set(fault);
    }

    pub fn is_locked(&self) -> bool {
        self.flags.contains(ReqFlags::LOCKED)
    }

    pub fn is_load_locked(&self) -> bool {
        self.cmd.is_read() && self.is_locked()
    }

    pub fn is_store_conditional(&self) -> bool {
        self.cmd.is_write() && self.is_locked()
    }

    pub fn cpu_id(&self) -> Option<usize> {
        self.context.as_ref().map(|ctx| ctx.cpu_id())
    }

    pub fn origin(&self) -> Option<InterfaceId> {
        self.origin.get()
    }

    pub(crate) fn set_origin(&self, origin: InterfaceId) {
        self.origin.set(Some(origin));
    }

    /// Outcome of a store-conditional, `None` until the memory has resolved it.
    pub fn sc_result(&self) -> Option<bool> {
        self.sc_result.get()
    }

    pub(crate) fn set_sc_result(&self, success: bool) {
        self.sc_result.set(Some(success));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let f = ReqFlags::LOCKED | ReqFlags::UNCACHEABLE;
        assert!(f.contains(ReqFlags::LOCKED));
        assert!(f.contains(ReqFlags::UNCACHEABLE));
        assert!(!f.contains(ReqFlags::NO_FAULT));
        assert!(f.contains(ReqFlags::NONE));
    }

    #[test]
    fn locked_requests_classify_by_command() {
        let ctx = ExecContext::new(0, 0);
        let ll = MemReq::read(0x40, 8)
            .with_flags(ReqFlags::LOCKED)
            .with_context(&ctx);
        let sc = MemReq::write(0x40, 8).with_flags(ReqFlags::LOCKED);
        assert!(ll.is_load_locked());
        assert!(!ll.is_store_conditional());
        assert!(sc.is_store_conditional());
        assert_eq!(Some(0), ll.cpu_id());
        assert_eq!(None, sc.sc_result());
    }

    #[test]
    fn st_cond_failures_reset_on_success() {
        let ctx = ExecContext::new(1, 0);
        assert_eq!(1, ctx.record_st_cond(false));
        assert_eq!(2, ctx.record_st_cond(false));
        assert_eq!(0, ctx.record_st_cond(true));
    }
}
