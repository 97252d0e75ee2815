use std::rc::{Rc, Weak};

use log::warn;

use crate::mem::request::ExecContext;

/// LL/SC reservations are tracked at this granularity.
pub const LOCK_GRANULARITY: u64 = 16;

/// Consecutive store-conditional failures of one context between liveness warnings.
pub const ST_COND_WARN_INTERVAL: u64 = 1_000_000;

#[derive(Debug)]
struct LockedAddr {
    addr: u64,
    owner: Weak<ExecContext>,
}

impl LockedAddr {
    fn matches_addr(&self, addr: u64) -> bool {
        self.addr == lock_align(addr)
    }

    fn owned_by(&self, context: &Rc<ExecContext>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Rc::as_ptr(context))
    }
}

/// Whether a run of `failures` consecutive failed store-conditionals deserves a warning.
pub fn livelock_suspected(failures: u64) -> bool {
    failures > 0 && failures % ST_COND_WARN_INTERVAL == 0
}

pub fn lock_align(addr: u64) -> u64 {
    addr & !(LOCK_GRANULARITY - 1)
}

/// Outstanding load-locked reservations, at most one per execution context.
#[derive(Debug, Default)]
pub struct LockedAddressTracker {
    // most recent reservation first
    entries: Vec<LockedAddr>,
}

impl LockedAddressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Address currently reserved by `context`.
    pub fn reserved_by(&self, context: &Rc<ExecContext>) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.owned_by(context))
            .map(|e| e.addr)
    }

    /// Record a load-locked of `addr` by `context`.
    pub fn track(&mut self, addr: u64, context: &Rc<ExecContext>) {
        let addr = lock_align(addr);
        context.set_lock_flag(true);
        self.entries.retain(|e| e.owner.strong_count() > 0);
        if let Some(entry) = self.entries.iter_mut().find(|e| e.owned_by(context)) {
            entry.addr = addr;
            return;
        }
        self.entries.insert(
            0,
            LockedAddr {
                addr,
                owner: Rc::downgrade(context),
            },
        );
    }

    /// Resolve a store to `addr`.  Any store to a reserved address kills every reservation on it;
    /// a store-conditional succeeds only if `context` held one of them and its lock flag is still
    /// set.  Plain stores always succeed.
    pub fn resolve(
        &mut self,
        addr: u64,
        context: Option<&Rc<ExecContext>>,
        is_conditional: bool,
    ) -> bool {
        let mut success = !is_conditional;
        let mut idx = 0;
        while idx < self.entries.len() {
            if !self.entries[idx].matches_addr(addr) {
                idx += 1;
                continue;
            }
            let entry = self.entries.remove(idx);
            let owner = entry.owner.upgrade();
            if let (Some(owner), Some(ctx)) = (owner.as_ref(), context) {
                if is_conditional && Rc::ptr_eq(owner, ctx) {
                    success = ctx.lock_flag();
                }
            }
            if let Some(owner) = owner {
                owner.clear_lock();
            }
        }

        if is_conditional {
            if let Some(ctx) = context {
                let failures = ctx.record_st_cond(success);
                if livelock_suspected(failures) {
                    warn!(
                        "context {} (cpu {}): {} consecutive store-conditional failures, possible livelock",
                        ctx.id(),
                        ctx.cpu_id(),
                        failures
                    );
                }
            }
        }
        success
    }

    /// Drop all reservations; used when restoring from a checkpoint.
    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            if let Some(owner) = entry.owner.upgrade() {
                owner.clear_lock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_streak_warns_every_interval_and_resets_on_success() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        for _ in 0..ST_COND_WARN_INTERVAL - 1 {
            assert!(!t.resolve(0x40, Some(&c), true));
        }
        assert!(!livelock_suspected(c.st_cond_failures()));
        assert!(!t.resolve(0x40, Some(&c), true));
        assert_eq!(ST_COND_WARN_INTERVAL, c.st_cond_failures());
        assert!(livelock_suspected(c.st_cond_failures()));

        // the streak keeps counting past the warning
        assert!(!t.resolve(0x40, Some(&c), true));
        assert_eq!(ST_COND_WARN_INTERVAL + 1, c.st_cond_failures());
        assert!(!livelock_suspected(c.st_cond_failures()));
        assert!(livelock_suspected(2 * ST_COND_WARN_INTERVAL));
        assert!(!livelock_suspected(0));

        t.track(0x40, &c);
        assert!(t.resolve(0x40, Some(&c), true));
        assert_eq!(0, c.st_cond_failures());
    }

    #[test]
    fn ll_sc_without_interference_succeeds() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        t.track(0x1008, &c);
        assert!(t.resolve(0x1008, Some(&c), true));
        assert!(t.is_empty());
        assert!(!c.lock_flag());
    }

    #[test]
    fn other_context_store_invalidates_reservation() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        let d = ExecContext::new(1, 1);
        t.track(0x2000, &c);
        assert!(t.resolve(0x2004, Some(&d), false));
        assert!(!t.resolve(0x2000, Some(&c), true));
        assert_eq!(1, c.st_cond_failures());
    }

    #[test]
    fn other_context_store_conditional_also_invalidates() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        let d = ExecContext::new(1, 1);
        t.track(0x2000, &c);
        // d holds no reservation, so its SC fails, but it still kills c's
        assert!(!t.resolve(0x2000, Some(&d), true));
        assert!(!t.resolve(0x2000, Some(&c), true));
    }

    #[test]
    fn sc_without_reservation_fails_and_plain_store_succeeds() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        assert!(!t.resolve(0x40, Some(&c), true));
        assert!(t.resolve(0x40, Some(&c), false));
        assert!(t.resolve(0x40, None, false));
    }

    #[test]
    fn cleared_lock_flag_fails_matching_sc() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        t.track(0x80, &c);
        c.clear_lock();
        assert!(!t.resolve(0x80, Some(&c), true));
        assert!(t.is_empty());
    }

    #[test]
    fn one_reservation_per_context() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        t.track(0x100, &c);
        t.track(0x200, &c);
        assert_eq!(1, t.len());
        assert_eq!(Some(0x200), t.reserved_by(&c));
        // old address is no longer reserved
        assert!(t.resolve(0x100, Some(&c), false));
        assert_eq!(1, t.len());
        assert!(t.resolve(0x200, Some(&c), true));
    }

    #[test]
    fn reservations_use_lock_granularity() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        t.track(0x1000, &c);
        // same 16-byte block
        t.resolve(0x100c, None, false);
        assert!(!c.lock_flag());
        assert!(t.is_empty());

        t.track(0x1000, &c);
        t.resolve(0x1010, None, false);
        assert!(c.lock_flag());
        assert_eq!(1, t.len());
    }

    #[test]
    fn many_contexts_track_independently() {
        let mut t = LockedAddressTracker::new();
        let ctxs: Vec<_> = (0..4).map(|i| ExecContext::new(i, i)).collect();
        for (i, c) in ctxs.iter().enumerate() {
            t.track(0x1000 * (i as u64 + 1), c);
        }
        assert_eq!(4, t.len());
        assert!(t.resolve(0x3000, Some(&ctxs[2]), true));
        assert!(t.resolve(0x1000, Some(&ctxs[0]), true));
        assert_eq!(2, t.len());
    }

    #[test]
    fn dropped_contexts_are_pruned() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        {
            let gone = ExecContext::new(1, 0);
            t.track(0x40, &gone);
        }
        t.track(0x80, &c);
        assert_eq!(1, t.len());
    }

    #[test]
    fn clear_drops_locks() {
        let mut t = LockedAddressTracker::new();
        let c = ExecContext::new(0, 0);
        t.track(0x40, &c);
        t.clear();
        assert!(t.is_empty());
        assert!(!c.lock_flag());
    }
}
