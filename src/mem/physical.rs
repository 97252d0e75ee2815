use log::debug;

use crate::base::mem::{AccessResult, Fault, MemoryDevice};
use crate::checkpoint::{Checkpoint, CheckpointOut, Serializable};
use crate::error::{CheckpointError, ConfigError, ConfigResult};
use crate::mem::locked::LockedAddressTracker;
use crate::mem::range::{AddrRange, PhysAddrLayout};
use crate::mem::request::MemReq;
use crate::stats::{Counter, StatsSink};

/// Granularity of checkpointed memory contents.  All-zero chunks are not written out.
const CHUNK_BYTES: usize = 8 << 10;

/// Flat backing store for one physical address range.  Load-locked reads and every store go
/// through the LL/SC tracker so reservations see all writes to this memory.
pub struct PhysicalMemory {
    name: String,
    range: AddrRange,
    layout: PhysAddrLayout,
    bytes: Vec<u8>,
    locks: LockedAddressTracker,
    reads: Counter,
    writes: Counter,
    sc_failures: Counter,
}

impl PhysicalMemory {
    pub fn new(
        name: impl Into<String>,
        range: AddrRange,
        layout: PhysAddrLayout,
        stats: &StatsSink,
    ) -> ConfigResult<Self> {
        let name = name.into();
        let range = layout.canonical_range(range);
        if range.is_empty() {
            return Err(ConfigError::EmptyRange {
                start: range.start,
                end: range.end,
            });
        }
        let size = usize::try_from(range.size()).map_err(|_| ConfigError::Invalid {
            what: "memory size",
            reason: format!("{:#x} bytes does not fit the host", range.size()),
        })?;
        Ok(Self {
            range,
            layout,
            bytes: vec![0u8; size],
            locks: LockedAddressTracker::new(),
            reads: stats.counter(format!("{}.reads", name))?,
            writes: stats.counter(format!("{}.writes", name))?,
            sc_failures: stats.counter(format!("{}.sc_failures", name))?,
            name,
        })
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn locks(&self) -> &LockedAddressTracker {
        &self.locks
    }

    fn offset(&self, paddr: u64, size: usize) -> Result<usize, Fault> {
        let addr = self.layout.canonical(paddr);
        if !self.range.contains(addr) {
            return Err(Fault::MachineCheck);
        }
        let offset = (addr - self.range.start) as usize;
        if offset + size > self.bytes.len() {
            return Err(Fault::MachineCheck);
        }
        Ok(offset)
    }

    /// Backdoor access for loaders and tests, bypassing timing and LL/SC.
    pub fn peek(&self, paddr: u64, n: usize) -> Option<&[u8]> {
        let offset = self.offset(paddr, n).ok()?;
        Some(&self.bytes[offset..offset + n])
    }

    pub fn poke(&mut self, paddr: u64, data: &[u8]) -> bool {
        match self.offset(paddr, data.len()) {
            Ok(offset) => {
                self.bytes[offset..offset + data.len()].copy_from_slice(data);
                true
            }
            Err(_) => false,
        }
    }
}

impl MemoryDevice for PhysicalMemory {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_impl(&mut self, req: &MemReq, buf: &mut [u8]) -> AccessResult {
        let offset = self.offset(req.paddr, buf.len())?;
        self.reads.inc();
        if req.is_load_locked() {
            if let Some(ctx) = req.context.as_ref() {
                self.locks.track(self.layout.canonical(req.paddr), ctx);
            }
        }
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_impl(&mut self, req: &MemReq, data: &[u8]) -> AccessResult {
        let offset = self.offset(req.paddr, data.len())?;
        let conditional = req.is_store_conditional();
        let success =
            self.locks
                .resolve(self.layout.canonical(req.paddr), req.context.as_ref(), conditional);
        if conditional {
            req.set_sc_result(success);
            if !success {
                self.sc_failures.inc();
                debug!("{}: store-conditional to {:#x} failed", self.name, req.paddr);
                return Ok(());
            }
        }
        self.writes.inc();
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Serializable for PhysicalMemory {
    fn serialize(&self, out: &mut CheckpointOut) {
        out.param_u64("start", self.range.start);
        out.param_u64("size", self.range.size());
        let mut chunks = Vec::new();
        for (idx, chunk) in self.bytes.chunks(CHUNK_BYTES).enumerate() {
            if chunk.iter().all(|&b| b == 0) {
                continue;
            }
            let offset = (idx * CHUNK_BYTES) as u64;
            chunks.push(offset);
            let words: Vec<u64> = chunk
                .chunks(8)
                .map(|w| {
                    let mut word = [0u8; 8];
                    word[..w.len()].copy_from_slice(w);
                    u64::from_le_bytes(word)
                })
                .collect();
            out.array_u64(&format!("chunk_{:x}", offset), &words);
        }
        out.array_u64("chunks", &chunks);
    }

    fn unserialize(&mut self, cp: &Checkpoint, section: &str) -> Result<(), CheckpointError> {
        let start = cp.u64(section, "start")?;
        let size = cp.u64(section, "size")?;
        if start != self.range.start || size != self.range.size() {
            return Err(CheckpointError::Mismatch {
                section: section.to_string(),
                reason: format!(
                    "checkpoint has [{:#x}, {:#x}), memory is {}",
                    start,
                    start.saturating_add(size),
                    self.range
                ),
            });
        }
        self.bytes.fill(0);
        self.locks.clear();
        for offset in cp.array_u64(section, "chunks")? {
            let words = cp.array_u64(section, &format!("chunk_{:x}", offset))?;
            let base = offset as usize;
            for (i, word) in words.iter().enumerate() {
                let at = base + i * 8;
                if at >= self.bytes.len() {
                    break;
                }
                let n = (self.bytes.len() - at).min(8);
                self.bytes[at..at + n].copy_from_slice(&word.to_le_bytes()[..n]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::request::{ExecContext, ReqFlags};

    fn mem(stats: &StatsSink) -> PhysicalMemory {
        PhysicalMemory::new(
            "physmem",
            AddrRange::new(0x10_0000, 0x14_0000),
            PhysAddrLayout::default(),
            stats,
        )
        .unwrap()
    }

    #[test]
    fn write_then_read_back() {
        let stats = StatsSink::new();
        let mut m = mem(&stats);
        m.write(&MemReq::write(0x10_0100, 8), &0xdead_beef_u64.to_le_bytes())
            .unwrap();
        let mut buf = [0u8; 8];
        m.read(&MemReq::read(0x10_0100, 8), &mut buf).unwrap();
        assert_eq!(0xdead_beef, u64::from_le_bytes(buf));
    }

    #[test]
    fn uncached_alias_hits_same_bytes() {
        let stats = StatsSink::new();
        let mut m = mem(&stats);
        m.poke(0x10_0200, &[7, 8]);
        let mut buf = [0u8; 2];
        m.read(&MemReq::read((1 << 43) | 0x10_0200, 2), &mut buf)
            .unwrap();
        assert_eq!([7, 8], buf);
    }

    #[test]
    fn out_of_range_is_machine_check() {
        let stats = StatsSink::new();
        let mut m = mem(&stats);
        let mut buf = [0u8; 4];
        assert_eq!(
            Err(Fault::MachineCheck),
            m.read(&MemReq::read(0x14_0000, 4), &mut buf)
        );
    }

    #[test]
    fn failed_store_conditional_leaves_memory_untouched() {
        let stats = StatsSink::new();
        let mut m = mem(&stats);
        let c = ExecContext::new(0, 0);
        let d = ExecContext::new(1, 1);

        let mut buf = [0u8; 8];
        let ll = MemReq::read(0x10_0040, 8)
            .with_flags(ReqFlags::LOCKED)
            .with_context(&c);
        m.read(&ll, &mut buf).unwrap();

        m.write(&MemReq::write(0x10_0040, 8).with_context(&d), &[1; 8])
            .unwrap();

        let sc = MemReq::write(0x10_0040, 8)
            .with_flags(ReqFlags::LOCKED)
            .with_context(&c);
        m.write(&sc, &[2; 8]).unwrap();
        assert_eq!(Some(false), sc.sc_result());
        assert_eq!(Some(&[1u8; 8][..]), m.peek(0x10_0040, 8));
        assert_eq!(Some(1), stats.get("physmem.sc_failures"));
    }

    #[test]
    fn successful_store_conditional_writes() {
        let stats = StatsSink::new();
        let mut m = mem(&stats);
        let c = ExecContext::new(0, 0);
        let mut buf = [0u8; 4];
        m.read(
            &MemReq::read(0x10_0080, 4)
                .with_flags(ReqFlags::LOCKED)
                .with_context(&c),
            &mut buf,
        )
        .unwrap();
        let sc = MemReq::write(0x10_0080, 4)
            .with_flags(ReqFlags::LOCKED)
            .with_context(&c);
        m.write(&sc, &[9; 4]).unwrap();
        assert_eq!(Some(true), sc.sc_result());
        assert_eq!(Some(&[9u8; 4][..]), m.peek(0x10_0080, 4));
    }

    #[test]
    fn checkpoint_restores_contents_and_drops_locks() {
        let stats = StatsSink::new();
        let mut m = mem(&stats);
        m.poke(0x10_0003, &[1, 2, 3]);
        m.poke(0x13_fffe, &[0xff, 0xee]);
        let mut out = CheckpointOut::new();
        out.serialize_section("system.physmem", &m);
        let text = out.to_toml_string().unwrap();

        let other_stats = StatsSink::new();
        let mut restored = mem(&other_stats);
        let c = ExecContext::new(0, 0);
        let mut buf = [0u8; 8];
        restored
            .read(
                &MemReq::read(0x10_0000, 8)
                    .with_flags(ReqFlags::LOCKED)
                    .with_context(&c),
                &mut buf,
            )
            .unwrap();
        restored.poke(0x12_0000, &[5]);

        let cp = Checkpoint::parse(&text).unwrap();
        restored.unserialize(&cp, "system.physmem").unwrap();
        assert_eq!(Some(&[1u8, 2, 3][..]), restored.peek(0x10_0003, 3));
        assert_eq!(Some(&[0xffu8, 0xee][..]), restored.peek(0x13_fffe, 2));
        assert_eq!(Some(&[0u8][..]), restored.peek(0x12_0000, 1));
        assert!(restored.locks().is_empty());
    }

    #[test]
    fn checkpoint_of_different_geometry_is_rejected() {
        let stats = StatsSink::new();
        let m = mem(&stats);
        let mut out = CheckpointOut::new();
        out.serialize_section("m", &m);
        let cp = out.into_checkpoint();
        let mut small = PhysicalMemory::new(
            "small",
            AddrRange::new(0x10_0000, 0x10_1000),
            PhysAddrLayout::default(),
            &stats,
        )
        .unwrap();
        assert!(matches!(
            small.unserialize(&cp, "m"),
            Err(CheckpointError::Mismatch { .. })
        ));
    }
}
