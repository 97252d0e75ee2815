use std::fmt;
use std::rc::Rc;

use log::debug;
use serde::Deserialize;

use crate::base::mem::DeviceHandle;
use crate::error::{ConfigError, ConfigResult};

/// Half-open physical address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl AddrRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn with_size(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(size),
        }
    }

    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn intersects(&self, other: &AddrRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Physical addressing scheme of the simulated target.  Only `impl_bits` low bits are decoded;
/// `uncached_bit`, when set in an address, selects the uncached alias of the same location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PhysAddrLayout {
    pub impl_bits: u32,
    pub uncached_bit: Option<u32>,
}

impl Default for PhysAddrLayout {
    fn default() -> Self {
        Self {
            impl_bits: 40,
            uncached_bit: Some(43),
        }
    }
}

impl PhysAddrLayout {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.impl_bits == 0 || self.impl_bits > 64 {
            return Err(ConfigError::Invalid {
                what: "physical address width",
                reason: format!("{} bits is outside 1..=64", self.impl_bits),
            });
        }
        if let Some(bit) = self.uncached_bit {
            if bit >= 64 {
                return Err(ConfigError::Invalid {
                    what: "uncached alias bit",
                    reason: format!("bit {} does not exist", bit),
                });
            }
        }
        Ok(())
    }

    pub fn impl_mask(&self) -> u64 {
        if self.impl_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.impl_bits) - 1
        }
    }

    pub fn is_uncached(&self, addr: u64) -> bool {
        self.uncached_bit
            .map_or(false, |bit| addr & (1u64 << bit) != 0)
    }

    pub fn canonical(&self, addr: u64) -> u64 {
        let addr = match self.uncached_bit {
            Some(bit) => addr & !(1u64 << bit),
            None => addr,
        };
        addr & self.impl_mask()
    }

    pub fn canonical_range(&self, range: AddrRange) -> AddrRange {
        if range.is_empty() {
            return range;
        }
        let start = self.canonical(range.start);
        let last = self.canonical(range.end - 1);
        AddrRange::new(start, last.saturating_add(1))
    }
}

struct DeviceEntry {
    device: DeviceHandle,
    range: AddrRange,
}

/// Disjoint address ranges mapped to the devices that own them.  Lookups scan linearly and nudge
/// each hit one slot toward the front, so bursts to the same device settle near the head.
pub struct AddressRangeTable {
    entries: Vec<DeviceEntry>,
    capacity: usize,
    layout: PhysAddrLayout,
}

impl fmt::Debug for AddressRangeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|e| (e.device.borrow().name().to_string(), e.range)),
            )
            .finish()
    }
}

fn device_name(device: &DeviceHandle) -> String {
    device.borrow().name().to_string()
}

impl AddressRangeTable {
    pub fn new(capacity: usize, layout: PhysAddrLayout) -> ConfigResult<Self> {
        if capacity == 0 {
            return Err(ConfigError::TooSmall {
                what: "address map slots",
                value: 0,
                min: 1,
            });
        }
        layout.validate()?;
        Ok(Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            layout,
        })
    }

    pub fn layout(&self) -> PhysAddrLayout {
        self.layout
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_overlap(
        &self,
        device: &DeviceHandle,
        range: AddrRange,
        skip: Option<usize>,
    ) -> ConfigResult<()> {
        if range.is_empty() {
            return Err(ConfigError::EmptyRange {
                start: range.start,
                end: range.end,
            });
        }
        let clash = self
            .entries
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != skip)
            .find(|(_, entry)| entry.range.intersects(&range));
        match clash {
            Some((_, entry)) => Err(ConfigError::Overlap {
                device: device_name(device),
                start: range.start,
                end: range.end,
                other: device_name(&entry.device),
                other_start: entry.range.start,
                other_end: entry.range.end,
            }),
            None => Ok(()),
        }
    }

    /// Map `range` to `device`.  Fails without touching the table if the range overlaps an
    /// existing mapping or every slot is taken.
    pub fn add(&mut self, device: DeviceHandle, range: AddrRange) -> ConfigResult<()> {
        let range = self.layout.canonical_range(range);
        self.check_overlap(&device, range, None)?;
        if self.entries.len() >= self.capacity {
            return Err(ConfigError::MapFull {
                device: device_name(&device),
                capacity: self.capacity,
            });
        }
        debug!("map {} -> {}", range, device_name(&device));
        self.entries.push(DeviceEntry { device, range });
        Ok(())
    }

    fn position(&self, device: &DeviceHandle, range: AddrRange) -> ConfigResult<usize> {
        let range = self.layout.canonical_range(range);
        self.entries
            .iter()
            .position(|e| Rc::ptr_eq(&e.device, device) && e.range == range)
            .ok_or_else(|| ConfigError::RangeNotFound {
                device: device_name(device),
                start: range.start,
                end: range.end,
            })
    }

    /// Move an existing mapping of `device` from `old` to `new`.
    pub fn update(
        &mut self,
        device: &DeviceHandle,
        old: AddrRange,
        new: AddrRange,
    ) -> ConfigResult<()> {
        let idx = self.position(device, old)?;
        let new = self.layout.canonical_range(new);
        self.check_overlap(device, new, Some(idx))?;
        debug!("remap {} {} -> {}", device_name(device), self.entries[idx].range, new);
        self.entries[idx].range = new;
        Ok(())
    }

    pub fn remove(&mut self, device: &DeviceHandle, range: AddrRange) -> ConfigResult<()> {
        let idx = self.position(device, range)?;
        self.entries.remove(idx);
        Ok(())
    }

    /// Device owning `addr`.  A hit is swapped one slot toward the front.
    pub fn find(&mut self, addr: u64) -> Option<DeviceHandle> {
        let addr = self.layout.canonical(addr);
        let idx = self.entries.iter().position(|e| e.range.contains(addr))?;
        let device = Rc::clone(&self.entries[idx].device);
        if idx > 0 {
            self.entries.swap(idx, idx - 1);
        }
        Some(device)
    }

    /// Range containing `addr`, without reordering.
    pub fn find_range(&self, addr: u64) -> Option<AddrRange> {
        let addr = self.layout.canonical(addr);
        self.entries
            .iter()
            .find(|e| e.range.contains(addr))
            .map(|e| e.range)
    }

    /// Mappings in current search order.
    pub fn iter(&self) -> impl Iterator<Item = (AddrRange, &DeviceHandle)> {
        self.entries.iter().map(|e| (e.range, &e.device))
    }
}
