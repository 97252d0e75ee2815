//! Fully-associative LRU tag store that reports hit/miss counts for every power-of-two cache size
//! from 128KiB up to its configured size in a single pass.
//!
//! All blocks live on one recency list.  Size class `i` (128KiB << i) covers the first
//! `(128KiB << i) / block_size` blocks of that list; `boundaries[i]` names the last block inside
//! the window and each block carries a bit per class saying whether it currently sits inside that
//! window.  An access is a hit for class `i` iff the block's bit `i` is set, so one lookup answers
//! the question for every size at once.  Because smaller windows are prefixes of larger ones, a
//! block's mask always has the form "all classes from some `k` upward".
//!
//! The list is an arena of blocks linked by index; the tag index is a hash map from block address
//! to arena slot.

use std::collections::HashMap;

use log::info;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, CheckpointOut, Serializable};
use crate::error::{require_at_least, require_pow2, CheckpointError, ConfigError, ConfigResult};
use crate::sim::config::Config;
use crate::stats::{Counter, CounterVec, StatsSink};
use crate::timeq::Cycle;

pub type BlockId = usize;

/// Smallest tracked size class, log2(128KiB).
const MIN_CLASS_LOG2: u32 = 17;
const MAX_CLASSES: u32 = u32::BITS;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct FalruConfig {
    pub block_size: u64,
    pub size: u64,
    pub hit_latency: Cycle,
}

impl Config for FalruConfig {}

impl Default for FalruConfig {
    fn default() -> Self {
        Self {
            block_size: 64,
            size: 1 << 20,
            hit_latency: 2,
        }
    }
}

#[derive(Debug, Clone)]
struct FalruBlock {
    tag: u64,
    valid: bool,
    touched: bool,
    in_cache: u32,
    prev: Option<BlockId>,
    next: Option<BlockId>,
}

/// Counters for one simulated cache size.  `warm_*` exclude accesses made before the tag store
/// first filled up, and are zero until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeClassStats {
    pub size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub warm_hits: u64,
    pub warm_misses: u64,
}

pub fn size_label(bytes: u64) -> String {
    if bytes >= 1 << 30 && bytes % (1 << 30) == 0 {
        format!("{}GiB", bytes >> 30)
    } else if bytes >= 1 << 20 && bytes % (1 << 20) == 0 {
        format!("{}MiB", bytes >> 20)
    } else if bytes >= 1 << 10 && bytes % (1 << 10) == 0 {
        format!("{}KiB", bytes >> 10)
    } else {
        format!("{}B", bytes)
    }
}

pub struct FalruCache {
    name: String,
    block_size: u64,
    size: u64,
    hit_latency: Cycle,
    num_classes: usize,
    class_mask: u32,
    blocks: Vec<FalruBlock>,
    head: BlockId,
    tail: BlockId,
    boundaries: Vec<BlockId>,
    tag_index: HashMap<u64, BlockId>,
    warmed_up: bool,
    warmup_bound: u64,
    warm_base: Option<(Vec<u64>, Vec<u64>)>,
    // one slot per size class plus the full configured size
    hits: CounterVec,
    misses: CounterVec,
    accesses: Counter,
    replacements: Counter,
    tags_in_use: Counter,
    warmup_access: Counter,
}

impl FalruCache {
    pub fn new(
        name: impl Into<String>,
        config: &FalruConfig,
        stats: &StatsSink,
    ) -> ConfigResult<Self> {
        let name = name.into();
        require_pow2("cache block size (in bytes)", config.block_size)?;
        require_pow2("cache size", config.size)?;
        require_at_least("access latency in cycles", config.hit_latency, 1)?;
        require_at_least("cache size", config.size, config.block_size)?;

        let num_classes = config.size.ilog2().saturating_sub(MIN_CLASS_LOG2);
        if num_classes > MAX_CLASSES {
            return Err(ConfigError::Invalid {
                what: "cache size",
                reason: format!("{} size classes exceed the {} tracked", num_classes, MAX_CLASSES),
            });
        }
        if num_classes > 0 && config.block_size > 1 << MIN_CLASS_LOG2 {
            return Err(ConfigError::Invalid {
                what: "cache block size",
                reason: format!(
                    "{} does not fit the smallest tracked size {}",
                    size_label(config.block_size),
                    size_label(1 << MIN_CLASS_LOG2)
                ),
            });
        }
        let num_classes = num_classes as usize;
        let class_mask = if num_classes == 0 {
            0
        } else {
            u32::MAX >> (MAX_CLASSES as usize - num_classes)
        };

        let labels: Vec<String> = (0..=num_classes)
            .map(|i| {
                if i == num_classes {
                    size_label(config.size)
                } else {
                    size_label(1u64 << (MIN_CLASS_LOG2 as usize + i))
                }
            })
            .collect();

        let num_blocks = (config.size / config.block_size) as usize;
        let mut cache = Self {
            block_size: config.block_size,
            size: config.size,
            hit_latency: config.hit_latency,
            num_classes,
            class_mask,
            blocks: Vec::with_capacity(num_blocks),
            head: 0,
            tail: num_blocks - 1,
            boundaries: Vec::with_capacity(num_classes),
            tag_index: HashMap::with_capacity(num_blocks),
            warmed_up: false,
            warmup_bound: num_blocks as u64,
            warm_base: None,
            hits: stats.counter_vec(&format!("{}.hits", name), labels.as_slice())?,
            misses: stats.counter_vec(&format!("{}.misses", name), labels.as_slice())?,
            accesses: stats.counter(format!("{}.accesses", name))?,
            replacements: stats.counter(format!("{}.replacements", name))?,
            tags_in_use: stats.counter(format!("{}.tags_in_use", name))?,
            warmup_access: stats.counter(format!("{}.warmup_access", name))?,
            name,
        };
        cache.reset_tags();
        Ok(cache)
    }

    /// Invalidate everything and lay the blocks out in arena order, with masks and boundaries as
    /// if that order were the recency order.
    fn reset_tags(&mut self) {
        let num_blocks = (self.size / self.block_size) as usize;
        self.blocks.clear();
        self.boundaries.clear();
        self.tag_index.clear();
        for idx in 0..num_blocks {
            self.blocks.push(FalruBlock {
                tag: 0,
                valid: false,
                touched: false,
                in_cache: 0,
                prev: idx.checked_sub(1),
                next: (idx + 1 < num_blocks).then_some(idx + 1),
            });
        }
        for class in 0..self.num_classes {
            let window = self.class_window(class);
            for blk in &mut self.blocks[..window] {
                blk.in_cache |= 1 << class;
            }
            self.boundaries.push(window - 1);
        }
        self.head = 0;
        self.tail = num_blocks - 1;
        self.warmed_up = false;
        self.warm_base = None;
        self.tags_in_use.set(0);
    }

    // Number of blocks inside size class `class`.
    fn class_window(&self, class: usize) -> usize {
        ((1u64 << (MIN_CLASS_LOG2 as usize + class)) / self.block_size) as usize
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hit_latency(&self) -> Cycle {
        self.hit_latency
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_size_classes(&self) -> usize {
        self.num_classes
    }

    pub fn class_mask(&self) -> u32 {
        self.class_mask
    }

    pub fn is_warmed_up(&self) -> bool {
        self.warmed_up
    }

    pub fn tags_in_use(&self) -> u64 {
        self.tags_in_use.value()
    }

    pub fn accesses(&self) -> u64 {
        self.accesses.value()
    }

    pub fn block_align(&self, addr: u64) -> u64 {
        addr & !(self.block_size - 1)
    }

    /// Size classes `blk` currently sits in.
    pub fn block_mask(&self, blk: BlockId) -> u32 {
        self.blocks[blk].in_cache
    }

    /// Valid block holding `addr`, without counting an access or touching recency.
    pub fn probe(&self, addr: u64) -> Option<BlockId> {
        self.tag_index
            .get(&self.block_align(addr))
            .copied()
            .filter(|&blk| self.blocks[blk].valid)
    }

    /// Look up `addr`, counting a hit or miss for every size class, and promote a hit to most
    /// recently used.  The latency is the fixed tag access time either way.
    pub fn lookup(&mut self, addr: u64) -> (Option<BlockId>, Cycle) {
        self.accesses.inc();
        let found = self.probe(addr);
        match found {
            Some(blk) => {
                debug_assert_eq!(self.blocks[blk].tag, self.block_align(addr));
                let mask = self.blocks[blk].in_cache;
                for class in 0..self.num_classes {
                    if mask & (1 << class) != 0 {
                        self.hits.get(class).inc();
                    } else {
                        self.misses.get(class).inc();
                    }
                }
                self.hits.get(self.num_classes).inc();
                self.move_to_head(blk);
            }
            None => {
                for class in 0..=self.num_classes {
                    self.misses.get(class).inc();
                }
            }
        }
        (found, self.hit_latency)
    }

    /// Recycle the least recently used block for `addr` after a missed lookup.  If `addr` is in
    /// fact present its block is promoted and returned instead.
    pub fn insert_after_miss(&mut self, addr: u64) -> BlockId {
        if let Some(blk) = self.probe(addr) {
            self.move_to_head(blk);
            return blk;
        }
        let blk = self.tail;
        debug_assert_eq!(0, self.blocks[blk].in_cache, "tail sits inside a size class");
        self.move_to_head(blk);

        if self.blocks[blk].valid {
            let old = self.blocks[blk].tag;
            self.tag_index.remove(&old);
            self.replacements.inc();
        } else {
            self.tags_in_use.inc();
            self.blocks[blk].touched = true;
            if !self.warmed_up && self.tags_in_use.value() >= self.warmup_bound {
                self.mark_warmed_up();
            }
        }

        let tag = self.block_align(addr);
        let block = &mut self.blocks[blk];
        block.tag = tag;
        block.valid = true;
        self.tag_index.insert(tag, blk);
        blk
    }

    fn mark_warmed_up(&mut self) {
        self.warmed_up = true;
        self.warmup_access.set(self.accesses.value());
        self.warm_base = Some((self.hits.values(), self.misses.values()));
        info!(
            "{}: warmed up after {} accesses ({} tags)",
            self.name,
            self.accesses.value(),
            self.tags_in_use.value()
        );
    }

    /// Drop `addr` from the tag store.  The block keeps its list position and is recycled when it
    /// reaches the tail.
    pub fn invalidate(&mut self, addr: u64) -> bool {
        let tag = self.block_align(addr);
        match self.tag_index.remove(&tag) {
            Some(blk) if self.blocks[blk].valid => {
                self.blocks[blk].valid = false;
                self.blocks[blk].touched = false;
                self.tags_in_use.sub(1);
                true
            }
            _ => false,
        }
    }

    fn move_to_head(&mut self, blk: BlockId) {
        if blk == self.head {
            return;
        }
        let update_mask = self.blocks[blk].in_cache ^ self.class_mask;
        for class in 0..self.num_classes {
            let boundary = self.boundaries[class];
            if update_mask & (1 << class) != 0 {
                // blk enters the window and pushes the boundary block out
                self.blocks[boundary].in_cache &= !(1 << class);
                self.boundaries[class] = self.blocks[boundary].prev.unwrap_or(blk);
            } else if boundary == blk {
                self.boundaries[class] = self.blocks[blk]
                    .prev
                    .expect("non-head block has a predecessor");
            }
        }
        self.blocks[blk].in_cache = self.class_mask;

        let prev = self.blocks[blk].prev.expect("non-head block has a predecessor");
        let next = self.blocks[blk].next;
        self.blocks[prev].next = next;
        match next {
            Some(next) => self.blocks[next].prev = Some(prev),
            None => self.tail = prev,
        }
        self.blocks[blk].prev = None;
        self.blocks[blk].next = Some(self.head);
        self.blocks[self.head].prev = Some(blk);
        self.head = blk;
    }

    /// Walk the recency list and verify links, per-block masks, boundaries and the tag index.
    pub fn check(&self) -> bool {
        let mut bytes = 0u64;
        let mut boundary = 1u64 << MIN_CLASS_LOG2;
        let mut class = 0;
        let mut flags = self.class_mask;
        let mut count = 0;
        let mut prev = None;
        let mut cursor = Some(self.head);
        while let Some(blk) = cursor {
            let block = &self.blocks[blk];
            if block.prev != prev || block.in_cache != flags {
                return false;
            }
            if block.valid && self.tag_index.get(&block.tag) != Some(&blk) {
                return false;
            }
            bytes += self.block_size;
            count += 1;
            if class < self.num_classes && bytes == boundary {
                if self.boundaries[class] != blk {
                    return false;
                }
                flags &= !(1 << class);
                boundary <<= 1;
                class += 1;
            }
            prev = Some(blk);
            cursor = block.next;
        }
        prev == Some(self.tail)
            && count == self.blocks.len()
            && class == self.num_classes
            && self.tag_index.len() as u64 == self.tags_in_use.value()
    }

    /// Hit/miss counts for each tracked size, smallest first; the last entry is the full size.
    pub fn size_stats(&self) -> Vec<SizeClassStats> {
        let hits = self.hits.values();
        let misses = self.misses.values();
        (0..=self.num_classes)
            .map(|k| {
                let size_bytes = if k == self.num_classes {
                    self.size
                } else {
                    1u64 << (MIN_CLASS_LOG2 as usize + k)
                };
                let (warm_hits, warm_misses) = match &self.warm_base {
                    Some((base_hits, base_misses)) => {
                        (hits[k] - base_hits[k], misses[k] - base_misses[k])
                    }
                    None => (0, 0),
                };
                SizeClassStats {
                    size_bytes,
                    hits: hits[k],
                    misses: misses[k],
                    warm_hits,
                    warm_misses,
                }
            })
            .collect()
    }
}

impl Serializable for FalruCache {
    // Tag contents are rebuilt by replay; only the geometry is recorded.
    fn serialize(&self, out: &mut CheckpointOut) {
        out.param_u64("block_size", self.block_size);
        out.param_u64("size", self.size);
        out.param_u64("hit_latency", self.hit_latency);
    }

    fn unserialize(&mut self, cp: &Checkpoint, section: &str) -> Result<(), CheckpointError> {
        let block_size = cp.u64(section, "block_size")?;
        let size = cp.u64(section, "size")?;
        if block_size != self.block_size || size != self.size {
            return Err(CheckpointError::Mismatch {
                section: section.to_string(),
                reason: format!(
                    "checkpoint geometry {}/{} blocks, cache is {}/{}",
                    size_label(size),
                    size_label(block_size),
                    size_label(self.size),
                    size_label(self.block_size)
                ),
            });
        }
        self.reset_tags();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn cache(block_size: u64, size: u64, stats: &StatsSink) -> FalruCache {
        let config = FalruConfig {
            block_size,
            size,
            hit_latency: 2,
        };
        FalruCache::new("l2", &config, stats).unwrap()
    }

    fn access(c: &mut FalruCache, addr: u64) -> bool {
        let (blk, lat) = c.lookup(addr);
        assert_eq!(c.hit_latency(), lat);
        if blk.is_none() {
            c.insert_after_miss(addr);
        }
        blk.is_some()
    }

    fn is_prefix_mask(mask: u32, class_mask: u32) -> bool {
        let expected = if mask == 0 {
            0
        } else {
            class_mask & !((1u32 << mask.trailing_zeros()) - 1)
        };
        mask == expected
    }

    #[test]
    fn rejects_bad_geometry() {
        let stats = StatsSink::new();
        let bad = |block_size, size, hit_latency| {
            FalruCache::new(
                "x",
                &FalruConfig {
                    block_size,
                    size,
                    hit_latency,
                },
                &stats,
            )
            .err()
        };
        assert!(matches!(bad(48, 1 << 20, 1), Some(ConfigError::NotPowerOfTwo { .. })));
        assert!(matches!(bad(64, 3 << 20, 1), Some(ConfigError::NotPowerOfTwo { .. })));
        assert!(matches!(bad(64, 1 << 20, 0), Some(ConfigError::TooSmall { .. })));
        assert!(matches!(bad(1 << 18, 1 << 20, 1), Some(ConfigError::Invalid { .. })));
    }

    #[test]
    fn size_classes_span_128k_to_configured_size() {
        let stats = StatsSink::new();
        let c = cache(64, 1 << 20, &stats);
        assert_eq!(3, c.num_size_classes());
        assert_eq!(16384, c.num_blocks());
        let sizes: Vec<u64> = c.size_stats().iter().map(|s| s.size_bytes).collect();
        assert_eq!(vec![128 << 10, 256 << 10, 512 << 10, 1 << 20], sizes);
        assert!(stats.get("l2.hits::128KiB").is_some());
        assert!(stats.get("l2.misses::1MiB").is_some());
        assert!(c.check());
    }

    #[test]
    fn small_cache_has_no_size_classes() {
        let stats = StatsSink::new();
        let mut c = cache(64, 4 << 10, &stats);
        assert_eq!(0, c.num_size_classes());
        assert!(!access(&mut c, 0x40));
        assert!(access(&mut c, 0x40));
        assert!(c.check());
        assert_eq!(1, c.size_stats()[0].hits);
    }

    #[test]
    fn hit_after_insert_and_lru_eviction() {
        let stats = StatsSink::new();
        let mut c = cache(64, 4 << 10, &stats);
        // 64 blocks; touch 65 distinct lines, the first one is evicted
        for i in 0..65u64 {
            assert!(!access(&mut c, i * 64));
        }
        assert!(c.probe(0).is_none());
        assert!(c.probe(64).is_some());
        assert_eq!(1, stats.get("l2.replacements").unwrap());
        assert!(c.is_warmed_up());
        assert!(c.check());
    }

    #[test]
    fn promoted_block_survives_eviction() {
        let stats = StatsSink::new();
        let mut c = cache(64, 4 << 10, &stats);
        for i in 0..64u64 {
            access(&mut c, i * 64);
        }
        assert!(access(&mut c, 0));
        access(&mut c, 64 * 100);
        assert!(c.probe(0).is_some());
        assert!(c.probe(64).is_none());
    }

    #[test]
    fn latency_is_fixed_on_miss() {
        let stats = StatsSink::new();
        let mut c = cache(64, 1 << 20, &stats);
        assert_eq!((None, 2), c.lookup(0x1000));
    }

    #[test]
    fn masks_stay_prefix_closed_and_counters_consistent() {
        let stats = StatsSink::new();
        let mut c = cache(64, 1 << 20, &stats);
        let mut rng = StdRng::seed_from_u64(0xfa1);
        for step in 0..40_000u64 {
            // mix of a hot set and a wide cold range
            let line = if rng.gen_bool(0.6) {
                rng.gen_range(0..4_000u64)
            } else {
                rng.gen_range(0..40_000u64)
            };
            let addr = line * 64 + rng.gen_range(0..64);
            let (blk, _) = c.lookup(addr);
            let blk = match blk {
                Some(blk) => blk,
                None => c.insert_after_miss(addr),
            };
            assert!(is_prefix_mask(c.block_mask(blk), c.class_mask()));
            if step % 5_000 == 0 {
                assert!(c.check());
                for b in 0..c.num_blocks() {
                    assert!(is_prefix_mask(c.block_mask(b), c.class_mask()));
                }
            }
        }
        assert!(c.check());
        let accesses = c.accesses();
        let stats_by_size = c.size_stats();
        for s in &stats_by_size {
            assert_eq!(accesses, s.hits + s.misses, "size {}", s.size_bytes);
        }
        // larger caches never miss more
        for pair in stats_by_size.windows(2) {
            assert!(pair[0].hits <= pair[1].hits);
        }
    }

    #[test]
    fn hit_in_small_class_implies_hit_in_larger() {
        let stats = StatsSink::new();
        let mut c = cache(64, 1 << 20, &stats);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20_000 {
            let addr = rng.gen_range(0..12_000u64) * 64;
            let before: Vec<u64> = c.size_stats().iter().map(|s| s.hits).collect();
            access(&mut c, addr);
            let after: Vec<u64> = c.size_stats().iter().map(|s| s.hits).collect();
            let hit: Vec<bool> = before.iter().zip(&after).map(|(b, a)| a > b).collect();
            for i in 0..hit.len() {
                if hit[i] {
                    assert!(hit[i..].iter().all(|&h| h));
                }
            }
        }
    }

    #[test]
    fn reuse_beyond_128k_misses_only_in_small_class() {
        let stats = StatsSink::new();
        let mut c = cache(64, 1 << 20, &stats);
        let hot = 0x1000u64;
        let mut next_cold = 0x100_0000u64;
        // 3000 distinct lines (~188KiB) between reuses of the hot line
        for _ in 0..10 {
            access(&mut c, hot);
            for _ in 0..3000 {
                access(&mut c, next_cold);
                next_cold += 64;
            }
        }
        let hot_before = c.size_stats();
        let (blk, _) = c.lookup(hot);
        assert!(blk.is_some());
        let hot_after = c.size_stats();
        // 128KiB misses the reuse, 256KiB and up hit it
        assert_eq!(hot_before[0].misses + 1, hot_after[0].misses);
        assert_eq!(hot_before[1].hits + 1, hot_after[1].hits);
        assert_eq!(hot_before[3].hits + 1, hot_after[3].hits);
        assert!(hot_after[0].misses > hot_after[3].misses);
    }

    #[test]
    fn warm_stats_exclude_fill_transient() {
        let stats = StatsSink::new();
        let mut c = cache(64, 4 << 10, &stats);
        for i in 0..64u64 {
            access(&mut c, i * 64);
        }
        assert!(c.is_warmed_up());
        assert_eq!(Some(64), stats.get("l2.warmup_access"));
        for i in 0..64u64 {
            assert!(access(&mut c, i * 64));
        }
        let full = c.size_stats()[0];
        assert_eq!(64, full.warm_hits);
        assert_eq!(0, full.warm_misses);
        assert_eq!(64, full.misses);
    }

    #[test]
    fn invalidate_frees_tag() {
        let stats = StatsSink::new();
        let mut c = cache(64, 1 << 20, &stats);
        access(&mut c, 0x40);
        assert_eq!(1, c.tags_in_use());
        assert!(c.invalidate(0x40));
        assert!(!c.invalidate(0x40));
        assert!(c.probe(0x40).is_none());
        assert_eq!(0, c.tags_in_use());
        assert!(c.check());
        assert!(!access(&mut c, 0x40));
        assert!(c.check());
    }

    #[test]
    fn largest_block_size_with_classes() {
        let stats = StatsSink::new();
        // one block per 128KiB window
        let mut c = cache(128 << 10, 1 << 20, &stats);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            access(&mut c, rng.gen_range(0..32u64) << 17);
            assert!(c.check());
        }
    }

    #[test]
    fn restore_resets_tags_and_checks_geometry() {
        let stats = StatsSink::new();
        let mut c = cache(64, 1 << 20, &stats);
        access(&mut c, 0x80);
        let mut out = CheckpointOut::new();
        out.serialize_section("l2", &c);
        let cp = out.into_checkpoint();
        c.unserialize(&cp, "l2").unwrap();
        assert!(c.probe(0x80).is_none());
        assert!(c.check());

        let other_stats = StatsSink::new();
        let mut other = cache(128, 1 << 20, &other_stats);
        assert!(matches!(
            other.unserialize(&cp, "l2"),
            Err(CheckpointError::Mismatch { .. })
        ));
    }
}
