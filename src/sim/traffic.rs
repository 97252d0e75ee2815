use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};
use crate::mem::request::{MemCmd, ReqFlags};
use crate::sim::config::Config;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    pub num_cpus: usize,
    pub requests_per_cpu: u64,
    /// Cycles between two issues from the same CPU.
    pub issue_interval: u64,
    /// Requests a CPU keeps in flight before it stalls; 0 is unlimited.
    pub max_inflight: usize,
    pub pattern: TrafficPatternSpec,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            requests_per_cpu: 4096,
            issue_interval: 1,
            max_inflight: 8,
            pattern: TrafficPatternSpec::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficPatternSpec {
    /// strided | random | reuse | llsc
    pub kind: String,
    pub op: String,
    pub req_bytes: u32,
    pub base: u64,
    pub within_bytes: u64,
    pub stride: u64,
    /// `reuse`: every `reuse_every`th access returns to `base`.
    pub reuse_every: u64,
    pub seed: u64,
}

impl Default for TrafficPatternSpec {
    fn default() -> Self {
        Self {
            kind: "strided".to_string(),
            op: "read".to_string(),
            req_bytes: 8,
            base: 0,
            within_bytes: 1 << 20,
            stride: 64,
            reuse_every: 17,
            seed: 0,
        }
    }
}

/// One access produced by a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficOp {
    pub cmd: MemCmd,
    pub paddr: u64,
    pub size: u32,
    pub flags: ReqFlags,
}

#[derive(Debug, Clone)]
enum PatternKind {
    Strided { stride: u64 },
    Random,
    Reuse { every: u64, line: u64 },
    LlSc,
}

/// Address stream of one CPU.
#[derive(Debug)]
pub struct TrafficGen {
    kind: PatternKind,
    cmd: MemCmd,
    req_bytes: u32,
    base: u64,
    within: u64,
    lane: u64,
    issued: u64,
    rng: StdRng,
}

impl TrafficGen {
    pub fn new(spec: &TrafficPatternSpec, cpu: usize) -> ConfigResult<Self> {
        let req_bytes = spec.req_bytes.max(1);
        if !req_bytes.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                what: "traffic request size",
                value: req_bytes as u64,
            });
        }
        let within = spec.within_bytes.max(req_bytes as u64);
        let kind = match spec.kind.trim().to_ascii_lowercase().as_str() {
            "strided" => PatternKind::Strided {
                stride: spec.stride.max(req_bytes as u64),
            },
            "random" => PatternKind::Random,
            "reuse" => PatternKind::Reuse {
                every: spec.reuse_every.max(2),
                line: spec.stride.max(req_bytes as u64),
            },
            "llsc" => PatternKind::LlSc,
            other => {
                return Err(ConfigError::Invalid {
                    what: "traffic pattern kind",
                    reason: format!("'{}', expected strided|random|reuse|llsc", other),
                })
            }
        };
        Ok(Self {
            kind,
            cmd: parse_op(&spec.op)?,
            req_bytes,
            base: spec.base,
            within,
            lane: cpu as u64,
            issued: 0,
            rng: StdRng::seed_from_u64(
                spec.seed ^ (cpu as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
            ),
        })
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn next_op(&mut self) -> TrafficOp {
        let idx = self.issued;
        self.issued += 1;
        let size = self.req_bytes;
        let slots = (self.within / size as u64).max(1);
        let (cmd, offset, flags) = match self.kind {
            PatternKind::Strided { stride } => {
                let offset = (idx * stride + self.lane * size as u64) % self.within;
                (self.cmd, offset, ReqFlags::NONE)
            }
            PatternKind::Random => {
                let slot = self.rng.gen_range(0..slots);
                (self.cmd, slot * size as u64, ReqFlags::NONE)
            }
            PatternKind::Reuse { every, line } => {
                let offset = if idx % every == 0 {
                    0
                } else {
                    // Fresh lines in between, never returning to the hot one.
                    let fresh = idx - idx / every;
                    (fresh * line) % self.within
                };
                (self.cmd, offset, ReqFlags::NONE)
            }
            PatternKind::LlSc => {
                // Alternate load-locked and store-conditional on one shared lock word.
                let cmd = if idx % 2 == 0 {
                    MemCmd::Read
                } else {
                    MemCmd::Write
                };
                (cmd, 0, ReqFlags::LOCKED)
            }
        };
        TrafficOp {
            cmd,
            paddr: self.base + offset,
            size,
            flags,
        }
    }
}

fn parse_op(op: &str) -> ConfigResult<MemCmd> {
    match op.trim().to_ascii_lowercase().as_str() {
        "read" | "r" | "load" => Ok(MemCmd::Read),
        "write" | "w" | "store" => Ok(MemCmd::Write),
        other => Err(ConfigError::Invalid {
            what: "traffic op",
            reason: format!("'{}', expected read|write", other),
        }),
    }
}
