use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

use crate::error::{require_at_least, ConfigError, ConfigResult};
use crate::mem::range::{AddrRange, PhysAddrLayout};

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    /// Hard stop for the event loop, in cycles.
    pub timeout: u64,
    pub seed: u64,
    /// Run the tag-store consistency walk after every issued access.
    pub check_tags: bool,
    /// Attach a tag-only cache model to each CPU port.
    pub model_tags: bool,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            timeout: 10000000,
            seed: 0,
            check_tags: false,
            model_tags: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct BankConfig {
    pub base: u64,
    pub size: u64,
}

impl BankConfig {
    pub fn range(&self) -> AddrRange {
        AddrRange::with_size(self.base, self.size)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemConfig {
    pub map_slots: usize,
    pub layout: PhysAddrLayout,
    pub banks: Vec<BankConfig>,
    /// Cycles from delivery at a bank to its response.
    pub latency: u64,
    /// Responses a bank may have pending before it pushes back; 0 is unlimited.
    pub max_outstanding: usize,
}

impl Config for MemConfig {}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            map_slots: 16,
            layout: PhysAddrLayout::default(),
            banks: vec![BankConfig {
                base: 0,
                size: 16 << 20,
            }],
            latency: 20,
            max_outstanding: 0,
        }
    }
}

impl MemConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.layout.validate()?;
        require_at_least("memory map slots", self.map_slots as u64, 1)?;
        if self.banks.is_empty() {
            return Err(ConfigError::Invalid {
                what: "memory banks",
                reason: "at least one bank is required".to_string(),
            });
        }
        if self.banks.len() > self.map_slots {
            return Err(ConfigError::Invalid {
                what: "memory banks",
                reason: format!("{} banks but {} map slots", self.banks.len(), self.map_slots),
            });
        }
        Ok(())
    }
}
