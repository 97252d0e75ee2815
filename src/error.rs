use thiserror::Error;

/// Broken machine descriptions.  These are raised while the simulated system is being built and
/// are not recoverable: the driver aborts the run with the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{what} must be a power of 2, got {value}")]
    NotPowerOfTwo { what: &'static str, value: u64 },

    #[error("{what} must be at least {min}, got {value}")]
    TooSmall {
        what: &'static str,
        value: u64,
        min: u64,
    },

    #[error("address range [{start:#x}, {end:#x}) of '{device}' overlaps '{other}' [{other_start:#x}, {other_end:#x})")]
    Overlap {
        device: String,
        start: u64,
        end: u64,
        other: String,
        other_start: u64,
        other_end: u64,
    },

    #[error("address range [{start:#x}, {end:#x}) is empty or inverted")]
    EmptyRange { start: u64, end: u64 },

    #[error("address map is full ({capacity} slots), cannot map '{device}'")]
    MapFull { device: String, capacity: usize },

    #[error("no mapping of '{device}' at [{start:#x}, {end:#x})")]
    RangeNotFound { device: String, start: u64, end: u64 },

    #[error("statistic '{0}' registered twice")]
    DuplicateStat(String),

    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
}

/// Inconsistent interconnect topology.  Treated like a configuration error by callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("{interconnect}: no supplier for address {paddr:#x}")]
    NoSupplier { interconnect: String, paddr: u64 },

    #[error("{interconnect}: multiple suppliers ({count}) for address {paddr:#x}")]
    AmbiguousSupplier {
        interconnect: String,
        paddr: u64,
        count: usize,
    },

    #[error("{interconnect}: unknown interface id {id}")]
    UnknownInterface { interconnect: String, id: usize },

    #[error("{interconnect}: response for request {req_id} has no originating master")]
    NoOrigin { interconnect: String, req_id: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("checkpoint section '{0}' not found")]
    MissingSection(String),

    #[error("checkpoint field '{section}.{field}' not found")]
    MissingField { section: String, field: String },

    #[error("checkpoint field '{section}.{field}' has the wrong type, expected {expected}")]
    WrongType {
        section: String,
        field: String,
        expected: &'static str,
    },

    #[error("cannot parse checkpoint: {0}")]
    Parse(String),

    #[error("checkpoint mismatch in '{section}': {reason}")]
    Mismatch { section: String, reason: String },

    #[error("cannot checkpoint with {0} requests in flight")]
    NotDrained(usize),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub(crate) fn require_pow2(what: &'static str, value: u64) -> ConfigResult<()> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ConfigError::NotPowerOfTwo { what, value })
    }
}

pub(crate) fn require_at_least(what: &'static str, value: u64, min: u64) -> ConfigResult<()> {
    if value >= min {
        Ok(())
    } else {
        Err(ConfigError::TooSmall { what, value, min })
    }
}
