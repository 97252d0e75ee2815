//! Checkpoint plumbing.  A checkpoint is a toml document with one table per named section;
//! sections hold scalar and array fields by name.  Unsigned values are stored bit-for-bit in toml's
//! signed integers.

use toml::{Table, Value};

use crate::error::CheckpointError;

pub trait Serializable {
    /// Write this object's fields into the current section of `out`.
    fn serialize(&self, out: &mut CheckpointOut);

    /// Restore this object's fields from `section` of `cp`.
    fn unserialize(&mut self, cp: &Checkpoint, section: &str) -> Result<(), CheckpointError>;
}

#[derive(Debug, Default, Clone)]
pub struct CheckpointOut {
    root: Table,
    section: String,
}

impl CheckpointOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_section(&mut self, name: &str) {
        self.section = name.to_string();
        self.root
            .entry(name.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
    }

    /// Serialize `obj` into its own section.
    pub fn serialize_section<S: Serializable + ?Sized>(&mut self, name: &str, obj: &S) {
        let previous = std::mem::take(&mut self.section);
        self.set_section(name);
        obj.serialize(self);
        self.section = previous;
    }

    fn current(&mut self) -> &mut Table {
        let entry = self
            .root
            .entry(self.section.clone())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        entry.as_table_mut().expect("section is a table")
    }

    pub fn param_u64(&mut self, field: &str, value: u64) {
        self.current()
            .insert(field.to_string(), Value::Integer(value as i64));
    }

    pub fn param_bool(&mut self, field: &str, value: bool) {
        self.current()
            .insert(field.to_string(), Value::Boolean(value));
    }

    pub fn array_u64(&mut self, field: &str, values: &[u64]) {
        let array = values.iter().map(|&v| Value::Integer(v as i64)).collect();
        self.current().insert(field.to_string(), Value::Array(array));
    }

    pub fn to_toml_string(&self) -> Result<String, CheckpointError> {
        toml::to_string(&self.root).map_err(|err| CheckpointError::Parse(err.to_string()))
    }

    pub fn into_checkpoint(self) -> Checkpoint {
        Checkpoint { root: self.root }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Checkpoint {
    root: Table,
}

impl Checkpoint {
    pub fn parse(text: &str) -> Result<Self, CheckpointError> {
        let root: Table =
            toml::from_str(text).map_err(|err| CheckpointError::Parse(err.to_string()))?;
        Ok(Self { root })
    }

    pub fn has_section(&self, section: &str) -> bool {
        matches!(self.root.get(section), Some(Value::Table(_)))
    }

    fn field(&self, section: &str, field: &str) -> Result<&Value, CheckpointError> {
        let table = match self.root.get(section) {
            Some(Value::Table(table)) => table,
            _ => return Err(CheckpointError::MissingSection(section.to_string())),
        };
        table.get(field).ok_or_else(|| CheckpointError::MissingField {
            section: section.to_string(),
            field: field.to_string(),
        })
    }

    fn wrong_type(section: &str, field: &str, expected: &'static str) -> CheckpointError {
        CheckpointError::WrongType {
            section: section.to_string(),
            field: field.to_string(),
            expected,
        }
    }

    pub fn u64(&self, section: &str, field: &str) -> Result<u64, CheckpointError> {
        match self.field(section, field)? {
            Value::Integer(v) => Ok(*v as u64),
            _ => Err(Self::wrong_type(section, field, "integer")),
        }
    }

    pub fn bool(&self, section: &str, field: &str) -> Result<bool, CheckpointError> {
        match self.field(section, field)? {
            Value::Boolean(v) => Ok(*v),
            _ => Err(Self::wrong_type(section, field, "boolean")),
        }
    }

    pub fn str(&self, section: &str, field: &str) -> Result<&str, CheckpointError> {
        match self.field(section, field)? {
            Value::String(v) => Ok(v.as_str()),
            _ => Err(Self::wrong_type(section, field, "string")),
        }
    }

    pub fn array_u64(&self, section: &str, field: &str) -> Result<Vec<u64>, CheckpointError> {
        match self.field(section, field)? {
            Value::Array(values) => values
                .iter()
                .map(|v| match v {
                    Value::Integer(i) => Ok(*i as u64),
                    _ => Err(Self::wrong_type(section, field, "integer array")),
                })
                .collect(),
            _ => Err(Self::wrong_type(section, field, "integer array")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Regs {
        pc: u64,
        halted: bool,
        gprs: Vec<u64>,
    }

    impl Serializable for Regs {
        fn serialize(&self, out: &mut CheckpointOut) {
            out.param_u64("pc", self.pc);
            out.param_bool("halted", self.halted);
            out.array_u64("gprs", &self.gprs);
        }

        fn unserialize(&mut self, cp: &Checkpoint, section: &str) -> Result<(), CheckpointError> {
            self.pc = cp.u64(section, "pc")?;
            self.halted = cp.bool(section, "halted")?;
            self.gprs = cp.array_u64(section, "gprs")?;
            Ok(())
        }
    }

    #[test]
    fn sections_survive_text_form() {
        let regs = Regs {
            pc: u64::MAX - 3,
            halted: true,
            gprs: vec![1, 2, 1 << 63],
        };
        let mut out = CheckpointOut::new();
        out.serialize_section("system.cpu0", &regs);
        let text = out.to_toml_string().unwrap();

        let cp = Checkpoint::parse(&text).unwrap();
        let mut restored = Regs {
            pc: 0,
            halted: false,
            gprs: vec![],
        };
        restored.unserialize(&cp, "system.cpu0").unwrap();
        assert_eq!(regs.pc, restored.pc);
        assert!(restored.halted);
        assert_eq!(regs.gprs, restored.gprs);
    }

    #[test]
    fn missing_section_and_field_are_reported() {
        let mut out = CheckpointOut::new();
        out.set_section("a");
        out.param_u64("x", 1);
        let cp = out.into_checkpoint();
        assert_eq!(
            CheckpointError::MissingSection("b".to_string()),
            cp.u64("b", "x").unwrap_err()
        );
        assert!(matches!(
            cp.u64("a", "y"),
            Err(CheckpointError::MissingField { .. })
        ));
        assert!(matches!(
            cp.bool("a", "x"),
            Err(CheckpointError::WrongType { .. })
        ));
    }
}
