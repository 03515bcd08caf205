//! Cell values and records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Structural column exposing a record's development cycle
pub const CYCLE_COLUMN: &str = "cycle";

/// Structural column exposing a record's replicate id
pub const REPLICATE_COLUMN: &str = "replicate";

/// A single cell of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Category(String),
}

impl Value {
    /// Numeric view of the value (booleans map to 0/1)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Category(_) => None,
        }
    }

    /// Level label used for categorical grouping
    pub fn level(&self) -> String {
        match self {
            Value::Number(x) => format_number(*x),
            Value::Bool(b) => b.to_string(),
            Value::Category(s) => s.clone(),
        }
    }

    /// Build a value of the same kind as `self` carrying `x`
    ///
    /// Boolean cells stay boolean (`x != 0`), everything else becomes numeric.
    pub fn with_number(&self, x: f64) -> Value {
        match self {
            Value::Bool(_) => Value::Bool(x != 0.0),
            _ => Value::Number(x),
        }
    }

    /// Neutral default for a cell of this kind (false / zero)
    pub fn neutral(&self) -> Value {
        self.with_number(0.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Number(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Category(s.to_string())
    }
}

fn format_number(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{}", x)
    }
}

/// One row of a dataset: a record at a given cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identity key (e.g. claim id)
    pub id: String,

    /// Development cycle of this row
    pub cycle: u32,

    /// Replicate that produced this row, if simulated
    pub replicate: Option<u32>,

    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, cycle: u32) -> Self {
        Self {
            id: id.into(),
            cycle,
            replicate: None,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter used when assembling rows by hand
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.set(column, value.into());
        self
    }

    pub fn set(&mut self, column: &str, value: Value) {
        self.values.insert(column.to_string(), value);
    }

    /// Stored value of a column
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Numeric covariate, including the structural `cycle` and `replicate` columns
    pub fn numeric(&self, column: &str) -> Option<f64> {
        match column {
            CYCLE_COLUMN if !self.values.contains_key(column) => Some(self.cycle as f64),
            REPLICATE_COLUMN if !self.values.contains_key(column) => {
                self.replicate.map(|r| r as f64)
            }
            _ => self.values.get(column).and_then(Value::as_f64),
        }
    }

    /// Categorical level of a column, including the structural columns
    pub fn level(&self, column: &str) -> Option<String> {
        match column {
            CYCLE_COLUMN if !self.values.contains_key(column) => Some(self.cycle.to_string()),
            REPLICATE_COLUMN if !self.values.contains_key(column) => {
                self.replicate.map(|r| r.to_string())
            }
            _ => self.values.get(column).map(Value::level),
        }
    }

    /// True when the column holds a truthy value (non-zero number or `true`)
    pub fn flag(&self, column: &str) -> bool {
        self.numeric(column).map(|x| x != 0.0).unwrap_or(false)
    }

    pub fn has(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Copy of this row advanced to the next cycle
    pub fn next_cycle(&self) -> Result<Record> {
        let cycle = self.cycle.checked_add(1).ok_or_else(|| Error::Simulation {
            replicate: self.replicate.unwrap_or(0),
            cycle: self.cycle,
            layer: None,
            record: Some(self.id.clone()),
            reason: "cycle counter overflow".to_string(),
        })?;
        let mut next = self.clone();
        next.cycle = cycle;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_numeric_views() {
        assert_eq!(Value::Number(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
        assert_eq!(Value::Category("a".into()).as_f64(), None);
        assert_eq!(Value::Number(3.0).level(), "3");
        assert_eq!(Value::Number(0.5).level(), "0.5");
    }

    #[test]
    fn test_with_number_preserves_kind() {
        assert_eq!(Value::Bool(false).with_number(1.0), Value::Bool(true));
        assert_eq!(Value::Number(7.0).with_number(1.0), Value::Number(1.0));
        assert_eq!(Value::Bool(true).neutral(), Value::Bool(false));
        assert_eq!(Value::Number(9.0).neutral(), Value::Number(0.0));
    }

    #[test]
    fn test_structural_columns() {
        let mut record = Record::new("C1", 4).with("close", false);
        record.replicate = Some(2);

        assert_eq!(record.numeric(CYCLE_COLUMN), Some(4.0));
        assert_eq!(record.numeric(REPLICATE_COLUMN), Some(2.0));
        assert_eq!(record.level(CYCLE_COLUMN).as_deref(), Some("4"));
        assert!(!record.flag("close"));
        assert!(!record.flag("missing"));

        let next = record.next_cycle().unwrap();
        assert_eq!(next.cycle, 5);
        assert_eq!(next.id, "C1");
        assert_eq!(next.value("close"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_next_cycle_overflow_is_reported() {
        let mut record = Record::new("C9", u32::MAX);
        record.replicate = Some(3);
        match record.next_cycle() {
            Err(Error::Simulation { replicate, cycle, record, .. }) => {
                assert_eq!(replicate, 3);
                assert_eq!(cycle, u32::MAX);
                assert_eq!(record.as_deref(), Some("C9"));
            }
            other => panic!("expected overflow error, got {:?}", other),
        }
    }
}
