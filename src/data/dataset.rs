//! Tabular datasets of records sharing a column schema

use std::collections::{BTreeMap, BTreeSet};

use super::value::{Record, Value};
use crate::error::{Error, Result};

/// Ordered sequence of records sharing a common set of value columns
///
/// The identity key, cycle and replicate are structural fields of each
/// [`Record`]; `columns` lists the remaining value columns in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Record>,
}

impl Dataset {
    /// Empty dataset with the given value columns
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    /// Build a dataset, checking that every record carries every column
    pub fn from_records(columns: Vec<String>, rows: Vec<Record>) -> Result<Self> {
        for row in &rows {
            if let Some(missing) = columns.iter().find(|c| !row.has(c)) {
                return Err(Error::schema(format!(
                    "record '{}' at cycle {} has no value for column '{}'",
                    row.id, row.cycle, missing
                )));
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Fail with a schema error unless `column` is part of the schema
    pub fn require_column(&self, column: &str) -> Result<()> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(Error::schema(format!("column '{}' not found in dataset", column)))
        }
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Record] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a row; the row must carry every schema column
    pub fn push(&mut self, row: Record) -> Result<()> {
        if let Some(missing) = self.columns.iter().find(|c| !row.has(c)) {
            return Err(Error::schema(format!(
                "record '{}' has no value for column '{}'",
                row.id, missing
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Values of one column, row by row
    pub fn column(&self, column: &str) -> Result<Vec<&Value>> {
        self.require_column(column)?;
        Ok(self
            .rows
            .iter()
            .filter_map(|r| r.value(column))
            .collect())
    }

    /// Write a single cell
    pub fn set_value(&mut self, row: usize, column: &str, value: Value) -> Result<()> {
        self.require_column(column)?;
        let len = self.rows.len();
        let record = self.rows.get_mut(row).ok_or_else(|| {
            Error::schema(format!("row {} out of range ({} rows)", row, len))
        })?;
        record.set(column, value);
        Ok(())
    }

    /// Add a column to the schema, filling existing rows with `default`
    pub fn add_column(&mut self, column: &str, default: Value) {
        if self.has_column(column) {
            return;
        }
        self.columns.push(column.to_string());
        for row in &mut self.rows {
            row.set(column, default.clone());
        }
    }

    /// Rows satisfying the predicate, schema unchanged
    pub fn filter<F>(&self, predicate: F) -> Dataset
    where
        F: Fn(&Record) -> bool,
    {
        Dataset {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }

    /// Split into (matching, non-matching) rows
    pub fn partition<F>(self, predicate: F) -> (Dataset, Dataset)
    where
        F: Fn(&Record) -> bool,
    {
        let (yes, no): (Vec<Record>, Vec<Record>) = self.rows.into_iter().partition(|r| predicate(r));
        (
            Dataset { columns: self.columns.clone(), rows: yes },
            Dataset { columns: self.columns, rows: no },
        )
    }

    /// Append the rows of `other`; schemas must match as sets
    pub fn concat(mut self, other: Dataset) -> Result<Dataset> {
        if self.columns.is_empty() && self.rows.is_empty() {
            return Ok(other);
        }
        let mine: BTreeSet<&String> = self.columns.iter().collect();
        let theirs: BTreeSet<&String> = other.columns.iter().collect();
        if mine != theirs {
            return Err(Error::schema(format!(
                "cannot concatenate datasets with columns {:?} and {:?}",
                self.columns, other.columns
            )));
        }
        self.rows.extend(other.rows);
        Ok(self)
    }

    /// Row indices grouped by record id
    pub fn group_by_id(&self) -> BTreeMap<&str, Vec<usize>> {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            groups.entry(row.id.as_str()).or_default().push(i);
        }
        groups
    }

    /// Row indices grouped by the level of a column
    pub fn group_by(&self, column: &str) -> Result<BTreeMap<String, Vec<usize>>> {
        self.require_column(column)?;
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            if let Some(level) = row.level(column) {
                groups.entry(level).or_default().push(i);
            }
        }
        Ok(groups)
    }

    /// Latest-cycle row of every record, in order of first appearance
    pub fn latest_per_record(&self) -> Dataset {
        let mut order: Vec<&str> = Vec::new();
        let mut latest: BTreeMap<&str, &Record> = BTreeMap::new();
        for row in &self.rows {
            match latest.get(row.id.as_str()) {
                None => {
                    order.push(row.id.as_str());
                    latest.insert(row.id.as_str(), row);
                }
                Some(current) if row.cycle >= current.cycle => {
                    latest.insert(row.id.as_str(), row);
                }
                Some(_) => {}
            }
        }
        Dataset {
            columns: self.columns.clone(),
            rows: order.into_iter().filter_map(|id| latest.get(id).map(|r| (*r).clone())).collect(),
        }
    }

    /// Distinct replicate ids present in the dataset
    pub fn replicate_ids(&self) -> BTreeSet<u32> {
        self.rows.iter().filter_map(|r| r.replicate).collect()
    }

    /// Stamp every row with a replicate id
    pub fn with_replicate(mut self, replicate: u32) -> Dataset {
        for row in &mut self.rows {
            row.replicate = Some(replicate);
        }
        self
    }

    /// Copy of every row advanced by one cycle
    pub fn next_cycle(&self) -> Result<Dataset> {
        Ok(Dataset {
            columns: self.columns.clone(),
            rows: self.rows.iter().map(Record::next_cycle).collect::<Result<_>>()?,
        })
    }

    /// Largest cycle present
    pub fn max_cycle(&self) -> Option<u32> {
        self.rows.iter().map(|r| r.cycle).max()
    }
}
