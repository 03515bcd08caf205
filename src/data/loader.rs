//! Load and write datasets as CSV
//!
//! Each file has a header row. Two columns are structural: the record id and
//! the development cycle. Every other column becomes a value column whose
//! cells are typed as numbers, booleans or categories.

use csv::{Reader, Writer};
use std::path::Path;

use super::dataset::Dataset;
use super::value::{Record, Value, REPLICATE_COLUMN};
use crate::error::{Error, Result};

/// Names of the structural columns in a CSV file
#[derive(Debug, Clone)]
pub struct CsvLayout {
    pub id_column: String,
    pub cycle_column: String,
}

impl Default for CsvLayout {
    fn default() -> Self {
        Self {
            id_column: "claim_id".to_string(),
            cycle_column: "dev_year".to_string(),
        }
    }
}

/// Load a dataset from a CSV file
pub fn read_dataset<P: AsRef<Path>>(path: P, layout: &CsvLayout) -> Result<Dataset> {
    let reader = Reader::from_path(path)?;
    read_records(reader, layout)
}

/// Load a dataset from any reader (e.g., string buffer, network stream)
pub fn read_dataset_from_reader<R: std::io::Read>(reader: R, layout: &CsvLayout) -> Result<Dataset> {
    read_records(Reader::from_reader(reader), layout)
}

fn read_records<R: std::io::Read>(mut reader: Reader<R>, layout: &CsvLayout) -> Result<Dataset> {
    let headers = reader.headers()?.clone();

    let position = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| Error::schema(format!("CSV has no '{}' column", name)))
    };
    let id_idx = position(&layout.id_column)?;
    let cycle_idx = position(&layout.cycle_column)?;
    let replicate_idx = headers.iter().position(|h| h == REPLICATE_COLUMN);

    let value_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != id_idx && *i != cycle_idx && Some(*i) != replicate_idx)
        .map(|(i, h)| (i, h.to_string()))
        .collect();

    let mut dataset = Dataset::new(value_columns.iter().map(|(_, h)| h.clone()).collect());

    for (line, result) in reader.records().enumerate() {
        let record = result?;
        // Header is line 1
        let line = line + 2;

        let cycle: u32 = record[cycle_idx].trim().parse().map_err(|_| Error::Parse {
            line,
            message: format!("invalid cycle '{}'", &record[cycle_idx]),
        })?;

        let mut row = Record::new(record[id_idx].trim(), cycle);
        if let Some(idx) = replicate_idx {
            let replicate = record[idx].trim().parse().map_err(|_| Error::Parse {
                line,
                message: format!("invalid replicate '{}'", &record[idx]),
            })?;
            row.replicate = Some(replicate);
        }

        for (idx, name) in &value_columns {
            row.set(name, parse_cell(&record[*idx]));
        }
        dataset.push(row)?;
    }

    Ok(dataset)
}

/// Type a raw CSV cell
pub fn parse_cell(raw: &str) -> Value {
    let raw = raw.trim();
    match raw {
        "true" | "TRUE" | "True" => Value::Bool(true),
        "false" | "FALSE" | "False" => Value::Bool(false),
        _ => raw
            .parse::<f64>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::Category(raw.to_string())),
    }
}

/// Write a dataset to a CSV file
pub fn write_dataset<P: AsRef<Path>>(path: P, dataset: &Dataset, layout: &CsvLayout) -> Result<()> {
    let writer = Writer::from_path(path)?;
    write_records(writer, dataset, layout)
}

/// Write a dataset to any writer
pub fn write_dataset_to_writer<W: std::io::Write>(writer: W, dataset: &Dataset, layout: &CsvLayout) -> Result<()> {
    write_records(Writer::from_writer(writer), dataset, layout)
}

fn write_records<W: std::io::Write>(mut writer: Writer<W>, dataset: &Dataset, layout: &CsvLayout) -> Result<()> {
    let with_replicate = !dataset.replicate_ids().is_empty();

    let mut header = vec![layout.id_column.clone(), layout.cycle_column.clone()];
    if with_replicate {
        header.push(REPLICATE_COLUMN.to_string());
    }
    header.extend(dataset.columns().iter().cloned());
    writer.write_record(&header)?;

    for row in dataset.rows() {
        let mut out = vec![row.id.clone(), row.cycle.to_string()];
        if with_replicate {
            out.push(row.replicate.map(|r| r.to_string()).unwrap_or_default());
        }
        for column in dataset.columns() {
            out.push(row.value(column).map(Value::to_string).unwrap_or_default());
        }
        writer.write_record(&out)?;
    }

    writer.flush()?;
    Ok(())
}
