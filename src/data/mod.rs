//! Records, datasets and CSV loading

mod value;
mod dataset;
pub mod loader;

pub use value::{Record, Value, CYCLE_COLUMN, REPLICATE_COLUMN};
pub use dataset::Dataset;
pub use loader::{read_dataset, read_dataset_from_reader, write_dataset, write_dataset_to_writer, CsvLayout};
