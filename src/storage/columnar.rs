//! Parquet-backed durable representation of a dataset.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::file::properties::WriterProperties;

use crate::codec::{raw_value, RawValue};
use crate::error::{DataslotError, IoContext, Result};
use crate::storage::chunk::RowGroupSource;

/// File name of the columnar representation inside a dataset directory.
pub const DATA_FILE: &str = "data.parquet";

/// Writes `batch` to `path`, splitting it into row groups of at most
/// `row_group_size` rows.
pub fn write_parquet(path: &Path, batch: &RecordBatch, row_group_size: usize) -> Result<()> {
    let file = File::create(path).at(path)?;
    let props = WriterProperties::builder()
        .set_max_row_group_size(row_group_size.max(1))
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|err| DataslotError::storage(path, err))?;
    writer
        .write(batch)
        .map_err(|err| DataslotError::storage(path, err))?;
    writer
        .close()
        .map_err(|err| DataslotError::storage(path, err))?;
    Ok(())
}

/// Handle on a materialized Parquet file with its footer metadata cached.
///
/// Opening reads only the footer; row data is fetched on demand, one
/// row-group range at a time.
#[derive(Debug, Clone)]
pub struct ParquetDataset {
    path: PathBuf,
    schema: SchemaRef,
    row_groups: Vec<usize>,
}

impl ParquetDataset {
    /// Opens `path` and reads its schema and row-group layout.
    pub fn open(path: &Path) -> Result<Self> {
        let builder = Self::reader(path)?;
        let row_groups = builder
            .metadata()
            .row_groups()
            .iter()
            .map(|group| usize::try_from(group.num_rows()).unwrap_or(0))
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            schema: builder.schema().clone(),
            row_groups,
        })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arrow schema of the stored table.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Number of columns.
    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    /// Reads the whole table.
    pub fn read_all(&self) -> Result<Vec<RecordBatch>> {
        let reader = Self::reader(&self.path)?
            .build()
            .map_err(|err| DataslotError::storage(&self.path, err))?;
        reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| DataslotError::storage(&self.path, err))
    }

    fn reader(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>> {
        let file = File::open(path).at(path)?;
        ParquetRecordBatchReaderBuilder::try_new(file).map_err(|err| DataslotError::storage(path, err))
    }
}

impl RowGroupSource for ParquetDataset {
    fn row_group_sizes(&self) -> &[usize] {
        &self.row_groups
    }

    fn column_names(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect()
    }

    fn read_row_groups(&self, groups: &[usize], columns: &[String]) -> Result<Vec<Vec<RawValue>>> {
        if columns.is_empty() {
            let rows = groups
                .iter()
                .filter_map(|&idx| self.row_groups.get(idx))
                .sum();
            return Ok(vec![Vec::new(); rows]);
        }
        let indices = columns
            .iter()
            .map(|name| {
                self.schema.index_of(name).map_err(|_| {
                    DataslotError::storage(&self.path, format!("unknown column '{name}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let builder = Self::reader(&self.path)?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
        let reader = builder
            .with_row_groups(groups.to_vec())
            .with_projection(mask)
            .build()
            .map_err(|err| DataslotError::storage(&self.path, err))?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|err| DataslotError::storage(&self.path, err))?;
            // Projection keeps file order; map back to the requested order.
            let schema = batch.schema();
            let positions = columns
                .iter()
                .map(|name| {
                    schema
                        .index_of(name)
                        .map_err(|err| DataslotError::storage(&self.path, err))
                })
                .collect::<Result<Vec<_>>>()?;
            for row in 0..batch.num_rows() {
                rows.push(
                    positions
                        .iter()
                        .map(|&pos| raw_value(batch.column(pos).as_ref(), row))
                        .collect(),
                );
            }
        }
        Ok(rows)
    }
}
