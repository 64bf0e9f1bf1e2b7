//! Paginated access into a stored dataset without full scans.

use serde::{Deserialize, Serialize};

use crate::codec::{encode_row, Cell, RawValue};
use crate::error::Result;

/// Largest page, in rows or columns, that a browse request may ask for.
pub const MAX_PAGE: usize = 100;

/// Tabular data split into independently readable row groups.
pub trait RowGroupSource {
    /// Row count of each group, in storage order.
    fn row_group_sizes(&self) -> &[usize];

    /// Column names in storage order.
    fn column_names(&self) -> Vec<String>;

    /// Reads the given groups restricted to `columns`, concatenated in
    /// group order, each row laid out in `columns` order.
    fn read_row_groups(&self, groups: &[usize], columns: &[String]) -> Result<Vec<Vec<RawValue>>>;

    /// Total rows across all groups.
    fn num_rows(&self) -> usize {
        self.row_group_sizes().iter().sum()
    }
}

/// Rows read from a source before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawGrid {
    /// Column names, in row layout order.
    pub columns: Vec<String>,
    /// Row-major values.
    pub rows: Vec<Vec<RawValue>>,
}

/// Returns rows `[row_start, row_start + n_rows)` of `columns`, touching only
/// the row groups that intersect that range.
pub fn read_chunk<S>(
    source: &S,
    columns: &[String],
    row_start: usize,
    n_rows: usize,
) -> Result<RawGrid>
where
    S: RowGroupSource + ?Sized,
{
    let empty = || RawGrid {
        columns: columns.to_vec(),
        rows: Vec::new(),
    };
    if n_rows == 0 {
        return Ok(empty());
    }
    let row_end = row_start.saturating_add(n_rows);

    let mut needed = Vec::new();
    let mut first_start = None;
    let mut group_start = 0usize;
    for (idx, &count) in source.row_group_sizes().iter().enumerate() {
        let group_end = group_start + count;
        if group_end > row_start && group_start < row_end {
            needed.push(idx);
            first_start.get_or_insert(group_start);
        }
        if group_end >= row_end {
            break;
        }
        group_start = group_end;
    }
    let Some(first_start) = first_start else {
        return Ok(empty());
    };

    let rows = source
        .read_row_groups(&needed, columns)?
        .into_iter()
        .skip(row_start - first_start)
        .take(n_rows)
        .collect();
    Ok(RawGrid {
        columns: columns.to_vec(),
        rows,
    })
}

/// Browse parameters as supplied by a caller; any values are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChunkRequest {
    /// First row requested.
    pub row_start: i64,
    /// First column requested.
    pub col_start: i64,
    /// Rows requested.
    pub n_rows: i64,
    /// Columns requested.
    pub n_cols: i64,
}

impl Default for ChunkRequest {
    fn default() -> Self {
        Self {
            row_start: 0,
            col_start: 0,
            n_rows: 20,
            n_cols: 20,
        }
    }
}

/// A request clamped into the valid window of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    /// First row served.
    pub row_start: usize,
    /// First column served.
    pub col_start: usize,
    /// Rows served.
    pub n_rows: usize,
    /// Columns served.
    pub n_cols: usize,
}

impl ChunkWindow {
    /// Clamps `request` against a dataset of `total_rows` x `total_cols`.
    ///
    /// Out-of-range starts snap to the last row or column; page sizes snap
    /// into `[1, MAX_PAGE]` and are then cut to what remains. An empty
    /// dataset yields the all-zero window.
    pub fn clamp(request: ChunkRequest, total_rows: usize, total_cols: usize) -> Self {
        if total_rows == 0 || total_cols == 0 {
            return Self {
                row_start: 0,
                col_start: 0,
                n_rows: 0,
                n_cols: 0,
            };
        }
        let page = |n: i64| usize::try_from(n.clamp(1, MAX_PAGE as i64)).unwrap_or(1);
        let start = |n: i64, total: usize| usize::try_from(n.max(0)).unwrap_or(0).min(total - 1);

        let row_start = start(request.row_start, total_rows);
        let col_start = start(request.col_start, total_cols);
        Self {
            row_start,
            col_start,
            n_rows: page(request.n_rows).min(total_rows - row_start),
            n_cols: page(request.n_cols).min(total_cols - col_start),
        }
    }
}

/// One browse page, encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Dataset the page was cut from.
    pub dataset_id: String,
    /// Rows in the dataset.
    pub total_rows: usize,
    /// Columns in the dataset.
    pub total_cols: usize,
    /// First row served.
    pub row_start: usize,
    /// First column served.
    pub col_start: usize,
    /// Rows served.
    pub n_rows: usize,
    /// Columns served.
    pub n_cols: usize,
    /// Names of the served columns.
    pub columns: Vec<String>,
    /// Encoded cells.
    pub rows: Vec<Vec<Cell>>,
}

/// Clamps `request` against `source` and reads the resulting page.
pub fn browse<S>(source: &S, dataset_id: &str, request: ChunkRequest) -> Result<Chunk>
where
    S: RowGroupSource + ?Sized,
{
    let all_columns = source.column_names();
    let total_rows = source.num_rows();
    let total_cols = all_columns.len();
    let window = ChunkWindow::clamp(request, total_rows, total_cols);

    let (columns, rows) = if window.n_rows == 0 || window.n_cols == 0 {
        (Vec::new(), Vec::new())
    } else {
        let columns = all_columns[window.col_start..window.col_start + window.n_cols].to_vec();
        let grid = read_chunk(source, &columns, window.row_start, window.n_rows)?;
        (grid.columns, grid.rows.into_iter().map(encode_row).collect())
    };

    Ok(Chunk {
        dataset_id: dataset_id.to_string(),
        total_rows,
        total_cols,
        row_start: window.row_start,
        col_start: window.col_start,
        n_rows: window.n_rows,
        n_cols: window.n_cols,
        columns,
        rows,
    })
}
