//! Upload ingest, durable columnar files, and chunked reads.

pub mod chunk;
pub mod columnar;
pub mod fingerprint;
pub mod ingest;

pub use chunk::{browse, read_chunk, Chunk, ChunkRequest, ChunkWindow, RawGrid, RowGroupSource};
pub use columnar::{write_parquet, ParquetDataset, DATA_FILE};
pub use fingerprint::{fingerprint, is_fingerprint};
pub use ingest::{
    check_declared_size, parse_table, sanitize_file_name, validate_upload, SourceFormat,
    ValidatedUpload,
};
