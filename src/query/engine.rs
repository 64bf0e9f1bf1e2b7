//! Narrow interface to the embedded SQL engine, and its SQLite implementation.

use std::sync::Arc;

use arrow::datatypes::DataType;
use rusqlite::types::ToSqlOutput;
use rusqlite::{params_from_iter, Connection, InterruptHandle, ToSql};
use tracing::debug;

use super::compiler::quote_ident;
use crate::codec::{from_sql, record_batch_rows, to_sql, RawValue};
use crate::error::{DataslotError, Result};
use crate::registry::BoundTable;

/// Positional query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Boolean, bound as 0/1.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Text.
    Text(String),
}

impl ToSql for ParamValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ParamValue::Bool(v) => ToSqlOutput::from(*v),
            ParamValue::Int(v) => ToSqlOutput::from(*v),
            ParamValue::Float(v) => ToSqlOutput::from(*v),
            ParamValue::Text(v) => ToSqlOutput::from(v.as_str()),
        })
    }
}

/// Interrupts an in-flight execution from another thread.
pub trait Canceller: Send + Sync {
    /// Best-effort cancellation; a no-op when nothing is running.
    fn cancel(&self);
}

/// Embedded engine as seen by the gateway.
pub trait QueryEngine: Send {
    /// Output column names of `sql`, without producing rows.
    fn probe_schema(&mut self, sql: &str, params: &[ParamValue]) -> Result<Vec<String>>;

    /// Runs `sql`, returning at most `row_limit` rows.
    fn execute(
        &mut self,
        sql: &str,
        params: &[ParamValue],
        row_limit: usize,
    ) -> Result<Vec<Vec<RawValue>>>;

    /// Handle that interrupts whatever this engine is executing.
    fn canceller(&self) -> Arc<dyn Canceller>;
}

/// In-memory SQLite database holding the bound workspace tables.
pub struct SqliteEngine {
    conn: Connection,
}

impl SqliteEngine {
    /// Opens an empty in-memory database.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Opens a database with every bound table loaded. `cancelled` is
    /// polled between record batches; loading stops once it returns true.
    pub fn with_tables<C>(tables: &[BoundTable], cancelled: C) -> Result<Self>
    where
        C: Fn() -> bool,
    {
        let mut engine = Self::in_memory()?;
        for table in tables {
            engine.load(table, &cancelled)?;
        }
        Ok(engine)
    }

    /// Copies a stored dataset into a table named after its binding.
    pub fn load<C>(&mut self, table: &BoundTable, cancelled: C) -> Result<()>
    where
        C: Fn() -> bool,
    {
        let schema = table.dataset.schema().clone();
        if schema.fields().is_empty() {
            return Err(DataslotError::Internal(format!(
                "dataset {} has no columns",
                table.dataset_id
            )));
        }
        let columns: Vec<String> = schema
            .fields()
            .iter()
            .map(|field| {
                format!("{} {}", quote_ident(field.name()), affinity(field.data_type()))
            })
            .collect();
        let name = quote_ident(&table.name);
        self.conn
            .execute(&format!("CREATE TABLE {name} ({})", columns.join(", ")), [])?;

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let insert = format!("INSERT INTO {name} VALUES ({})", placeholders.join(", "));
        let tx = self.conn.transaction()?;
        let mut rows = 0usize;
        {
            let mut stmt = tx.prepare(&insert)?;
            for batch in table.dataset.read_all()? {
                if cancelled() {
                    return Err(DataslotError::Internal(format!(
                        "loading {} abandoned",
                        table.name
                    )));
                }
                for row in record_batch_rows(&batch) {
                    stmt.execute(params_from_iter(row.into_iter().map(to_sql)))?;
                    rows += 1;
                }
            }
        }
        tx.commit()?;
        debug!(
            table = %table.name,
            dataset_id = %table.dataset_id,
            rows,
            "query.engine.table_loaded"
        );
        Ok(())
    }
}

fn affinity(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => "INTEGER",
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => "REAL",
        DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => "BLOB",
        _ => "TEXT",
    }
}

impl QueryEngine for SqliteEngine {
    fn probe_schema(&mut self, sql: &str, params: &[ParamValue]) -> Result<Vec<String>> {
        let stmt = self.conn.prepare(sql)?;
        if stmt.parameter_count() != params.len() {
            return Err(DataslotError::QueryExecution(format!(
                "query expects {} parameters, {} supplied",
                stmt.parameter_count(),
                params.len()
            )));
        }
        Ok(stmt.column_names().into_iter().map(str::to_string).collect())
    }

    fn execute(
        &mut self,
        sql: &str,
        params: &[ParamValue],
        row_limit: usize,
    ) -> Result<Vec<Vec<RawValue>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut out = Vec::new();
        while out.len() < row_limit {
            let Some(row) = rows.next()? else {
                break;
            };
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(from_sql(row.get_ref(idx)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn canceller(&self) -> Arc<dyn Canceller> {
        Arc::new(SqliteCanceller(self.conn.get_interrupt_handle()))
    }
}

struct SqliteCanceller(InterruptHandle);

impl Canceller for SqliteCanceller {
    fn cancel(&self) {
        self.0.interrupt();
    }
}
