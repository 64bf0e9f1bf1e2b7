//! Query layer: pipeline compilation and bounded execution against the
//! current workspace tables.

mod compiler;
mod engine;
mod gateway;
mod pipeline;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::compiler::{compile, compile_json, quote_ident, CompiledQuery};
pub use self::engine::{Canceller, ParamValue, QueryEngine, SqliteEngine};
pub use self::gateway::{
    run_to_completion, validate_raw_sql, CancelToken, PreparedQuery, QueryGateway, QueryLimits,
    RowBudget,
};
pub use self::pipeline::{
    parse_steps, Aggregate, AggFn, Comparator, Condition, JoinKind, Merge, PipelineError, Step,
    StepError,
};

use crate::codec::Cell;
use crate::config::QuerySection;
use crate::error::{DataslotError, Result};
use crate::registry::{BoundTable, Workspace};

/// Bounded result of a raw or pipeline query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultGrid {
    /// Output column names.
    pub columns: Vec<String>,
    /// Encoded rows, each `columns.len()` wide.
    pub rows: Vec<Vec<Cell>>,
    /// True when the engine had more rows than the limit.
    pub truncated: bool,
    /// Why the grid was cut, when it was.
    pub note: Option<String>,
}

/// Raw query request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SqlRequest {
    /// Single SELECT/WITH statement over `t1`..`t3`.
    pub query: String,
    /// Cell budget.
    #[serde(default)]
    pub max_cells: Option<i64>,
    /// Row limit.
    #[serde(default)]
    pub max_rows: Option<i64>,
}

/// Pipeline request. Steps stay as raw JSON so a malformed step is reported
/// with its index.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OpsRequest {
    /// Pipeline steps.
    pub steps: Vec<Value>,
    /// Cell budget.
    #[serde(default)]
    pub max_cells: Option<i64>,
    /// Row limit.
    #[serde(default)]
    pub max_rows: Option<i64>,
}

/// Runs raw and pipeline queries over the workspace's current datasets.
#[derive(Debug, Clone)]
pub struct QueryService {
    workspace: Arc<Workspace>,
    gateway: QueryGateway,
    config: QuerySection,
}

impl QueryService {
    /// Service over `workspace` with the given limits.
    pub fn new(workspace: Arc<Workspace>, config: &QuerySection) -> Self {
        Self {
            workspace,
            gateway: QueryGateway::new(config),
            config: config.clone(),
        }
    }

    /// Validates and runs raw query text.
    pub async fn sql(&self, request: SqlRequest) -> Result<ResultGrid> {
        let sql = validate_raw_sql(&request.query)?;
        let tables = self.workspace.bound_tables()?;
        if tables.is_empty() {
            return Err(DataslotError::NoDatasets);
        }
        let limits = QueryLimits::resolve(request.max_cells, request.max_rows, &self.config);
        self.gateway
            .execute(limits, move |token| {
                let engine = SqliteEngine::with_tables(&tables, || token.is_cancelled())?;
                Ok((Box::new(engine) as Box<dyn QueryEngine>, PreparedQuery::raw(sql)))
            })
            .await
    }

    /// Compiles and runs a pipeline. Nothing is loaded unless every step
    /// validates.
    pub async fn ops(&self, request: OpsRequest) -> Result<ResultGrid> {
        let tables = self.workspace.bound_tables()?;
        let compiled = compile_json(
            &request.steps,
            &table_schemas(&tables),
            self.config.pipeline_limit_ceiling,
        )?;
        let limits = QueryLimits::resolve(request.max_cells, request.max_rows, &self.config);
        self.gateway
            .execute(limits, move |token| {
                let engine = SqliteEngine::with_tables(&tables, || token.is_cancelled())?;
                let query = PreparedQuery {
                    sql: compiled.sql,
                    params: compiled.params,
                };
                Ok((Box::new(engine) as Box<dyn QueryEngine>, query))
            })
            .await
    }
}

fn table_schemas(tables: &[BoundTable]) -> BTreeMap<String, Vec<String>> {
    tables
        .iter()
        .map(|table| {
            let columns = table
                .dataset
                .schema()
                .fields()
                .iter()
                .map(|field| field.name().clone())
                .collect();
            (table.name.clone(), columns)
        })
        .collect()
}
